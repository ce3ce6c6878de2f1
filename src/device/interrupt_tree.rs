//! Interrupt tree: same arena-node shape as the device tree, but the root's
//! 256 children are indexed directly by interrupt vector rather than kept
//! sorted by name, and vector numbers are handed out with a lock-free CAS
//! loop instead of a mutex.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

pub type NodeId = u32;
const NIL: NodeId = u32::MAX;
const NUM_VECTORS: usize = 256;
const BITMAP_WORDS: usize = NUM_VECTORS / 32;

pub struct InterruptNode {
    pub vector: u8,
    pub name: String,
    pub children: Vec<NodeId>,
}

pub struct InterruptTree {
    nodes: Vec<Option<InterruptNode>>,
    free: Vec<NodeId>,
    roots: [NodeId; NUM_VECTORS],
}

impl InterruptTree {
    pub const fn new() -> Self {
        Self { nodes: Vec::new(), free: Vec::new(), roots: [NIL; NUM_VECTORS] }
    }

    fn alloc(&mut self, node: InterruptNode) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            (self.nodes.len() - 1) as NodeId
        }
    }

    pub fn node(&self, id: NodeId) -> &InterruptNode {
        self.nodes[id as usize].as_ref().expect("dangling interrupt NodeId")
    }

    pub fn root_for_vector(&self, vector: u8) -> Option<NodeId> {
        let id = self.roots[vector as usize];
        if id == NIL {
            None
        } else {
            Some(id)
        }
    }

    /// Registers a handler node at `vector`, which must already have been
    /// claimed through [`vector_alloc`].
    pub fn register(&mut self, vector: u8, name: &str) -> NodeId {
        let id = self.alloc(InterruptNode { vector, name: String::from(name), children: Vec::new() });
        self.roots[vector as usize] = id;
        id
    }

    pub fn add_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        let vector = self.node(parent).vector;
        let id = self.alloc(InterruptNode { vector, name: String::from(name), children: Vec::new() });
        self.nodes[parent as usize].as_mut().unwrap().children.push(id);
        id
    }

    pub fn unregister(&mut self, vector: u8) {
        let id = self.roots[vector as usize];
        if id != NIL {
            self.nodes[id as usize] = None;
            self.free.push(id);
            self.roots[vector as usize] = NIL;
        }
    }
}

static INTERRUPT_TREE: spin::Mutex<InterruptTree> = spin::Mutex::new(InterruptTree::new());

pub fn with_interrupt_tree<R>(f: impl FnOnce(&mut InterruptTree) -> R) -> R {
    f(&mut INTERRUPT_TREE.lock())
}

/// Bitmap of claimed vectors, manipulated purely with compare-and-swap so
/// allocation never has to take the interrupt tree's own lock.
static VECTOR_BITMAP: [AtomicU32; BITMAP_WORDS] = {
    const INIT: AtomicU32 = AtomicU32::new(0);
    [INIT; BITMAP_WORDS]
};

/// Claims the lowest-numbered free vector at or above `min_vector`,
/// returning `None` once every vector is taken.
pub fn vector_alloc(min_vector: u8) -> Option<u8> {
    for v in (min_vector as usize)..NUM_VECTORS {
        let word = v / 32;
        let bit = 1u32 << (v % 32);
        loop {
            let current = VECTOR_BITMAP[word].load(Ordering::Relaxed);
            if current & bit != 0 {
                break;
            }
            if VECTOR_BITMAP[word]
                .compare_exchange_weak(current, current | bit, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(v as u8);
            }
        }
    }
    None
}

pub fn vector_free(vector: u8) {
    let word = vector as usize / 32;
    let bit = 1u32 << (vector as usize % 32);
    VECTOR_BITMAP[word].fetch_and(!bit, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_alloc_is_monotonic_and_exclusive() {
        let a = vector_alloc(32).unwrap();
        let b = vector_alloc(32).unwrap();
        assert_ne!(a, b);
        assert!(a >= 32 && b >= 32);
        vector_free(a);
        vector_free(b);
    }

    #[test]
    fn register_and_lookup_root() {
        let mut tree = InterruptTree::new();
        let v = 40u8;
        let id = tree.register(v, "ioapic-irq8");
        assert_eq!(tree.root_for_vector(v), Some(id));
        assert_eq!(tree.node(id).name, "ioapic-irq8");
    }
}
