//! Allocation registry: an AVL tree keyed by virtual start address, recording
//! every live super-page allocation so `free` can recover the chunks a
//! `malloc` drew and return them to their reservoirs.
//!
//! Scope is deliberately narrow: only [`super::compose_allocation`] inserts
//! here, at the point it composes a multi-chunk allocation, and only
//! [`super::free`] removes, at the point it tears one down. Generic per-page
//! mapping (`address_space::map_page`/`unmap_page`) never touches this tree —
//! it maps identity, MMIO, and ACPI pages that were never drawn from a tier,
//! and those physical addresses must never be returned to a reservoir.
//!
//! Nodes live in a flat arena rather than behind `Box`/raw pointers, so the
//! tree is addressed by [`RegistryNodeId`] instead of cyclic references —
//! rotations and successor-swap deletion become index swaps with no unsafe
//! pointer juggling.

use super::chunk::Chunk;
use alloc::vec::Vec;
use spin::Mutex;

pub type RegistryNodeId = u32;
const NIL: RegistryNodeId = u32::MAX;

#[derive(Clone)]
struct Node {
    key: u64,
    /// Backing physical chunks this allocation was composed from, in the
    /// order [`super::compose_allocation`] mapped them.
    chunks: Vec<Chunk>,
    left: RegistryNodeId,
    right: RegistryNodeId,
    height: i32,
}

pub struct Registry {
    nodes: Vec<Node>,
    free: Vec<RegistryNodeId>,
    root: RegistryNodeId,
}

impl Registry {
    const fn new() -> Self {
        Self { nodes: Vec::new(), free: Vec::new(), root: NIL }
    }

    fn height(&self, id: RegistryNodeId) -> i32 {
        if id == NIL { 0 } else { self.nodes[id as usize].height }
    }

    fn balance(&self, id: RegistryNodeId) -> i32 {
        if id == NIL {
            0
        } else {
            self.height(self.nodes[id as usize].left) - self.height(self.nodes[id as usize].right)
        }
    }

    fn update_height(&mut self, id: RegistryNodeId) {
        let n = &self.nodes[id as usize];
        let (left, right) = (n.left, n.right);
        self.nodes[id as usize].height = 1 + core::cmp::max(self.height(left), self.height(right));
    }

    fn rotate_right(&mut self, y: RegistryNodeId) -> RegistryNodeId {
        let x = self.nodes[y as usize].left;
        let t2 = self.nodes[x as usize].right;
        self.nodes[x as usize].right = y;
        self.nodes[y as usize].left = t2;
        self.update_height(y);
        self.update_height(x);
        x
    }

    fn rotate_left(&mut self, x: RegistryNodeId) -> RegistryNodeId {
        let y = self.nodes[x as usize].right;
        let t2 = self.nodes[y as usize].left;
        self.nodes[y as usize].left = x;
        self.nodes[x as usize].right = t2;
        self.update_height(x);
        self.update_height(y);
        y
    }

    fn rebalance(&mut self, id: RegistryNodeId) -> RegistryNodeId {
        self.update_height(id);
        let bf = self.balance(id);
        if bf > 1 {
            if self.balance(self.nodes[id as usize].left) < 0 {
                let left = self.nodes[id as usize].left;
                self.nodes[id as usize].left = self.rotate_left(left);
            }
            return self.rotate_right(id);
        }
        if bf < -1 {
            if self.balance(self.nodes[id as usize].right) > 0 {
                let right = self.nodes[id as usize].right;
                self.nodes[id as usize].right = self.rotate_right(right);
            }
            return self.rotate_left(id);
        }
        id
    }

    fn alloc_node(&mut self, key: u64, chunks: Vec<Chunk>) -> RegistryNodeId {
        let node = Node { key, chunks, left: NIL, right: NIL, height: 1 };
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = node;
            id
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as RegistryNodeId
        }
    }

    fn insert_at(&mut self, id: RegistryNodeId, key: u64, chunks: Vec<Chunk>) -> RegistryNodeId {
        if id == NIL {
            return self.alloc_node(key, chunks);
        }
        if key < self.nodes[id as usize].key {
            let left = self.nodes[id as usize].left;
            self.nodes[id as usize].left = self.insert_at(left, key, chunks);
        } else if key > self.nodes[id as usize].key {
            let right = self.nodes[id as usize].right;
            self.nodes[id as usize].right = self.insert_at(right, key, chunks);
        } else {
            self.nodes[id as usize].chunks = chunks;
            return id;
        }
        self.rebalance(id)
    }

    /// Records a composed allocation starting at virtual address `addr`,
    /// backed by `chunks`. Called once, at the end of `compose_allocation`.
    pub fn add_entry(&mut self, addr: u64, chunks: Vec<Chunk>) {
        self.root = self.insert_at(self.root, addr, chunks);
    }

    fn min_key(&self, mut id: RegistryNodeId) -> RegistryNodeId {
        while self.nodes[id as usize].left != NIL {
            id = self.nodes[id as usize].left;
        }
        id
    }

    /// Removes the entry at `key`, if the subtree rooted at `id` holds one,
    /// and stashes its chunks in `taken`.
    fn take_at(&mut self, id: RegistryNodeId, key: u64, taken: &mut Option<Vec<Chunk>>) -> RegistryNodeId {
        if id == NIL {
            return NIL;
        }
        if key < self.nodes[id as usize].key {
            let left = self.nodes[id as usize].left;
            self.nodes[id as usize].left = self.take_at(left, key, taken);
        } else if key > self.nodes[id as usize].key {
            let right = self.nodes[id as usize].right;
            self.nodes[id as usize].right = self.take_at(right, key, taken);
        } else {
            let (left, right) = (self.nodes[id as usize].left, self.nodes[id as usize].right);
            if left == NIL || right == NIL {
                let replacement = if left != NIL { left } else { right };
                *taken = Some(core::mem::take(&mut self.nodes[id as usize].chunks));
                self.free.push(id);
                return if replacement == NIL { NIL } else { self.rebalance(replacement) };
            }
            // Two children: swap in the in-order successor's key/chunks,
            // recording the *original* node's chunks as taken, then delete
            // the successor (now holding the removed node's old chunks)
            // from the right subtree.
            let succ = self.min_key(right);
            let succ_key = self.nodes[succ as usize].key;
            let succ_chunks = self.nodes[succ as usize].chunks.clone();
            let removed_chunks = core::mem::replace(
                &mut self.nodes[id as usize].chunks,
                succ_chunks,
            );
            *taken = Some(removed_chunks);
            self.nodes[id as usize].key = succ_key;
            let mut discard = None;
            self.nodes[id as usize].right = self.take_at(right, succ_key, &mut discard);
        }
        self.rebalance(id)
    }

    /// Removes the entry at `addr` and returns its backing chunks, or `None`
    /// if no allocation starts there. Called once, at the start of `free`.
    pub fn take_entry(&mut self, addr: u64) -> Option<Vec<Chunk>> {
        let mut taken = None;
        self.root = self.take_at(self.root, addr, &mut taken);
        taken
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

pub fn add_entry(addr: u64, chunks: Vec<Chunk>) {
    REGISTRY.lock().add_entry(addr, chunks);
}

pub fn take_entry(addr: u64) -> Option<Vec<Chunk>> {
    REGISTRY.lock().take_entry(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::chunk::tier_size;

    fn one_chunk(phys: u64) -> Vec<Chunk> {
        alloc::vec![Chunk { size: tier_size(0), phys_start: phys }]
    }

    #[test]
    fn insert_and_take_roundtrip() {
        let mut reg = Registry::new();
        reg.add_entry(0x1000, one_chunk(0x1000));
        reg.add_entry(0x4000, one_chunk(0x4000));
        let taken = reg.take_entry(0x1000).expect("entry present");
        assert_eq!(taken[0].phys_start, 0x1000);
        assert!(reg.take_entry(0x1000).is_none());
        assert!(reg.take_entry(0x4000).is_some());
    }

    #[test]
    fn take_missing_entry_returns_none() {
        let mut reg = Registry::new();
        reg.add_entry(0x1000, one_chunk(0x1000));
        assert!(reg.take_entry(0x9000).is_none());
    }

    #[test]
    fn two_child_removal_preserves_other_entries() {
        let mut reg = Registry::new();
        for i in 0..8u64 {
            reg.add_entry(i * 0x1000, one_chunk(i * 0x1000));
        }
        // Remove a node guaranteed to have two children at this fill level.
        assert!(reg.take_entry(0x3000).is_some());
        for i in 0..8u64 {
            let addr = i * 0x1000;
            if addr == 0x3000 {
                continue;
            }
            assert!(reg.take_entry(addr).is_some(), "lost entry at {addr:#x}");
        }
    }

    #[test]
    fn stays_balanced_under_sequential_insert() {
        let mut reg = Registry::new();
        for i in 0..1000u64 {
            reg.add_entry(i * 0x1000, one_chunk(i * 0x1000));
        }
        let height = reg.height(reg.root);
        // AVL height bound: h <= 1.44 * log2(n+2)
        assert!((height as f64) < 1.44 * (1002f64).log2());
    }
}
