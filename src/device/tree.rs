//! Device tree: a rooted, arbitrary-fanout tree of named device nodes.
//! Children of a node are kept sorted by name so lookup is a binary search;
//! registering two devices with the same base name disambiguates the second
//! one by appending the smallest unused numeric suffix ("uart" -> "uart0",
//! next "uart" -> "uart1").

use alloc::string::String;
use alloc::vec::Vec;

pub type NodeId = u32;
const NIL: NodeId = u32::MAX;

pub struct DeviceNode {
    pub name: String,
    pub parent: NodeId,
    children: Vec<NodeId>,
    pub properties: Vec<(String, String)>,
}

pub struct DeviceTree {
    nodes: Vec<Option<DeviceNode>>,
    free: Vec<NodeId>,
    root: NodeId,
}

impl DeviceTree {
    pub const fn new() -> Self {
        Self { nodes: Vec::new(), free: Vec::new(), root: NIL }
    }

    fn alloc(&mut self, node: DeviceNode) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            (self.nodes.len() - 1) as NodeId
        }
    }

    pub fn root(&mut self) -> NodeId {
        if self.root == NIL {
            self.root = self.alloc(DeviceNode {
                name: String::from("/"),
                parent: NIL,
                children: Vec::new(),
                properties: Vec::new(),
            });
        }
        self.root
    }

    pub fn node(&self, id: NodeId) -> &DeviceNode {
        self.nodes[id as usize].as_ref().expect("dangling device NodeId")
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    fn child_name<'a>(&'a self, parent: NodeId, name: &str) -> Option<(usize, bool)> {
        let children = &self.node(parent).children;
        let mut lo = 0usize;
        let mut hi = children.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_name = &self.node(children[mid]).name;
            match mid_name.as_str().cmp(name) {
                core::cmp::Ordering::Less => lo = mid + 1,
                core::cmp::Ordering::Greater => hi = mid,
                core::cmp::Ordering::Equal => return Some((mid, true)),
            }
        }
        Some((lo, false))
    }

    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        match self.child_name(parent, name) {
            Some((idx, true)) => Some(self.node(parent).children[idx]),
            _ => None,
        }
    }

    fn disambiguate(&self, parent: NodeId, base: &str) -> String {
        if self.find_child(parent, base).is_none() {
            return String::from(base);
        }
        let mut suffix = 0u32;
        loop {
            let candidate = alloc::format!("{}{}", base, suffix);
            if self.find_child(parent, &candidate).is_none() {
                return candidate;
            }
            suffix += 1;
        }
    }

    /// Adds a child node under `parent`, disambiguating the name if a
    /// sibling already uses it, and returns the new node's id.
    pub fn add_child(&mut self, parent: NodeId, base_name: &str) -> NodeId {
        let name = self.disambiguate(parent, base_name);
        let (insert_at, _) = self.child_name(parent, &name).unwrap_or((0, false));
        let id = self.alloc(DeviceNode { name, parent, children: Vec::new(), properties: Vec::new() });
        self.nodes[parent as usize].as_mut().unwrap().children.insert(insert_at, id);
        id
    }

    pub fn set_property(&mut self, id: NodeId, key: &str, value: &str) {
        let node = self.nodes[id as usize].as_mut().expect("dangling device NodeId");
        if let Some(entry) = node.properties.iter_mut().find(|(k, _)| k == key) {
            entry.1 = String::from(value);
        } else {
            node.properties.push((String::from(key), String::from(value)));
        }
    }

    pub fn get_property<'a>(&'a self, id: NodeId, key: &str) -> Option<&'a str> {
        self.node(id).properties.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, id: NodeId) {
        let parent = self.node(id).parent;
        if parent != NIL {
            let siblings = &mut self.nodes[parent as usize].as_mut().unwrap().children;
            if let Some(pos) = siblings.iter().position(|&c| c == id) {
                siblings.remove(pos);
            }
        }
        self.nodes[id as usize] = None;
        self.free.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_stay_sorted() {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        tree.add_child(root, "uart");
        tree.add_child(root, "acpi");
        tree.add_child(root, "pci");
        let names: alloc::vec::Vec<_> = tree.children(root).iter().map(|&c| tree.node(c).name.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn duplicate_names_get_numeric_suffix() {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let a = tree.add_child(root, "uart");
        let b = tree.add_child(root, "uart");
        assert_eq!(tree.node(a).name, "uart");
        assert_eq!(tree.node(b).name, "uart0");
        let c = tree.add_child(root, "uart");
        assert_eq!(tree.node(c).name, "uart1");
    }

    #[test]
    fn find_child_uses_binary_search() {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        tree.add_child(root, "zzz");
        let target = tree.add_child(root, "mmm");
        tree.add_child(root, "aaa");
        assert_eq!(tree.find_child(root, "mmm"), Some(target));
        assert_eq!(tree.find_child(root, "nope"), None);
    }
}
