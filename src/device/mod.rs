//! Device and interrupt trees: arena-indexed so nodes are addressed by a
//! plain [`NodeId`] instead of raw parent/child/sibling pointers.

pub mod interrupt_tree;
pub mod tree;

pub use tree::{DeviceTree, NodeId};

use spin::Mutex;

static DEVICE_TREE: Mutex<DeviceTree> = Mutex::new(DeviceTree::new());

pub fn with_device_tree<R>(f: impl FnOnce(&mut DeviceTree) -> R) -> R {
    f(&mut DEVICE_TREE.lock())
}
