//! Minimal terminal sink.
//!
//! Early userspace and the kernel's own diagnostics need somewhere to write
//! fd 1/2 to; this is that somewhere. It owns no input handling and no
//! command line of its own — just an `ostream`-like byte sink over the
//! serial port, registered in the device tree so it shows up alongside
//! the rest of the platform's devices.

use crate::arch::x86_64::serial;
use spin::Mutex;

pub struct Terminal {
    lines_written: u64,
}

impl Terminal {
    const fn new() -> Self {
        Self { lines_written: 0 }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        serial::serial_write(bytes);
        self.lines_written += bytes.iter().filter(|&&b| b == b'\n').count() as u64;
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }
}

static TERMINAL: Mutex<Terminal> = Mutex::new(Terminal::new());

pub fn write_bytes(bytes: &[u8]) {
    TERMINAL.lock().write_bytes(bytes);
}

/// Registers the terminal as a child of the device-tree root so it's
/// discoverable the same way the rest of the platform's devices are.
pub fn register() {
    crate::device::with_device_tree(|tree| {
        let root = tree.root();
        let node = tree.add_child(root, "terminal");
        tree.set_property(node, "kind", "console");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_newlines() {
        let mut term = Terminal::new();
        term.write_bytes(b"hello\nworld\n");
        assert_eq!(term.lines_written(), 2);
    }
}
