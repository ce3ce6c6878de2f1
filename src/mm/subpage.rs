//! Sub-page allocator: carves individual 4KiB pages into 16-byte slots for
//! allocations too small to justify a whole tier-0 chunk (scheduler task
//! structs, device-tree nodes, small kernel buffers).
//!
//! Each page holds 256 slots. The first four slots (64 bytes) are a control
//! header — a magic value, a free-slot count, a next-fit scan cursor, and a
//! 252-bit free bitmap — leaving exactly 252 usable data slots per page.
//!
//! Every allocation reserves one extra slot ahead of its data and stamps it
//! with the slot count, so [`try_free`] can recover an allocation's size
//! from its address alone; callers never have to carry the size back to
//! `free` the way the original C allocator's single-byte-per-run control
//! array required of its caller.

use super::chunk::Chunk;
use alloc::vec::Vec;
use spin::Mutex;

const SLOT_SIZE: usize = 16;
const SLOTS_PER_PAGE: usize = 4096 / SLOT_SIZE; // 256
const HEADER_SLOTS: usize = 4;
pub const DATA_SLOTS: usize = SLOTS_PER_PAGE - HEADER_SLOTS; // 252
const BITMAP_BYTES: usize = (DATA_SLOTS + 7) / 8; // 32

const MAGIC: u64 = 0x5550_5047_4550_4130; // "SUBPGEA0"

#[repr(C)]
struct Header {
    magic: u64,
    free_count: u16,
    next_hint: u16,
    bitmap: [u8; BITMAP_BYTES],
}

struct SubPage {
    phys_base: u64,
}

impl SubPage {
    fn virt_base(&self) -> u64 {
        super::paging::phys_to_virt(x86_64::PhysAddr::new(self.phys_base)).as_u64()
    }

    fn header(&self) -> &mut Header {
        unsafe { &mut *(self.virt_base() as *mut Header) }
    }

    fn data_slot_ptr(&self, slot: usize) -> *mut u8 {
        (self.virt_base() + ((HEADER_SLOTS + slot) * SLOT_SIZE) as u64) as *mut u8
    }

    fn bit_is_free(h: &Header, slot: usize) -> bool {
        h.bitmap[slot / 8] & (1 << (slot % 8)) == 0
    }

    fn set_bit(h: &mut Header, slot: usize, used: bool) {
        let mask = 1u8 << (slot % 8);
        if used {
            h.bitmap[slot / 8] |= mask;
        } else {
            h.bitmap[slot / 8] &= !mask;
        }
    }

    fn new(phys_base: u64) -> Self {
        let page = Self { phys_base };
        let h = page.header();
        h.magic = MAGIC;
        h.free_count = DATA_SLOTS as u16;
        h.next_hint = 0;
        h.bitmap = [0u8; BITMAP_BYTES];
        page
    }

    /// First-fit scan for `count` data slots plus the one-slot length
    /// prefix that makes the allocation self-describing, wrapping once.
    /// Returns a pointer past the prefix, to the data itself.
    fn try_alloc(&self, count: usize) -> Option<*mut u8> {
        let total = count + 1;
        let h = self.header();
        if (h.free_count as usize) < total {
            return None;
        }
        let start_hint = h.next_hint as usize;
        for offset in 0..DATA_SLOTS {
            let start = (start_hint + offset) % DATA_SLOTS;
            if start + total > DATA_SLOTS {
                continue;
            }
            if (start..start + total).all(|s| Self::bit_is_free(h, s)) {
                for s in start..start + total {
                    Self::set_bit(h, s, true);
                }
                h.free_count -= total as u16;
                h.next_hint = ((start + total) % DATA_SLOTS) as u16;
                unsafe { self.data_slot_ptr(start).write(count as u8) };
                return Some(self.data_slot_ptr(start + 1));
            }
        }
        None
    }

    fn owns(&self, ptr: u64) -> bool {
        let base = self.virt_base();
        ptr >= base + ((HEADER_SLOTS + 1) * SLOT_SIZE) as u64 && ptr < base + 4096
    }

    /// Frees the allocation at `ptr`, recovering its slot count from the
    /// length prefix written just ahead of it by [`try_alloc`].
    fn free(&self, ptr: u64) {
        let data_slot = (ptr - self.virt_base()) as usize / SLOT_SIZE - HEADER_SLOTS;
        let prefix_slot = data_slot - 1;
        let h = self.header();
        let count = unsafe { self.data_slot_ptr(prefix_slot).read() } as usize;
        let total = count + 1;
        for s in prefix_slot..prefix_slot + total {
            Self::set_bit(h, s, false);
        }
        h.free_count += total as u16;
    }
}

static PAGES: Mutex<Vec<SubPage>> = Mutex::new(Vec::new());

fn slots_for(size: usize) -> usize {
    (size + SLOT_SIZE - 1) / SLOT_SIZE
}

/// Largest request this allocator will take, leaving room for the one-slot
/// length prefix every allocation carries.
pub const MAX_SIZE: usize = (DATA_SLOTS - 1) * SLOT_SIZE;

/// Allocates `size` bytes (<= [`MAX_SIZE`]) from the sub-page pool, pulling a
/// fresh tier-0 page in when no existing page has room.
pub fn alloc(size: usize) -> Option<*mut u8> {
    let count = slots_for(size);
    if count + 1 > DATA_SLOTS {
        return None;
    }
    let mut pages = PAGES.lock();
    for p in pages.iter() {
        if let Some(ptr) = p.try_alloc(count) {
            return Some(ptr);
        }
    }
    let chunk: Chunk = super::pile::pile(0).get_chunk();
    if chunk.is_none() {
        return None;
    }
    let page = SubPage::new(chunk.phys_start);
    let ptr = page.try_alloc(count);
    pages.push(page);
    ptr
}

/// Returns whether `ptr` was handed out by this allocator, and if so, frees
/// it using the slot count recorded in its length prefix.
pub fn try_free(ptr: *mut u8) -> bool {
    let addr = ptr as u64;
    let pages = PAGES.lock();
    for p in pages.iter() {
        if p.owns(addr) {
            p.free(addr);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_leaves_252_data_slots() {
        assert_eq!(DATA_SLOTS, 252);
        assert_eq!(BITMAP_BYTES, 32);
    }

    #[test]
    fn slots_for_rounds_up() {
        assert_eq!(slots_for(1), 1);
        assert_eq!(slots_for(16), 1);
        assert_eq!(slots_for(17), 2);
    }

    #[test]
    fn max_size_leaves_room_for_length_prefix() {
        // One slot of the 252 is always reserved for the prefix byte, so the
        // largest request this allocator accepts is one slot short of full.
        assert_eq!(MAX_SIZE, (DATA_SLOTS - 1) * SLOT_SIZE);
        assert_eq!(slots_for(MAX_SIZE) + 1, DATA_SLOTS);
    }
}
