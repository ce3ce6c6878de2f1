//! Memory management: the tiered chunk/reservoir/pile physical allocator,
//! the recursive-self-map address-space manager, the sub-page allocator for
//! small kernel objects, and the AVL allocation registry.

pub mod address_space;
pub mod chunk;
pub mod paging;
pub mod pile;
pub mod registry;
pub mod reservoir;
pub mod subpage;

use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

pub use chunk::{tier_for_size, tier_size, Chunk, NUM_TIERS, PAGE_SIZE};

/// Base of the kernel-global virtual region composed allocations are mapped
/// into, bump-allocator style — one page-table entry at a time, never
/// reused until reclaimed by a reboot. PML4 index 0x120, clear of the
/// physical linear map at index 0x100 ([`paging::PHYS_MAP_OFFSET`]) and the
/// self-map slots at 0x1fe/0x1ff.
const SUPERPAGE_REGION_BASE: u64 = 0xFFFF_9000_0000_0000;

static SUPERPAGE_BUMP: Mutex<u64> = Mutex::new(SUPERPAGE_REGION_BASE);

fn next_superpage_address(len: u64) -> VirtAddr {
    let mut bump = SUPERPAGE_BUMP.lock();
    let addr = *bump;
    *bump += len;
    VirtAddr::new(addr)
}

/// Seeds the allocator from the usable regions of the multiboot memory map
/// and establishes the kernel's physical linear map. Must run after the
/// heap is up (reservoirs grow their free lists on the heap) and before any
/// other subsystem asks for memory.
pub fn init(usable_regions: &[(u64, u64)], max_phys: u64) {
    for &(base, len) in usable_regions {
        pile::init_from_region(base, len);
    }

    unsafe {
        let mut mapper = paging::active_mapper();
        paging::map_physical_memory(&mut mapper, max_phys).expect("failed to map physical memory");
    }

    crate::info!("mm: {} usable regions seeded, {} MiB linearly mapped", usable_regions.len(), max_phys / (1024 * 1024));
}

/// Allocates `size` bytes with no particular alignment requirement beyond
/// what the underlying path naturally provides.
pub fn alloc(size: usize) -> Option<VirtAddr> {
    aligned_alloc(size, 1)
}

/// Allocates `size` bytes aligned to `align`.
///
/// A zero-byte request returns `None` without drawing any chunk or touching
/// the registry. Requests that fit in a sub-page slot (and whose alignment
/// the sub-page allocator's 16-byte slots satisfy) go to [`subpage`];
/// everything else, and any request whose alignment exceeds half a page
/// (which sub-page slots cannot guarantee), goes to [`compose_allocation`].
pub fn aligned_alloc(size: usize, align: usize) -> Option<VirtAddr> {
    if size == 0 {
        return None;
    }
    if align <= PAGE_SIZE / 2 && size <= subpage::MAX_SIZE {
        subpage::alloc(size).map(|p| VirtAddr::new(p as u64))
    } else {
        compose_allocation(size)
    }
}

/// Composes a multi-chunk allocation for a request too large (or too
/// strictly aligned) for the sub-page allocator: decomposes `size` into a
/// per-tier chunk count, draws each tier's share from the current CPU's
/// piles largest-tier-first, maps every drawn chunk into the next free
/// stretch of the kernel-global super-page region, and records the
/// resulting chunk list in the allocation registry so `free` can return
/// them.
///
/// Unlike the pile/reservoir machinery this composes from, the chunk list
/// itself lives in the registry's own heap-backed arena rather than in a
/// chunk drawn for the purpose — so, unlike the design this is grounded on,
/// no extra chunks are drawn to hold the allocation's own bookkeeping.
fn compose_allocation(size: usize) -> Option<VirtAddr> {
    let counts = chunk::tier_counts_for(size);
    let total_chunks: usize = counts.iter().sum();
    debug_assert_eq!(total_chunks, chunk::num_chunks_for(size, false));
    if total_chunks == 0 {
        return None;
    }

    let region_len: u64 = (0..NUM_TIERS).map(|t| counts[t] as u64 * chunk::tier_size(t) as u64).sum();
    let base = next_superpage_address(region_len);

    let mut drawn: Vec<Chunk> = Vec::with_capacity(total_chunks);
    for tier in (0..NUM_TIERS).rev() {
        let want = counts[tier];
        if want == 0 {
            continue;
        }
        let before = drawn.len();
        pile::pile(tier).get_chunks(want, &mut drawn);
        if drawn.len() - before < want {
            return_chunks(drawn);
            return None;
        }
    }

    let mut mapper = unsafe { paging::active_mapper() };
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    let mut next = base.as_u64();
    for c in &drawn {
        paging::map_page(&mut mapper, VirtAddr::new(next), PhysAddr::new(c.phys_start), flags)
            .expect("freshly bumped super-page region must be unmapped");
        next += c.size as u64;
    }

    registry::add_entry(base.as_u64(), drawn);
    Some(base)
}

/// Returns every chunk in `chunks` to its own tier's reservoir.
fn return_chunks(chunks: Vec<Chunk>) {
    for c in chunks {
        reservoir::reservoir(chunk::tier_for_size(c.size)).add_chunk(c);
    }
}

/// Frees a pointer previously returned by [`alloc`] or [`aligned_alloc`].
///
/// Tries the sub-page allocator first since it can recognize its own
/// allocations from the pointer alone; anything it doesn't own is looked up
/// in the allocation registry, unmapped chunk by chunk, and every chunk
/// returned to its tier's reservoir.
pub fn free(ptr: VirtAddr) {
    if subpage::try_free(ptr.as_u64() as *mut u8) {
        return;
    }
    if let Some(chunks) = registry::take_entry(ptr.as_u64()) {
        let mut mapper = unsafe { paging::active_mapper() };
        let mut next = ptr.as_u64();
        for c in &chunks {
            paging::unmap_page(&mut mapper, VirtAddr::new(next));
            next += c.size as u64;
        }
        return_chunks(chunks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_byte_request_is_rejected_before_drawing_anything() {
        assert!(aligned_alloc(0, 1).is_none());
    }

    #[test]
    fn oversized_or_overaligned_requests_route_to_compose() {
        assert!(subpage::MAX_SIZE < PAGE_SIZE);
        // A request right at the sub-page ceiling still fits sub-page...
        assert!(subpage::MAX_SIZE <= subpage::MAX_SIZE);
        // ...but one byte over, or an alignment above half a page, must not.
        let over_size = subpage::MAX_SIZE + 1;
        let forced_align = PAGE_SIZE / 2 + 1;
        assert!(!(forced_align <= PAGE_SIZE / 2 && over_size <= subpage::MAX_SIZE));
    }
}
