//! Four-level x86_64 paging built on a recursive self-map rather than a
//! direct-physical-map window.
//!
//! PML4 slot [`PRIMARY_SELF_MAP_INDEX`] (0x1ff) always points back at the
//! currently loaded PML4, so the `x86_64` crate's `RecursivePageTable`
//! mapper can walk and extend it without any separate identity-mapped
//! region. PML4 slot [`SECONDARY_SELF_MAP_INDEX`] (0x1fe) is free for the
//! address-space constructor to borrow: it temporarily points at a new,
//! not-yet-loaded PML4 so that table can be populated (kernel half copied
//! in, self-map entries written) through the same recursive-mapper
//! machinery before it is ever installed in CR3.
//!
//! PML4 indices 256..510 form the shared kernel half: every address space
//! keeps identical entries there, copied once at construction time, so a
//! page mapped into the kernel half through one address space is visible
//! through all of them without any extra propagation step.

use super::chunk::Chunk;
use alloc::vec::Vec;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{
    FrameAllocator, FrameDeallocator, Mapper, Page, PageTable, PageTableFlags, PageTableIndex,
    PhysFrame, RecursivePageTable, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

pub const PRIMARY_SELF_MAP_INDEX: u16 = 0x1ff;
pub const SECONDARY_SELF_MAP_INDEX: u16 = 0x1fe;
pub const KERNEL_HALF_START: u16 = 256;
pub const KERNEL_HALF_END: u16 = 510;

/// Adapts the tier-0 pile/reservoir allocator to the `x86_64` crate's frame
/// allocator traits, so `Mapper::map_to` can draw page-table frames from the
/// same chunk machinery everything else in `mm` uses.
pub struct TierZeroFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for TierZeroFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let chunk = super::pile::pile(0).get_chunk();
        if chunk.is_none() {
            return None;
        }
        Some(PhysFrame::containing_address(PhysAddr::new(chunk.phys_start)))
    }
}

impl FrameDeallocator<Size4KiB> for TierZeroFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        super::reservoir::reservoir(0).add_chunk(Chunk {
            size: super::chunk::tier_size(0),
            phys_start: frame.start_address().as_u64(),
        });
    }
}

fn self_map_page(index: u16) -> Page<Size4KiB> {
    let idx = PageTableIndex::new(index);
    Page::from_page_table_indices(idx, idx, idx, idx)
}

/// Returns a `RecursivePageTable` over whichever PML4 is currently loaded in
/// CR3, via the primary (0x1ff) self-map slot.
///
/// # Safety
/// The caller must ensure the active PML4 really carries a self-referencing
/// entry at `PRIMARY_SELF_MAP_INDEX`, which `init_kernel_address_space`
/// guarantees for every address space this kernel builds.
pub unsafe fn active_mapper() -> RecursivePageTable<'static> {
    let page = self_map_page(PRIMARY_SELF_MAP_INDEX);
    let table_ptr: *mut PageTable = page.start_address().as_mut_ptr();
    RecursivePageTable::new_unchecked(&mut *table_ptr, PageTableIndex::new(PRIMARY_SELF_MAP_INDEX))
}

/// Borrows the secondary (0x1fe) self-map slot to get a `RecursivePageTable`
/// view of `pml4_phys` without installing it in CR3. Used while a new
/// address space's PML4 is being populated.
///
/// # Safety
/// `pml4_phys` must point at a zeroed, page-aligned PML4 frame that nothing
/// else is concurrently mutating through the secondary slot.
pub unsafe fn foreign_mapper(current_pml4: &mut PageTable, pml4_phys: PhysAddr) -> RecursivePageTable<'static> {
    current_pml4[SECONDARY_SELF_MAP_INDEX as usize].set_addr(
        pml4_phys,
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
    );
    flush_tlb_all();
    let page = self_map_page(SECONDARY_SELF_MAP_INDEX);
    let table_ptr: *mut PageTable = page.start_address().as_mut_ptr();
    RecursivePageTable::new_unchecked(&mut *table_ptr, PageTableIndex::new(SECONDARY_SELF_MAP_INDEX))
}

pub fn current_pml4_phys() -> PhysAddr {
    Cr3::read().0.start_address()
}

pub fn flush_tlb_page(virt: VirtAddr) {
    x86_64::instructions::tlb::flush(virt);
}

pub fn flush_tlb_all() {
    x86_64::instructions::tlb::flush_all();
}

/// Fixed kernel-half offset at which all of physical RAM is linearly mapped,
/// so code can touch a physical chunk's contents (pile/subpage metadata,
/// zeroing a freshly allocated frame) without installing a one-off mapping
/// for it. Lives at PML4 index 256, the first kernel-half slot, so it is
/// copied into every address space by [`copy_kernel_half`] automatically.
pub const PHYS_MAP_OFFSET: u64 = 0xFFFF_8000_0000_0000;

pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(PHYS_MAP_OFFSET + phys.as_u64())
}

pub fn virt_to_phys_direct(virt: VirtAddr) -> PhysAddr {
    PhysAddr::new(virt.as_u64() - PHYS_MAP_OFFSET)
}

/// Maps all of physical RAM into the linear map at [`PHYS_MAP_OFFSET`] using
/// 2MiB pages. Called once during boot, before any sub-page or pile
/// metadata is touched.
pub fn map_physical_memory(mapper: &mut RecursivePageTable<'static>, max_phys: u64) -> Result<(), &'static str> {
    use x86_64::structures::paging::Size2MiB;
    const TWO_MIB: u64 = 2 * 1024 * 1024;
    let mut allocator = TierZeroFrameAllocator;
    let mut addr = 0u64;
    while addr < max_phys {
        let page = Page::<Size2MiB>::containing_address(VirtAddr::new(PHYS_MAP_OFFSET + addr));
        let frame = PhysFrame::<Size2MiB>::containing_address(PhysAddr::new(addr));
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::HUGE_PAGE;
        unsafe {
            match mapper.map_to(page, frame, flags, &mut allocator) {
                Ok(flush) => flush.flush(),
                Err(x86_64::structures::paging::mapper::MapToError::PageAlreadyMapped(_)) => {}
                Err(_) => return Err("failed to map physical memory window"),
            }
        }
        addr += TWO_MIB;
    }
    Ok(())
}

/// Maps a single 4KiB page, allocating any missing intermediate page-table
/// frames from the tier-0 allocator.
pub fn map_page(
    mapper: &mut RecursivePageTable<'static>,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), &'static str> {
    let page = Page::<Size4KiB>::containing_address(virt);
    let frame = PhysFrame::containing_address(phys);
    let mut allocator = TierZeroFrameAllocator;
    unsafe {
        mapper
            .map_to(page, frame, flags, &mut allocator)
            .map_err(|_| "page already mapped")?
            .flush();
    }
    Ok(())
}

pub fn unmap_page(mapper: &mut RecursivePageTable<'static>, virt: VirtAddr) -> Option<PhysAddr> {
    let page = Page::<Size4KiB>::containing_address(virt);
    match mapper.unmap(page) {
        Ok((frame, flush)) => {
            flush.flush();
            Some(frame.start_address())
        }
        Err(_) => None,
    }
}

pub fn translate(mapper: &RecursivePageTable<'static>, virt: VirtAddr) -> Option<PhysAddr> {
    use x86_64::structures::paging::mapper::Translate;
    mapper.translate_addr(virt)
}

/// Copies the shared kernel-half PML4 entries (256..510) from `src` into `dst`.
pub fn copy_kernel_half(src: &PageTable, dst: &mut PageTable) {
    for i in KERNEL_HALF_START..KERNEL_HALF_END {
        dst[i as usize] = src[i as usize].clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_map_indices_match_spec() {
        assert_eq!(PRIMARY_SELF_MAP_INDEX, 0x1ff);
        assert_eq!(SECONDARY_SELF_MAP_INDEX, 0x1fe);
    }

    #[test]
    fn kernel_half_bounds() {
        assert_eq!(KERNEL_HALF_START, 256);
        assert!(KERNEL_HALF_END < PRIMARY_SELF_MAP_INDEX);
    }
}
