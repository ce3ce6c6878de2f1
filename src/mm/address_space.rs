//! Per-task address spaces: a PML4 plus bookkeeping for the next free
//! virtual region, built on the recursive self-map in [`super::paging`].

use super::paging::{self, KERNEL_HALF_END, KERNEL_HALF_START};
use crate::lib::error::{Errno, KernelError};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{Mapper, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

/// Lowest address handed out by [`AddressSpace::get_new_address`]; kept well
/// above the zero page and any fixed low-memory structures.
const USER_REGION_BASE: u64 = 0x0000_0001_0000_0000;
const USER_REGION_END: u64 = 0x0000_7fff_ffff_f000;

pub struct AddressSpace {
    pml4_phys: PhysAddr,
    next_free: u64,
}

impl AddressSpace {
    /// Builds a brand-new address space, sharing the kernel half with
    /// whichever address space is currently active and installing its own
    /// primary self-map entry.
    pub fn new() -> Result<Self, Errno> {
        let chunk = super::pile::pile(0).get_chunk();
        if chunk.is_none() {
            return Err(Errno::from(KernelError::OutOfMemory));
        }
        let pml4_phys = PhysAddr::new(chunk.phys_start);

        unsafe {
            let mut active = paging::active_mapper();
            let current_pml4: &mut PageTable = active.level_4_table();
            let mut foreign = paging::foreign_mapper(current_pml4, pml4_phys);
            let new_table = foreign.level_4_table();
            for entry in new_table.iter_mut() {
                entry.set_unused();
            }
            paging::copy_kernel_half(current_pml4, new_table);
            new_table[paging::PRIMARY_SELF_MAP_INDEX as usize].set_addr(
                pml4_phys,
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            );
        }

        Ok(Self { pml4_phys, next_free: USER_REGION_BASE })
    }

    pub fn pml4_phys(&self) -> PhysAddr {
        self.pml4_phys
    }

    /// Switches this address space into CR3. Only valid to call on the
    /// owning CPU; the caller is responsible for not doing this mid-fault.
    pub unsafe fn switch_to(&self) {
        let frame = PhysFrame::containing_address(self.pml4_phys);
        Cr3::write(frame, Cr3Flags::empty());
    }

    fn with_mapper<R>(&self, f: impl FnOnce(&mut x86_64::structures::paging::RecursivePageTable<'static>) -> R) -> R {
        let is_active = paging::current_pml4_phys() == self.pml4_phys;
        unsafe {
            if is_active {
                let mut mapper = paging::active_mapper();
                f(&mut mapper)
            } else {
                let mut active = paging::active_mapper();
                let current_pml4 = active.level_4_table();
                let mut mapper = paging::foreign_mapper(current_pml4, self.pml4_phys);
                f(&mut mapper)
            }
        }
    }

    /// Maps a single page. This is generic per-page bookkeeping only: the
    /// physical page may be identity-mapped, MMIO, or ACPI memory that was
    /// never drawn from a tier, so unlike [`super::compose_allocation`] this
    /// never touches the allocation registry. Callers that mapped memory
    /// composed by `compose_allocation` free it through `super::free`, not
    /// through `unmap_page`.
    pub fn map_page(&self, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), Errno> {
        self.with_mapper(|mapper| paging::map_page(mapper, virt, phys, flags))
            .map_err(|_| Errno::from(KernelError::AlreadyExists))?;
        Ok(())
    }

    pub fn unmap_page(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.with_mapper(|mapper| paging::unmap_page(mapper, virt))
    }

    /// Maps `len` bytes starting at `virt` to physically contiguous memory
    /// starting at `phys`, page by page.
    pub fn map_region(&self, virt: VirtAddr, phys: PhysAddr, len: u64, flags: PageTableFlags) -> Result<(), Errno> {
        let pages = (len + 4095) / 4096;
        for i in 0..pages {
            self.map_page(virt + i * 4096, phys + i * 4096, flags)?;
        }
        Ok(())
    }

    pub fn identity_map_range(&self, start: PhysAddr, len: u64, flags: PageTableFlags) -> Result<(), Errno> {
        self.map_region(VirtAddr::new(start.as_u64()), start, len, flags)
    }

    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.with_mapper(|mapper| paging::translate(mapper, virt))
    }

    /// Hands out the next unused virtual region of `len` bytes in this
    /// address space's non-kernel half, bump-allocator style.
    pub fn get_new_address(&mut self, len: u64) -> Option<VirtAddr> {
        let pages = (len + 4095) / 4096;
        let aligned_len = pages * 4096;
        if self.next_free + aligned_len > USER_REGION_END {
            return None;
        }
        let addr = self.next_free;
        self.next_free += aligned_len;
        Some(VirtAddr::new(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_half_indices_stay_within_bounds() {
        assert!(KERNEL_HALF_START < KERNEL_HALF_END);
    }
}
