//! Multiboot2 information ingest: walks the tag list the loader hands off
//! in `rdi` at kernel entry, carves the memory map into the regions
//! [`crate::mm::init`] wants, and records the handful of other tags the rest
//! of the kernel needs (ACPI RSDP, framebuffer, loaded modules).

pub mod multiboot;

use multiboot::*;

/// Four regions the loader's own bookkeeping occupies and which must never
/// be handed back to the allocator as free memory, even though they fall
/// inside an otherwise-available mmap region.
#[derive(Clone, Copy, Debug)]
pub struct ProtectedRegion {
    pub start: u64,
    pub end: u64,
}

/// Everything `boot::ingest` pulls out of the tag list, handed to the rest
/// of early kernel init.
#[derive(Default)]
pub struct BootInfo {
    pub usable_regions: alloc::vec::Vec<(u64, u64)>,
    pub max_phys: u64,
    pub rsdp_addr: Option<u64>,
    pub framebuffer: Option<FramebufferInfo>,
    pub kernel_module: Option<(u64, u64)>,
    pub cmdline: Option<alloc::string::String>,
}

#[derive(Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
}

unsafe fn tag_body<T>(tag: *const TagHeader) -> *const T {
    tag as *const T
}

unsafe fn cstr_after(ptr: *const u8, len: usize) -> alloc::string::String {
    let slice = core::slice::from_raw_parts(ptr, len);
    let end = slice.iter().position(|&b| b == 0).unwrap_or(len);
    alloc::string::String::from_utf8_lossy(&slice[..end]).into_owned()
}

/// Carves the regions the loader itself used — the kernel image, the boot
/// stack, the thread-startup trampoline, and the tag list's own memory —
/// out of an mmap entry before it's handed to the chunk allocator, the same
/// way a region with an in-use module tag never gets turned into free chunks.
fn split_around_protected(mut base: u64, mut len: u64, protected: &[ProtectedRegion], out: &mut alloc::vec::Vec<(u64, u64)>) {
    'restart: loop {
        let end = base + len;
        for region in protected {
            let overlap_start = base.max(region.start);
            let overlap_end = end.min(region.end);
            if overlap_start < overlap_end {
                if base < overlap_start {
                    out.push((base, overlap_start - base));
                }
                if overlap_end < end {
                    base = overlap_end;
                    len = end - overlap_end;
                    continue 'restart;
                }
                return;
            }
        }
        if len > 0 {
            out.push((base, len));
        }
        return;
    }
}

/// Parses the loader header and Multiboot2 tag list at `header_addr`
/// (physical address, as placed in `rdi` by the loader's assembly stub)
/// into a [`BootInfo`].
///
/// # Safety
/// `header_addr` must point at a live [`BootInfoHeader`] followed by a
/// Multiboot2 tag list at the offset it names, both mapped readable.
pub unsafe fn ingest(header_addr: u64) -> BootInfo {
    let mut info = BootInfo::default();
    let header = &*(header_addr as *const BootInfoHeader);
    let protected = [
        ProtectedRegion { start: header.boot_start, end: header.boot_start + header.boot_size },
        ProtectedRegion { start: header.stack_bottom, end: header.stack_top },
        ProtectedRegion { start: header.thread_start, end: header.thread_start + header.thread_size },
        ProtectedRegion { start: header_addr, end: header.mb_start + header.mb_size },
    ];

    let mb_start = header.mb_start;
    let mut cursor = mb_start + 8;
    let list_end = mb_start + header.mb_size;

    while cursor + 8 <= list_end {
        let header = &*(cursor as *const TagHeader);
        if header.typ == TAG_END {
            break;
        }

        match header.typ {
            TAG_MMAP => {
                let mmap = &*tag_body::<MmapTag>(cursor as *const TagHeader);
                let entries_start = cursor + core::mem::size_of::<MmapTag>() as u64;
                let entries_end = cursor + header.size as u64;
                let mut entry_addr = entries_start;
                while entry_addr + core::mem::size_of::<MmapEntry>() as u64 <= entries_end {
                    let entry = &*(entry_addr as *const MmapEntry);
                    if entry.typ == MEMORY_AVAILABLE {
                        split_around_protected(entry.addr, entry.len, &protected, &mut info.usable_regions);
                        info.max_phys = info.max_phys.max(entry.addr + entry.len);
                    } else {
                        info.max_phys = info.max_phys.max(entry.addr + entry.len);
                    }
                    entry_addr += mmap.entry_size as u64;
                }
            }
            TAG_MODULE => {
                let module = &*tag_body::<ModuleTag>(cursor as *const TagHeader);
                let cmdline_ptr = (cursor + core::mem::size_of::<ModuleTag>() as u64) as *const u8;
                let cmdline_len = (header.size as usize).saturating_sub(core::mem::size_of::<ModuleTag>());
                let cmdline = cstr_after(cmdline_ptr, cmdline_len);
                if cmdline.contains(KERNEL_MODULE_IDENTIFIER) {
                    info.kernel_module = Some((module.mod_start as u64, module.mod_end as u64));
                }
            }
            TAG_CMDLINE => {
                let ptr = (cursor + core::mem::size_of::<TagHeader>() as u64) as *const u8;
                let len = (header.size as usize).saturating_sub(core::mem::size_of::<TagHeader>());
                info.cmdline = Some(cstr_after(ptr, len));
            }
            TAG_FRAMEBUFFER => {
                let fb = &*tag_body::<FramebufferTag>(cursor as *const TagHeader);
                info.framebuffer = Some(FramebufferInfo {
                    addr: fb.addr,
                    pitch: fb.pitch,
                    width: fb.width,
                    height: fb.height,
                    bpp: fb.bpp,
                });
            }
            TAG_OLD_ACPI | TAG_NEW_ACPI => {
                let rsdp_ptr = cursor + core::mem::size_of::<AcpiTag>() as u64;
                info.rsdp_addr = Some(rsdp_ptr);
            }
            _ => {}
        }

        // Tags are padded up to 8-byte alignment.
        let advance = (header.size as u64 + 7) & !7;
        cursor += advance;
    }

    crate::info!(
        "boot: {} usable regions, {} MiB addressable, rsdp={:?}",
        info.usable_regions.len(),
        info.max_phys / (1024 * 1024),
        info.rsdp_addr,
    );

    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_around_protected_removes_single_hole() {
        let protected = [ProtectedRegion { start: 0x2000, end: 0x3000 }];
        let mut out = alloc::vec::Vec::new();
        split_around_protected(0x1000, 0x3000, &protected, &mut out);
        assert_eq!(out, alloc::vec![(0x1000u64, 0x1000u64), (0x3000u64, 0x1000u64)]);
    }

    #[test]
    fn split_around_protected_handles_no_overlap() {
        let protected = [ProtectedRegion { start: 0x9000, end: 0xA000 }];
        let mut out = alloc::vec::Vec::new();
        split_around_protected(0x1000, 0x1000, &protected, &mut out);
        assert_eq!(out, alloc::vec![(0x1000u64, 0x1000u64)]);
    }

    #[test]
    fn split_around_protected_handles_multiple_holes() {
        let protected = [
            ProtectedRegion { start: 0x1100, end: 0x1200 },
            ProtectedRegion { start: 0x1400, end: 0x1500 },
        ];
        let mut out = alloc::vec::Vec::new();
        split_around_protected(0x1000, 0x1000, &protected, &mut out);
        assert_eq!(
            out,
            alloc::vec![(0x1000u64, 0x100u64), (0x1200u64, 0x200u64), (0x1500u64, 0xB00u64)]
        );
    }
}
