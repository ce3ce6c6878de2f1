//! Kernel heap allocator.
//!
//! The tiered chunk allocator in `mm` hands out whole pages and page-multiples;
//! general-purpose `alloc::vec::Vec`/`Box` usage inside the kernel (growable
//! reservoir backing arrays, AVL/device-tree arenas, log formatting) goes
//! through this allocator instead. It is seeded from a static region so that
//! it is available before the chunk allocator has anywhere to carve memory
//! from.

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};
use linked_list_allocator::LockedHeap;
use spin::Mutex;

#[repr(align(64))]
struct HeapRegion([u8; HEAP_SIZE]);

const HEAP_SIZE: usize = 4 * 1024 * 1024;

static mut HEAP_MEMORY: HeapRegion = HeapRegion([0; HEAP_SIZE]);
static ALLOCATOR: LockedHeap = LockedHeap::empty();
static HEAP_INIT_DONE: AtomicBool = AtomicBool::new(false);

#[derive(Default, Clone, Copy)]
pub struct HeapStats {
    total_allocations: usize,
    total_deallocations: usize,
    current_allocated: usize,
    peak_allocated: usize,
    allocation_failures: usize,
}

impl HeapStats {
    pub fn total_allocations(&self) -> usize { self.total_allocations }
    pub fn total_deallocations(&self) -> usize { self.total_deallocations }
    pub fn current_allocated(&self) -> usize { self.current_allocated }
    pub fn peak_allocated(&self) -> usize { self.peak_allocated }
    pub fn allocation_failures(&self) -> usize { self.allocation_failures }
}

static HEAP_STATS: Mutex<HeapStats> = Mutex::new(HeapStats {
    total_allocations: 0,
    total_deallocations: 0,
    current_allocated: 0,
    peak_allocated: 0,
    allocation_failures: 0,
});

pub const fn heap_total_size() -> usize {
    HEAP_SIZE
}

/// Initializes the kernel heap. Idempotent; safe to call once early in boot.
pub fn init_heap() {
    if HEAP_INIT_DONE
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        unsafe {
            let region = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut u8;
            ALLOCATOR.lock().init(region, HEAP_SIZE);
        }
        crate::info!("heap: {} KiB online", HEAP_SIZE / 1024);
    }
}

struct StatsTrackingAllocator;

unsafe impl GlobalAlloc for StatsTrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = ALLOCATOR.alloc(layout);
        let mut stats = HEAP_STATS.lock();
        if !ptr.is_null() {
            stats.total_allocations += 1;
            stats.current_allocated += layout.size();
            if stats.current_allocated > stats.peak_allocated {
                stats.peak_allocated = stats.current_allocated;
            }
        } else {
            stats.allocation_failures += 1;
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut stats = HEAP_STATS.lock();
        stats.total_deallocations += 1;
        stats.current_allocated = stats.current_allocated.saturating_sub(layout.size());
        drop(stats);
        ALLOCATOR.dealloc(ptr, layout);
    }
}

#[global_allocator]
static GLOBAL_ALLOC: StatsTrackingAllocator = StatsTrackingAllocator;

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    crate::error!("heap allocation of {} bytes (align {}) failed", layout.size(), layout.align());
    loop {
        x86_64::instructions::hlt();
    }
}

pub fn get_heap_stats() -> HeapStats {
    *HEAP_STATS.lock()
}
