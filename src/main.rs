#![no_std]
#![no_main]
#![feature(alloc_error_handler)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(feature = "strict", deny(warnings))]
#![cfg_attr(feature = "strict", deny(unsafe_op_in_unsafe_fn))]

// Required for heap allocation
extern crate alloc;

// Core library (error handling, logging, ring buffer)
#[allow(special_module_name)]
pub mod lib;
// Architecture-specific modules (GDT/IDT/TSS, APIC/IOAPIC/PIC, ACPI, HPET, paging, syscall)
pub mod arch {
    pub mod x86_64;
    pub use x86_64::*;
}
// Multiboot2 boot-information ingest
pub mod boot;
// Memory management: chunk/reservoir/pile allocator, address-space manager, registry
pub mod mm;
// Device and interrupt trees
pub mod device;
// Kernel heap allocator
pub mod heap;
// Timer layer: HPET/local-APIC-timer task queues
pub mod time;
// Per-thread scheduler
pub mod sched;
// Terminal output sink
pub mod terminal;
// Syscall dispatch table
pub mod syscall;

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::lib::panic::panic_handler(info)
}

/// Kernel entry point.
///
/// Reached directly from the loader's assembly stub with `rdi` holding the
/// physical address of the [`boot::multiboot::BootInfoHeader`] it built.
/// Interrupts are disabled, the CPU is in 64-bit long mode, and paging is
/// enabled with the loader's own identity map still live.
#[no_mangle]
pub extern "C" fn _start(boot_info_header_addr: u64) -> ! {
    unsafe {
        if let Err(e) = arch::boot::early_init() {
            arch::serial::serial_write(b"\n[FATAL] Boot error: ");
            arch::serial::serial_write(e.as_bytes());
            arch::serial::serial_write(b"\n");
            arch::boot::halt_forever();
        }
    }

    arch::boot::print_boot_info();

    heap::init_heap();

    let info = unsafe { boot::ingest(boot_info_header_addr) };

    mm::init(&info.usable_regions, info.max_phys);
    terminal::register();

    if let Some(rsdp) = info.rsdp_addr {
        let result = unsafe { arch::acpi::init(x86_64::PhysAddr::new(rsdp)) };
        if let Err(e) = result {
            arch::serial::serial_write(b"[BOOT] ACPI init failed: ");
            arch::serial::serial_write(e.as_bytes());
            arch::serial::serial_write(b"\n");
        }
    }

    unsafe {
        if let Err(e) = arch::apic::init() {
            arch::serial::serial_write(b"[BOOT] APIC init failed: ");
            arch::serial::serial_write(e.as_bytes());
            arch::serial::serial_write(b"\n");
        }
        if let Err(e) = arch::ioapic::init() {
            arch::serial::serial_write(b"[BOOT] IOAPIC init failed: ");
            arch::serial::serial_write(e.as_bytes());
            arch::serial::serial_write(b"\n");
        }
    }

    let topology = arch::topology::discover();
    crate::info!("boot: {} logical CPU(s) discovered", topology.len());

    unsafe {
        match arch::smp::boot_aps() {
            Ok(started) => crate::info!("boot: {} application processor(s) started", started),
            Err(e) => {
                arch::serial::serial_write(b"[BOOT] AP bring-up failed: ");
                arch::serial::serial_write(e.as_bytes());
                arch::serial::serial_write(b"\n");
            }
        }
    }

    unsafe {
        if let Err(e) = time::hpet::init() {
            arch::serial::serial_write(b"[BOOT] HPET task-queue init failed: ");
            arch::serial::serial_write(e.as_bytes());
            arch::serial::serial_write(b"\n");
        }
        time::lapic_timer::init(1000);
    }

    sched::system::send_task(sched::process::LoadType::SYSTEM, 10, u32::MAX, idle_task);

    arch::serial::serial_write(b"[BOOT] Kernel initialization complete\n");
    arch::serial::serial_write(b"[BOOT] Entering scheduler idle loop\n");
    arch::serial::serial_write(b"\n");

    unsafe {
        x86_64::instructions::interrupts::enable();
    }

    loop {
        x86_64::instructions::hlt();
    }
}

/// Placeholder task run when no other work is scheduled.
fn idle_task() {
    x86_64::instructions::hlt();
}
