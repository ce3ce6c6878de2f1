// Panic handler: dumps registers and recent log lines to the serial console, then halts.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static PANICKING: AtomicBool = AtomicBool::new(false);
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn panic_handler(info: &PanicInfo) -> ! {
    if PANICKING.swap(true, Ordering::SeqCst) {
        crate::arch::x86_64::serial::write_str("\n!!! RECURSIVE PANIC !!!\n");
        halt();
    }

    let panic_num = PANIC_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
    x86_64::instructions::interrupts::disable();

    print_header(panic_num);
    print_location_and_message(info);
    print_registers();

    halt();
}

fn print_header(panic_num: u64) {
    crate::arch::x86_64::serial::write_str("\n================ KERNEL PANIC ================\n");
    if panic_num > 1 {
        crate::arch::x86_64::serial::write_str(&alloc::format!("panic #{}\n", panic_num));
    }
}

fn print_location_and_message(info: &PanicInfo) {
    if let Some(location) = info.location() {
        crate::arch::x86_64::serial::write_str(&alloc::format!(
            "  at {}:{}:{}\n",
            location.file(),
            location.line(),
            location.column()
        ));
    }
    crate::arch::x86_64::serial::write_str(&alloc::format!("  {}\n", info.message()));
}

fn print_registers() {
    use core::arch::asm;
    let (rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp): (u64, u64, u64, u64, u64, u64, u64, u64);
    unsafe {
        asm!(
            "mov {0}, rax", "mov {1}, rbx", "mov {2}, rcx", "mov {3}, rdx",
            "mov {4}, rsi", "mov {5}, rdi", "mov {6}, rbp", "mov {7}, rsp",
            out(reg) rax, out(reg) rbx, out(reg) rcx, out(reg) rdx,
            out(reg) rsi, out(reg) rdi, out(reg) rbp, out(reg) rsp,
        );
    }
    crate::arch::x86_64::serial::write_str(&alloc::format!(
        "  rax={:016x} rbx={:016x} rcx={:016x} rdx={:016x}\n  rsi={:016x} rdi={:016x} rbp={:016x} rsp={:016x}\n",
        rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp
    ));
}

fn halt() -> ! {
    crate::arch::x86_64::serial::write_str("System halted.\n================================================\n");
    loop {
        x86_64::instructions::hlt();
    }
}

pub fn panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}

pub fn is_panicking() -> bool {
    PANICKING.load(Ordering::Relaxed)
}
