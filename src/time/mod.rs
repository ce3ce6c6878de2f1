//! Timer layer: the shared min-heap task queue plus its two concrete
//! backends, HPET and the local-APIC timer, each exposed through
//! [`timer::TimableDevice`].

pub mod hpet;
pub mod lapic_timer;
pub mod timer;

pub use timer::{TaskQueue, Task, TimableDevice};

/// Comparator 0's MADT-routed vector; chosen from the range the PIC would
/// otherwise have claimed for the (unused) legacy PIT, since nothing else
/// needs that GSI once the PIT is retired.
pub const HPET_VECTOR: u8 = 0x28;

/// Cooperative sleep: spins until `seconds` have elapsed, yielding the CPU
/// to other ready tasks on this core each time around rather than spinning
/// with interrupts disabled.
pub fn sleep(seconds: f64) {
    let wake_at = match crate::arch::x86_64::hpet::get() {
        Some(hpet) => hpet.read_counter() + hpet.ns_to_ticks((seconds * 1_000_000_000.0) as u64),
        None => return,
    };

    loop {
        let now = crate::arch::x86_64::hpet::get().map(|h| h.read_counter()).unwrap_or(u64::MAX);
        if now >= wake_at {
            return;
        }
        crate::sched::scheduler::yield_now();
    }
}

/// Monotonic microseconds since the HPET came up, used for log timestamps.
/// Returns 0 before the HPET is initialized.
pub fn uptime_us() -> u64 {
    match crate::arch::x86_64::hpet::get() {
        Some(hpet) => hpet.ticks_to_ns(hpet.read_counter()) / 1000,
        None => 0,
    }
}
