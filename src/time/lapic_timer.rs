//! [`TimableDevice`] driving the scheduler tick (and anything else on this
//! core that wants a one-shot or periodic callback) off the local APIC's
//! built-in timer.
//!
//! The local APIC timer has no architecturally fixed frequency -- it runs at
//! the bus clock divided by a programmable divisor -- so [`calibrate`] times
//! a divide-by-8 count-down against a known HPET interval to learn it.

use super::timer::{TaskQueue, TimableDevice};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

const TIMER_DIVISOR: u8 = 8;

/// Counts down a divide-by-8 timer across a 0.1s HPET window, ten times, to
/// learn ticks/sec. Must run with interrupts masked on the timer LVT entry
/// (the raw count-down, not the IRQ, is what's being measured).
pub fn calibrate() -> u64 {
    let hpet = match crate::arch::x86_64::hpet::get() {
        Some(h) => h,
        None => return 0,
    };

    let guard = crate::arch::x86_64::apic::get();
    let apic = match guard.as_ref().and_then(|g| g.as_ref()) {
        Some(a) => a,
        None => return 0,
    };

    let window_ticks = hpet.ns_to_ticks(100_000_000); // 0.1s
    unsafe {
        apic.configure_timer(0xFF, u32::MAX, TIMER_DIVISOR, false);
        let start = hpet.read_counter();
        while hpet.read_counter() - start < window_ticks {
            core::hint::spin_loop();
        }
        let elapsed = u32::MAX - apic.timer_current_count();
        (elapsed as u64) * 10
    }
}

pub struct LapicTimer {
    ticks_per_sec: AtomicU32,
    queue: Mutex<TaskQueue>,
}

impl LapicTimer {
    const fn new() -> Self {
        Self { ticks_per_sec: AtomicU32::new(0), queue: Mutex::new(TaskQueue::new()) }
    }

    pub fn push_task_rate(&self, delay_ticks: u64, rate_ticks: u64, rounds: i64, callback: fn()) {
        let now = self.now();
        self.queue.lock().push_task_rate(delay_ticks, rate_ticks, rounds, callback, now);
    }

    /// Called from the local-APIC timer interrupt handler.
    pub fn run(&self) {
        let now = self.now();
        let next = self.queue.lock().run(now);
        if let Some(deadline) = next {
            self.set_interrupt_absolute(deadline);
        }
    }
}

impl TimableDevice for LapicTimer {
    fn now(&self) -> u64 {
        crate::arch::x86_64::read_tsc()
    }

    fn time_to_next(&self) -> u64 {
        self.queue.lock().next_deadline().map(|d| d.saturating_sub(self.now())).unwrap_or(0)
    }

    fn convert_seconds(&self, seconds: f64) -> u64 {
        (seconds * self.ticks_per_sec.load(Ordering::Relaxed) as f64) as u64
    }

    fn convert_rate(&self, hz: u64) -> u64 {
        let rate = self.ticks_per_sec.load(Ordering::Relaxed) as u64;
        if hz == 0 {
            0
        } else {
            rate / hz
        }
    }

    fn set_interrupt_relative(&self, ticks: u64) {
        let guard = crate::arch::x86_64::apic::get();
        if let Some(apic) = guard.as_ref().and_then(|g| g.as_ref()) {
            unsafe { apic.configure_timer(crate::arch::x86_64::idt::TIMER_VECTOR, ticks.min(u32::MAX as u64) as u32, TIMER_DIVISOR, false) };
        }
    }

    fn set_interrupt_absolute(&self, time: u64) {
        let ticks = time.saturating_sub(self.now());
        self.set_interrupt_relative(ticks);
    }

    fn set_interrupt_periodic(&self, interval: u64) {
        let guard = crate::arch::x86_64::apic::get();
        if let Some(apic) = guard.as_ref().and_then(|g| g.as_ref()) {
            unsafe { apic.configure_timer(crate::arch::x86_64::idt::TIMER_VECTOR, interval.min(u32::MAX as u64) as u32, TIMER_DIVISOR, true) };
        }
    }
}

pub static LAPIC_TIMER: LapicTimer = LapicTimer::new();

/// # Safety
/// Must run after `arch::x86_64::apic::init` and `arch::x86_64::hpet::init`.
pub unsafe fn init(scheduling_hz: u32) {
    let rate = calibrate();
    LAPIC_TIMER.ticks_per_sec.store(rate as u32, Ordering::Relaxed);
    if rate > 0 {
        LAPIC_TIMER.set_interrupt_periodic(rate / scheduling_hz as u64);
    }
    crate::info!("lapic_timer: calibrated to {} ticks/sec, scheduling at {} Hz", rate, scheduling_hz);
}
