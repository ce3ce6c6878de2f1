//! [`TimableDevice`] wrapper around the raw HPET driver in `arch::x86_64`,
//! carrying its own [`TaskQueue`] of software timers layered on top of
//! comparator 0.

use super::timer::{TaskQueue, TimableDevice};
use crate::arch::x86_64::hpet::Hpet;
use spin::Mutex;

pub struct HpetTimer {
    device: &'static Hpet,
    queue: Mutex<TaskQueue>,
}

impl HpetTimer {
    fn new(device: &'static Hpet) -> Self {
        Self { device, queue: Mutex::new(TaskQueue::new()) }
    }

    pub fn push_task_rate(&self, delay_ticks: u64, rate_ticks: u64, rounds: i64, callback: fn()) {
        let now = self.now();
        self.queue.lock().push_task_rate(delay_ticks, rate_ticks, rounds, callback, now);
    }

    /// Called from the comparator-0 interrupt handler.
    pub fn run(&self) {
        let now = self.now();
        let next = self.queue.lock().run(now);
        if let Some(deadline) = next {
            self.set_interrupt_absolute(deadline);
        }
    }
}

impl TimableDevice for HpetTimer {
    fn now(&self) -> u64 {
        self.device.read_counter()
    }

    fn time_to_next(&self) -> u64 {
        self.queue.lock().next_deadline().map(|d| d.saturating_sub(self.now())).unwrap_or(0)
    }

    fn convert_seconds(&self, seconds: f64) -> u64 {
        (seconds * self.device.frequency() as f64) as u64
    }

    fn convert_rate(&self, hz: u64) -> u64 {
        if hz == 0 {
            0
        } else {
            self.device.frequency() / hz
        }
    }

    fn set_interrupt_relative(&self, ticks: u64) {
        unsafe { self.device.configure_comparator(0, crate::time::HPET_VECTOR, ticks, false) };
    }

    fn set_interrupt_absolute(&self, time: u64) {
        let ticks = time.saturating_sub(self.now());
        self.set_interrupt_relative(ticks);
    }

    fn set_interrupt_periodic(&self, interval: u64) {
        unsafe { self.device.configure_comparator(0, crate::time::HPET_VECTOR, interval, true) };
    }
}

static HPET_TIMER: Mutex<Option<HpetTimer>> = Mutex::new(None);

/// # Safety
/// Must run after `arch::x86_64::hpet::init` has populated the global HPET.
pub unsafe fn init() -> Result<(), &'static str> {
    let device = crate::arch::x86_64::hpet::get().ok_or("HPET not initialized")?;
    *HPET_TIMER.lock() = Some(HpetTimer::new(device));
    Ok(())
}

pub fn with_hpet_timer<R>(f: impl FnOnce(&HpetTimer) -> R) -> Option<R> {
    HPET_TIMER.lock().as_ref().map(f)
}
