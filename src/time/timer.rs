//! Shared min-heap task queue used by both concrete timers.
//!
//! Every timer device (HPET, local-APIC) counts in its own units -- HPET in
//! femtosecond-derived ticks, the local APIC in bus-clock-divided ticks -- so
//! the queue itself is unit-agnostic: callers convert seconds to "this
//! device's ticks" before pushing, via [`TimableDevice::convert_seconds`].

use alloc::collections::BinaryHeap;
use core::cmp::Ordering;

/// One scheduled callback. `rounds` is a countdown of remaining periodic
/// firings: `-1` means "forever", `1` means "fire once more then drop".
#[derive(Clone, Copy)]
pub struct Task {
    pub time: u64,
    pub interval: u64,
    pub rounds: i64,
    pub callback: fn(),
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
    }
}
impl Eq for Task {}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline first.
        other.time.cmp(&self.time)
    }
}
impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A device exposing a free-running counter and a single comparator
/// interrupt, with conversions between wall-clock seconds and the device's
/// native tick units.
pub trait TimableDevice {
    fn now(&self) -> u64;
    fn time_to_next(&self) -> u64;
    fn convert_seconds(&self, seconds: f64) -> u64;
    fn convert_rate(&self, hz: u64) -> u64;
    fn set_interrupt_relative(&self, ticks: u64);
    fn set_interrupt_absolute(&self, time: u64);
    fn set_interrupt_periodic(&self, interval: u64);
}

/// Min-heap of pending tasks plus the one currently armed on hardware.
///
/// `push_task` inserts in time order; `run` is called from the device's
/// interrupt handler and re-arms the comparator for whichever task is now
/// soonest, firing and requeuing/dropping the task that just matured.
pub struct TaskQueue {
    heap: BinaryHeap<Task>,
    active: Option<Task>,
}

impl TaskQueue {
    pub const fn new() -> Self {
        Self { heap: BinaryHeap::new(), active: None }
    }

    pub fn push_task(&mut self, task: Task) {
        match self.active {
            Some(active) if task.time < active.time => {
                self.heap.push(active);
                self.active = Some(task);
            }
            Some(_) => self.heap.push(task),
            None => self.active = Some(task),
        }
    }

    /// Pushes a task that fires after `delay_ticks` and then every
    /// `rate_ticks` thereafter, for `rounds` total firings (`-1` = forever).
    pub fn push_task_rate(&mut self, delay_ticks: u64, rate_ticks: u64, rounds: i64, callback: fn(), now: u64) {
        self.push_task(Task { time: now + delay_ticks, interval: rate_ticks, rounds, callback });
    }

    /// Deadline (in device ticks) of the next task, or `None` if the queue
    /// is empty.
    pub fn next_deadline(&self) -> Option<u64> {
        self.active.map(|t| t.time)
    }

    /// Run due tasks, firing the active task's callback if `now` has passed
    /// its deadline, then promoting the next-soonest queued task to active.
    /// Returns the new deadline to arm the comparator for, if any remain.
    pub fn run(&mut self, now: u64) -> Option<u64> {
        while let Some(task) = self.active {
            if task.time > now {
                break;
            }

            (task.callback)();

            if task.rounds == 1 {
                self.active = self.heap.pop();
            } else {
                let rounds = if task.rounds < 0 { task.rounds } else { task.rounds - 1 };
                let requeued = Task { time: task.time + task.interval, interval: task.interval, rounds, callback: task.callback };
                self.active = self.heap.pop();
                self.push_task(requeued);
            }
        }
        self.next_deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static mut FIRE_COUNT: u32 = 0;
    fn bump() {
        unsafe { FIRE_COUNT += 1 };
    }

    #[test]
    fn run_fires_due_tasks_in_order() {
        unsafe { FIRE_COUNT = 0 };
        let mut q = TaskQueue::new();
        q.push_task(Task { time: 10, interval: 0, rounds: 1, callback: bump });
        q.push_task(Task { time: 5, interval: 0, rounds: 1, callback: bump });
        let next = q.run(7);
        assert_eq!(unsafe { FIRE_COUNT }, 1);
        assert_eq!(next, Some(10));
        q.run(10);
        assert_eq!(unsafe { FIRE_COUNT }, 2);
        assert_eq!(q.next_deadline(), None);
    }

    #[test]
    fn periodic_task_requeues_with_decremented_rounds() {
        unsafe { FIRE_COUNT = 0 };
        let mut q = TaskQueue::new();
        q.push_task(Task { time: 1, interval: 5, rounds: 2, callback: bump });
        q.run(1);
        assert_eq!(q.next_deadline(), Some(6));
        q.run(6);
        assert_eq!(unsafe { FIRE_COUNT }, 2);
        assert_eq!(q.next_deadline(), None);
    }
}
