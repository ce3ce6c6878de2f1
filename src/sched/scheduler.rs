//! Round-robin scheduler for one logical core.
//!
//! The run algorithm is the one-core scheduling tick: charge the current
//! task's quantum, and once it's spent, scan forward for the next task whose
//! [`WaitState`] says it's ready, wrapping back to the start. A full circle
//! with nothing ready means the core has no work and should sleep until the
//! next interrupt.
//!
//! Only one [`ThreadScheduler`] (the BSP's) exists today; `arch::x86_64::smp`
//! brings APs up to the point of calling `percpu::init_ap`, but per-CPU
//! scheduler pointers aren't wired into `CpuLocal` yet, so every core's timer
//! interrupt currently lands on this same instance. Splitting one instance
//! per core is a matter of storing `&'static ThreadScheduler` in `CpuLocal`
//! once that field exists.

use super::process::{Task, TaskId, WaitState};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

pub struct ThreadScheduler {
    tasks: Vec<Task>,
    current_task_index: usize,
    total_load: u32,
    load_field: [u32; 8],
    next_id: AtomicU32,
    in_sleep: AtomicBool,
}

impl ThreadScheduler {
    const fn new() -> Self {
        Self {
            tasks: Vec::new(),
            current_task_index: 0,
            total_load: 0,
            load_field: [0; 8],
            next_id: AtomicU32::new(1),
            in_sleep: AtomicBool::new(false),
        }
    }

    pub fn total_load(&self) -> u32 {
        self.total_load
    }

    pub fn alloc_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_task(&mut self, task: Task) {
        self.total_load += task.priority;
        for i in 0..8 {
            if task.load_type.bits() & (1 << i) != 0 {
                self.load_field[i] += 1;
            }
        }
        self.tasks.push(task);
        self.in_sleep.store(false, Ordering::Relaxed);
    }

    fn remove_at(&mut self, index: usize) -> Task {
        let task = self.tasks.remove(index);
        self.total_load = self.total_load.saturating_sub(task.priority);
        for i in 0..8 {
            if task.load_type.bits() & (1 << i) != 0 {
                self.load_field[i] = self.load_field[i].saturating_sub(1);
            }
        }
        task
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.tasks.get(self.current_task_index)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        self.tasks.get_mut(self.current_task_index)
    }

    /// Forward scan for the next ready task starting after `from`, wrapping
    /// once. Returns `None` if nothing but `from` itself is ready.
    fn next_ready(&self, from: usize, now_us: u64) -> Option<usize> {
        if self.tasks.is_empty() {
            return None;
        }
        let mut index = from;
        loop {
            index = (index + 1) % self.tasks.len();
            if index == from {
                return None;
            }
            if self.tasks[index].check_waiting(now_us) {
                return Some(index);
            }
        }
    }

    /// One scheduling-timer tick: charge the running task's quantum, and on
    /// exhaustion advance to the next ready task.
    pub fn tick(&mut self, now_us: u64) {
        if self.in_sleep.load(Ordering::Relaxed) {
            if !self.tasks.is_empty() {
                self.in_sleep.store(false, Ordering::Relaxed);
                self.current_task_index = 0;
            }
            return;
        }

        let previous = self.current_task_index;
        let quantum_spent = match self.current_task() {
            Some(task) => task.priority_count >= task.priority,
            None => return,
        };

        if !quantum_spent {
            if let Some(task) = self.current_task_mut() {
                task.priority_count += 1;
            }
            return;
        }

        match self.next_ready(previous, now_us) {
            Some(index) => {
                self.current_task_index = index;
                if let Some(task) = self.current_task_mut() {
                    task.priority_count = 0;
                }
            }
            None => {
                // No other task ready; either repeat this one or sleep.
                if self.tasks.len() <= 1 {
                    if let Some(task) = self.current_task_mut() {
                        task.priority_count = 0;
                    }
                } else {
                    self.in_sleep.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// Cooperative yield: unconditionally advance to the next ready task,
    /// regardless of remaining quantum.
    pub fn yield_now(&mut self, now_us: u64) {
        let previous = self.current_task_index;
        match self.next_ready(previous, now_us) {
            Some(index) => {
                self.current_task_index = index;
                if let Some(task) = self.current_task_mut() {
                    task.priority_count = 0;
                }
            }
            None if self.tasks.len() <= 1 => {}
            None => self.in_sleep.store(true, Ordering::Relaxed),
        }
    }

    /// Called when the current task's `rounds` reach zero: drop it and move
    /// on to whatever's next, same as a forced quantum exhaustion.
    pub fn end_of_task(&mut self, now_us: u64) {
        let index = self.current_task_index;
        if index >= self.tasks.len() {
            return;
        }
        if self.tasks[index].rounds == 0 {
            self.remove_at(index);
            if index < self.tasks.len() {
                self.current_task_index = index % self.tasks.len().max(1);
            } else {
                self.current_task_index = 0;
            }
        } else {
            self.tasks[index].rounds -= 1;
        }
        self.tick(now_us);
    }
}

static BSP_SCHEDULER: Mutex<ThreadScheduler> = Mutex::new(ThreadScheduler::new());

pub fn with_scheduler<R>(f: impl FnOnce(&mut ThreadScheduler) -> R) -> R {
    f(&mut BSP_SCHEDULER.lock())
}

static RESCHEDULE_PENDING: AtomicBool = AtomicBool::new(false);

/// Called from the local-APIC timer interrupt handler.
pub fn tick() {
    super::system::drain_pile_refills();
    let now_us = crate::time::uptime_us();
    BSP_SCHEDULER.lock().tick(now_us);
    if RESCHEDULE_PENDING.swap(false, Ordering::AcqRel) {
        BSP_SCHEDULER.lock().yield_now(now_us);
    }
}

/// Called from the reschedule IPI handler, requesting that this core give up
/// the current task at its next tick.
pub fn request_reschedule() {
    RESCHEDULE_PENDING.store(true, Ordering::Release);
}

/// Cooperative yield from kernel code running outside interrupt context
/// (e.g. [`crate::time::sleep`]).
pub fn yield_now() {
    let now_us = crate::time::uptime_us();
    BSP_SCHEDULER.lock().yield_now(now_us);
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::process::LoadType;

    fn noop() {}

    #[test]
    fn tick_advances_after_quantum_exhausted() {
        let mut sched = ThreadScheduler::new();
        sched.add_task(Task::new(1, LoadType::GENERIC, 1, 1, noop, None));
        sched.add_task(Task::new(2, LoadType::GENERIC, 1, 1, noop, None));
        assert_eq!(sched.current_task().unwrap().id, 1);
        sched.tick(0);
        assert_eq!(sched.current_task().unwrap().id, 2);
    }

    #[test]
    fn single_task_keeps_running() {
        let mut sched = ThreadScheduler::new();
        sched.add_task(Task::new(1, LoadType::GENERIC, 1, 1, noop, None));
        sched.tick(0);
        sched.tick(0);
        assert_eq!(sched.current_task().unwrap().id, 1);
    }

    #[test]
    fn skip_task_is_not_scheduled() {
        let mut sched = ThreadScheduler::new();
        sched.add_task(Task::new(1, LoadType::GENERIC, 1, 1, noop, None));
        let mut skipped = Task::new(2, LoadType::GENERIC, 1, 1, noop, None);
        skipped.waiting = WaitState::Skip;
        sched.add_task(skipped);
        sched.tick(0);
        assert_eq!(sched.current_task().unwrap().id, 1);
    }
}
