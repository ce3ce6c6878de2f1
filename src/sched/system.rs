//! Cross-core task placement and the deferred-work queue piles use to ask
//! for an asynchronous refill without taking the allocator's own lock.

use super::process::{LoadType, Task};
use super::scheduler;
use alloc::collections::VecDeque;
use spin::Mutex;

/// Places a new task on whichever core's scheduler currently carries the
/// least total load.
///
/// With a single [`scheduler::ThreadScheduler`] instance today this always
/// resolves to the BSP; the loop is written to scale to multiple instances
/// once per-core scheduler pointers exist in `percpu::CpuLocal`.
pub fn send_task(load_type: LoadType, priority: u32, rounds: u32, entry: fn()) {
    scheduler::with_scheduler(|sched| {
        let id = sched.alloc_id();
        sched.add_task(Task::new(id, load_type, priority, rounds, entry, None));
    });
}

static PENDING_REFILLS: Mutex<VecDeque<(usize, usize)>> = Mutex::new(VecDeque::new());

/// Queues tier `tier` of logical CPU `cpu` for an asynchronous pile refill.
/// The allocating thread that noticed the pile running low calls this
/// instead of refilling inline, so the fast allocation path never blocks on
/// reservoir traffic; the scheduler drains the queue on its next tick.
pub fn request_pile_refill(cpu: usize, tier: usize) {
    PENDING_REFILLS.lock().push_back((cpu, tier));
}

/// Services queued refill requests. Called once per scheduler tick.
pub fn drain_pile_refills() {
    let mut queue = PENDING_REFILLS.lock();
    while let Some((cpu, tier)) = queue.pop_front() {
        crate::mm::pile::pile_on(cpu, tier).refill();
    }
}
