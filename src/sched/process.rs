//! Per-task state: the scheduler unit, its waiting state, and the load
//! classification [`ThreadScheduler`] uses to balance new work across cores.

use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// What kind of work a task mostly does, used only to balance
    /// [`crate::sched::system::SystemScheduler::send_task`] placement by
    /// resource pressure rather than raw count.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct LoadType: u32 {
        const INTEGER    = 1 << 0;
        const FLOATING   = 1 << 1;
        const MEMORY     = 1 << 2;
        const PERIPHERAL = 1 << 3;
        const PCI_BUS    = 1 << 4;
        const IO_BUS     = 1 << 5;
        const SYSTEM     = 1 << 6;
        const GENERIC    = 1 << 7;
    }
}

/// Whether a task is eligible to run this scan.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Ready to run.
    None,
    /// Never scheduled until explicitly resumed.
    Skip,
    /// Ready only once `wake_at_us` has passed; checked lazily by the
    /// scheduler rather than removed from the run list, so resuming it
    /// needs no separate wake queue.
    LazyCheck { wake_at_us: u64 },
}

/// Saved general-purpose register state for a suspended task.
///
/// A real context switch restores this from (and captures it into) the
/// interrupt frame the preemption landed on; until the SYSCALL/interrupt
/// trampoline in `arch::x86_64::syscall`/`idt` does that save/restore, this
/// is bookkeeping only.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct SavedState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

pub type TaskId = u32;

/// One schedulable unit of execution.
pub struct Task {
    pub id: TaskId,
    pub load_type: LoadType,
    pub waiting: WaitState,

    /// Quantum length, in scheduler ticks, before this task is preempted.
    pub priority: u32,
    /// How many more times this task is re-entered after its current run
    /// ends; `0` means "run once more, then free".
    pub rounds: u32,
    /// Ticks elapsed in the current quantum.
    pub priority_count: u32,

    pub saved_state: SavedState,
    pub entry: fn(),

    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
}

impl Task {
    pub fn new(id: TaskId, load_type: LoadType, priority: u32, rounds: u32, entry: fn(), parent: Option<TaskId>) -> Self {
        Self {
            id,
            load_type,
            waiting: WaitState::None,
            priority,
            rounds,
            priority_count: 0,
            saved_state: SavedState::default(),
            entry,
            parent,
            children: Vec::new(),
        }
    }

    /// Whether this task should be considered in the current scheduling scan.
    pub fn check_waiting(&self, now_us: u64) -> bool {
        match self.waiting {
            WaitState::None => true,
            WaitState::Skip => false,
            WaitState::LazyCheck { wake_at_us } => now_us >= wake_at_us,
        }
    }
}
