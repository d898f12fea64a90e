//! # Task Table
//!
//! The single source of truth for every task's scheduling state, plus the
//! primitives that move tasks between ACTIVE and blocked.
//!
//! All mutators run inside a critical section or from interrupt context.
//! The kernel is single-core and these are the only writers, so no lock is
//! taken here.

use log::trace;

use crate::config::MAX_TASKS;
use crate::error::KernelError;
use crate::task::{
    MemoryRegion, Priority, Task, TaskConfig, TaskFlags, TaskId, UnblockReason, WakeTime,
};

/// Fixed-size task arena. Slot 0 is the kernel context.
pub struct TaskTable {
    tasks: [Task; MAX_TASKS],
    /// Raised whenever a task leaves ACTIVE so the scheduler notices the
    /// transition without waiting for the end of the quantum.
    status_changed: bool,
}

impl TaskTable {
    /// Create a table holding only the kernel context (slot 0), which owns
    /// the whole address space and runs at the lowest priority.
    pub fn new() -> Self {
        let mut tasks = [Task::EMPTY; MAX_TASKS];
        tasks[0].init(
            TaskId::KERNEL,
            TaskId::KERNEL,
            TaskId::KERNEL,
            TaskConfig {
                priority: 0,
                memory: MemoryRegion::new(0, usize::MAX),
                stack_top: 0,
            },
        );
        Self { tasks, status_changed: false }
    }

    /// Look up an allocated slot.
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.index()).filter(|t| t.in_use())
    }

    /// Look up an allocated slot for mutation.
    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id.index()).filter(|t| t.in_use())
    }

    /// All allocated slots, in table order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.in_use())
    }

    /// All allocated slots, in table order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.iter_mut().filter(|t| t.in_use())
    }

    /// Raw slot access by index for table scans. Includes free slots.
    pub(crate) fn slot(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    // -----------------------------------------------------------------------
    // State primitives
    // -----------------------------------------------------------------------

    /// Make `id` runnable. Clears the wait channel and any pending timeout,
    /// drops AIOSUSPEND and records `reason`, so a woken task never resumes
    /// with stale block state.
    pub fn assert_active(&mut self, id: TaskId, reason: UnblockReason) {
        if let Some(task) = self.get_mut(id) {
            task.block_object = None;
            task.wake = WakeTime::NEVER;
            task.flags.remove(TaskFlags::AIOSUSPEND);
            task.flags.insert(TaskFlags::ACTIVE);
            task.unblock_reason = reason;
            trace!("task {} active ({:?})", id.0, reason);
        }
    }

    /// Take `id` off the run set and raise the "status changed" flag.
    pub fn deassert_active(&mut self, id: TaskId) {
        if let Some(task) = self.get_mut(id) {
            task.flags.remove(TaskFlags::ACTIVE);
            self.status_changed = true;
            trace!("task {} inactive", id.0);
        }
    }

    pub fn assert_flag(&mut self, id: TaskId, flag: TaskFlags) {
        if let Some(task) = self.get_mut(id) {
            task.flags.insert(flag);
        }
    }

    pub fn deassert_flag(&mut self, id: TaskId, flag: TaskFlags) {
        if let Some(task) = self.get_mut(id) {
            task.flags.remove(flag);
        }
    }

    /// Priority of `id`; free slots report the lowest priority.
    pub fn priority_of(&self, id: TaskId) -> Priority {
        self.get(id).map_or(0, |t| t.priority)
    }

    pub fn unblock_reason_of(&self, id: TaskId) -> UnblockReason {
        self.get(id).map_or(UnblockReason::None, |t| t.unblock_reason)
    }

    /// Read and clear the "status changed" flag.
    pub fn take_status_changed(&mut self) -> bool {
        core::mem::take(&mut self.status_changed)
    }

    // -----------------------------------------------------------------------
    // Slot management
    // -----------------------------------------------------------------------

    /// Claim a free slot. `pid` of `None` makes the new task the main
    /// thread of a new process.
    pub fn allocate(
        &mut self,
        pid: Option<TaskId>,
        parent: TaskId,
        config: TaskConfig,
    ) -> Result<TaskId, KernelError> {
        let index = self
            .tasks
            .iter()
            .skip(1)
            .position(|t| !t.in_use())
            .map(|i| i + 1)
            .ok_or(KernelError::TaskTableFull)?;
        let id = TaskId(index);
        self.tasks[index].init(id, pid.unwrap_or(id), parent, config);
        trace!("task {} allocated (pid {})", id.0, pid.unwrap_or(id).0);
        Ok(id)
    }

    /// Zero a slot and return it to the arena. The kernel context is never
    /// removed.
    pub fn remove(&mut self, id: TaskId) {
        if id.is_kernel() {
            return;
        }
        if let Some(task) = self.tasks.get_mut(id.index()) {
            *task = Task::EMPTY;
            self.status_changed = true;
        }
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
