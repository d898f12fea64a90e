//! # Task Control Block
//!
//! Defines the task model for Kestrel. A task is one thread of execution;
//! tasks that share a `pid` form a process whose main thread is the task
//! whose id equals the pid.
//!
//! Tasks live in a fixed arena (see [`crate::table::TaskTable`]) and are
//! referred to by [`TaskId`], never by address. Wait channels are likewise
//! tagged identifiers ([`BlockObject`]) rather than pointers.
//!
//! ## State model
//!
//! ```text
//!            assert_active()                       exit()
//!   ┌─────────┐ ◄──────────── ┌───────────┐   ┌──────────┐   reap()
//!   │ ACTIVE  │               │  blocked  │   │  ZOMBIE  │ ─────────► free
//!   └─────────┘ ────────────► └───────────┘   └──────────┘
//!        │     deassert_active()   (block_object set)
//!        │ SIGSTOP
//!        ▼
//!   ┌─────────┐
//!   │ STOPPED │
//!   └─────────┘
//! ```

use bitflags::bitflags;

use crate::config::TIMER_EPOCH_US;
use crate::device::{DeviceId, Direction};
use crate::error::Errno;
use crate::file::FileTable;
use crate::signal::SignalSet;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Index of a task in the task arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub usize);

impl TaskId {
    /// Slot 0 is the kernel context (and the idle loop).
    pub const KERNEL: TaskId = TaskId(0);

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 == 0
    }
}

/// Scheduling priority. Higher numbers are more important.
pub type Priority = u8;

// ---------------------------------------------------------------------------
// State flags
// ---------------------------------------------------------------------------

bitflags! {
    /// Independent state flags of a task slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u16 {
        /// Runnable.
        const ACTIVE = 1 << 0;
        /// Slot allocated.
        const INUSE = 1 << 1;
        /// Blocked in `waitpid`.
        const WAITCHILD = 1 << 2;
        /// A caught signal is pending delivery.
        const SIGCAUGHT = 1 << 3;
        /// Suspended on an asynchronous I/O list.
        const AIOSUSPEND = 1 << 4;
        /// Exited, waiting to be reaped.
        const ZOMBIE = 1 << 5;
        /// Suspended on a list-I/O batch.
        const LISTIOSUSPEND = 1 << 6;
        /// Stopped by SIGSTOP.
        const STOPPED = 1 << 7;
        /// Inside a privileged synchronous section.
        const PRIV_SYNC = 1 << 8;
    }
}

/// Why a task most recently became ACTIVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockReason {
    None,
    Mutex,
    Semaphore,
    RwLock,
    Cond,
    Sleep,
    Wait,
    Signal,
    Transfer,
    Mq,
    PthreadJoined,
    PthreadJoinedComplete,
    Aio,
}

/// Opaque wait-channel identity of a blocked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockObject {
    /// Waiting for a device transfer in one direction.
    Transfer { device: DeviceId, direction: Direction },
    /// Waiting for another task to exit (join / waitpid on one child).
    Task(TaskId),
    /// Waiting for any child of the process to exit.
    AnyChild,
    /// Plain timed sleep.
    Sleep,
}

// ---------------------------------------------------------------------------
// Wake deadline
// ---------------------------------------------------------------------------

/// Absolute wake deadline in timer-epoch units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeTime {
    pub epoch: u32,
    pub micros: u32,
}

impl WakeTime {
    /// Epoch value meaning "no timeout".
    pub const INVALID_EPOCH: u32 = u32::MAX;

    pub const NEVER: WakeTime = WakeTime { epoch: Self::INVALID_EPOCH, micros: 0 };

    /// Split an absolute microsecond timestamp into `{epoch, micros}`.
    /// Timestamps beyond the last representable epoch saturate just below
    /// `INVALID_EPOCH`.
    pub fn from_absolute(abs_us: u64) -> Self {
        let epoch = abs_us / TIMER_EPOCH_US as u64;
        let micros = (abs_us % TIMER_EPOCH_US as u64) as u32;
        if epoch >= Self::INVALID_EPOCH as u64 {
            WakeTime { epoch: Self::INVALID_EPOCH - 1, micros: TIMER_EPOCH_US - 1 }
        } else {
            WakeTime { epoch: epoch as u32, micros }
        }
    }

    #[inline]
    pub const fn is_set(&self) -> bool {
        self.epoch != Self::INVALID_EPOCH
    }

    /// Due at `(epoch, now)`. An exact match counts as due so a deadline
    /// equal to the programmed compare value always fires.
    #[inline]
    pub const fn is_due(&self, epoch: u32, now: u32) -> bool {
        self.is_set() && (self.epoch < epoch || (self.epoch == epoch && self.micros <= now))
    }
}

// ---------------------------------------------------------------------------
// Memory ownership
// ---------------------------------------------------------------------------

/// Bounds of the memory a task may hand to the kernel as an I/O buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: usize,
    pub len: usize,
}

impl MemoryRegion {
    pub const EMPTY: MemoryRegion = MemoryRegion { base: 0, len: 0 };

    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// `[addr, addr + len)` lies entirely inside this region. Ranges that
    /// wrap the address space are rejected.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        let Some(region_end) = self.base.checked_add(self.len) else {
            return false;
        };
        addr >= self.base && end <= region_end
    }
}

// ---------------------------------------------------------------------------
// Task configuration
// ---------------------------------------------------------------------------

/// Configuration for a task created at boot.
#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    /// Base priority (higher = more important).
    pub priority: Priority,
    /// Memory the task may use as I/O buffers.
    pub memory: MemoryRegion,
    /// Initial (highest) stack address.
    pub stack_top: usize,
}

// ---------------------------------------------------------------------------
// Outstanding I/O
// ---------------------------------------------------------------------------

/// The transfer a task is currently waiting on, and its result once the
/// completion callback has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingIo {
    pub device: DeviceId,
    pub direction: Direction,
    /// Bytes requested; a driver may never report more.
    pub nbyte: usize,
    pub result: Option<Result<usize, Errno>>,
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB).
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Owning process; the id of the process's main thread.
    pub pid: TaskId,
    /// Creator, notified when this task exits.
    pub parent: TaskId,
    pub priority: Priority,
    pub flags: TaskFlags,
    pub unblock_reason: UnblockReason,
    /// Present only while the task is blocked.
    pub block_object: Option<BlockObject>,
    pub wake: WakeTime,
    pub owned_memory: MemoryRegion,
    pub stack_top: usize,
    /// Saved stack pointer. Updated on context switch.
    pub stack_pointer: usize,
    pub pending_signals: SignalSet,
    pub caught_signals: SignalSet,
    pub io: Option<PendingIo>,
    pub files: FileTable,
    pub exit_status: i32,
    /// Last error reported through the syscall surface.
    pub errno: i32,
}

impl Task {
    /// An unallocated slot. Used to initialize the arena.
    pub const EMPTY: Task = Task {
        id: TaskId(0),
        pid: TaskId(0),
        parent: TaskId(0),
        priority: 0,
        flags: TaskFlags::empty(),
        unblock_reason: UnblockReason::None,
        block_object: None,
        wake: WakeTime::NEVER,
        owned_memory: MemoryRegion::EMPTY,
        stack_top: 0,
        stack_pointer: 0,
        pending_signals: SignalSet::empty(),
        caught_signals: SignalSet::empty(),
        io: None,
        files: FileTable::EMPTY,
        exit_status: 0,
        errno: 0,
    };

    /// Initialize a free slot as a runnable task.
    pub fn init(&mut self, id: TaskId, pid: TaskId, parent: TaskId, config: TaskConfig) {
        *self = Task::EMPTY;
        self.id = id;
        self.pid = pid;
        self.parent = parent;
        self.priority = config.priority;
        self.flags = TaskFlags::INUSE | TaskFlags::ACTIVE;
        self.owned_memory = config.memory;
        self.stack_top = config.stack_top;
        self.stack_pointer = config.stack_top;
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.flags.contains(TaskFlags::INUSE)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.flags.contains(TaskFlags::ACTIVE)
    }

    #[inline]
    pub fn is_zombie(&self) -> bool {
        self.flags.contains(TaskFlags::ZOMBIE)
    }

    /// ACTIVE, allocated, and not stopped.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.flags.contains(TaskFlags::INUSE | TaskFlags::ACTIVE)
            && !self.flags.intersects(TaskFlags::STOPPED | TaskFlags::ZOMBIE)
    }

    #[inline]
    pub fn is_main_thread(&self) -> bool {
        self.id == self.pid
    }

    /// Discard the saved context so the task restarts from its stack top.
    pub fn reset_stack(&mut self) {
        self.stack_pointer = self.stack_top;
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
