//! Host-side fakes shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::device::{AsyncDesc, Direction, Driver};
use crate::error::{DriverError, Errno};
use crate::kernel::Kernel;
use crate::task::{MemoryRegion, Priority, TaskConfig, TaskId};
use crate::timer::CompareTimer;

/// Owned memory handed to every task created by [`spawn`].
pub const TASK_MEMORY: MemoryRegion = MemoryRegion::new(0x2000_0000, 0x1000);

#[derive(Debug, Default)]
pub struct FakeTimer {
    now: Cell<u32>,
    compare: Cell<Option<u32>>,
    overflow: Cell<bool>,
}

impl FakeTimer {
    pub fn leak() -> &'static FakeTimer {
        Box::leak(Box::new(FakeTimer::default()))
    }

    pub fn set_now(&self, micros: u32) {
        self.now.set(micros);
    }

    pub fn compare(&self) -> Option<u32> {
        self.compare.get()
    }

    /// Wrap the counter to `micros` without running the overflow interrupt.
    pub fn wrap_to(&self, micros: u32) {
        self.now.set(micros);
        self.overflow.set(true);
    }
}

impl CompareTimer for FakeTimer {
    fn counter(&self) -> u32 {
        self.now.get()
    }

    fn overflow_pending(&self) -> bool {
        self.overflow.get()
    }

    fn set_compare(&self, micros: u32) {
        self.compare.set(Some(micros));
    }

    fn disable_compare(&self) {
        self.compare.set(None);
    }
}

/// A kernel with a fake timer and an empty heap region.
pub fn boot() -> (Kernel, &'static FakeTimer) {
    let timer = FakeTimer::leak();
    let kernel = Kernel::new(timer, MemoryRegion::new(0x2001_0000, 0x1000));
    (kernel, timer)
}

pub fn spawn(kernel: &mut Kernel, priority: Priority) -> TaskId {
    kernel
        .create_task(TaskConfig { priority, memory: TASK_MEMORY, stack_top: 0x2000_2000 })
        .unwrap()
}

/// How a [`ScriptedDriver`] answers one read or write.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    /// Finish synchronously with `n` bytes.
    Complete(usize),
    /// Arm the transfer and return 0.
    Arm,
    /// Return 0 with `nbyte` cleared.
    Idle,
    Fail(DriverError),
}

/// Observations of a [`ScriptedDriver`], kept after the driver is leaked.
#[derive(Debug, Default)]
pub struct Probe {
    reads: Cell<usize>,
    writes: Cell<usize>,
    cancels: RefCell<Vec<Direction>>,
    last: Cell<Option<AsyncDesc>>,
}

impl Probe {
    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    pub fn calls(&self) -> usize {
        self.reads() + self.writes()
    }

    pub fn cancels(&self) -> Vec<Direction> {
        self.cancels.borrow().clone()
    }

    pub fn last(&self) -> Option<AsyncDesc> {
        self.last.get()
    }
}

/// Driver that answers from a queue of replies, repeating `fallback` once
/// the queue is empty.
pub struct ScriptedDriver {
    queue: VecDeque<Reply>,
    fallback: Reply,
    probe: Rc<Probe>,
}

impl ScriptedDriver {
    pub fn new(fallback: Reply) -> (&'static mut ScriptedDriver, Rc<Probe>) {
        Self::scripted(&[], fallback)
    }

    pub fn scripted(replies: &[Reply], fallback: Reply) -> (&'static mut ScriptedDriver, Rc<Probe>) {
        let probe = Rc::new(Probe::default());
        let driver = ScriptedDriver {
            queue: replies.iter().copied().collect(),
            fallback,
            probe: probe.clone(),
        };
        (Box::leak(Box::new(driver)), probe)
    }

    fn answer(&mut self, desc: &mut AsyncDesc) -> Result<usize, DriverError> {
        self.probe.last.set(Some(*desc));
        match self.queue.pop_front().unwrap_or(self.fallback) {
            Reply::Complete(n) => Ok(n),
            Reply::Arm => Ok(0),
            Reply::Idle => {
                desc.nbyte = 0;
                Ok(0)
            }
            Reply::Fail(e) => Err(e),
        }
    }
}

impl Driver for ScriptedDriver {
    fn read(&mut self, desc: &mut AsyncDesc) -> Result<usize, DriverError> {
        self.probe.reads.set(self.probe.reads.get() + 1);
        self.answer(desc)
    }

    fn write(&mut self, desc: &mut AsyncDesc) -> Result<usize, DriverError> {
        self.probe.writes.set(self.probe.writes.get() + 1);
        self.answer(desc)
    }

    fn ioctl(&mut self, request: &crate::device::IoctlRequest) -> Result<isize, Errno> {
        match request {
            crate::device::IoctlRequest::Custom { cmd, .. } => Ok(*cmd as isize),
            _ => Err(Errno::NoTty),
        }
    }

    fn cancel(&mut self, direction: Direction) {
        self.probe.cancels.borrow_mut().push(direction);
    }
}
