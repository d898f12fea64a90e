//! # Blocking I/O Bridge
//!
//! Turns a blocking `read()`/`write()` into one call into an
//! interrupt-driven driver plus, when the driver cannot finish right away,
//! a sleep that the driver's completion interrupt ends.
//!
//! ```text
//! START ─► PERMISSION_CHECK ─► MEMORY_VALIDATE ─► DRIVER_INVOKE
//!                                                    │
//!                       ┌────────────────────────────┴──────────┐
//!                       ▼                                       ▼
//!                   SYNC_DONE                            ASYNC_PENDING
//!                       │                                       │ park
//!                       │                                    BLOCKED
//!                       │                                       │ callback / signal
//!                       ▼                                       ▼
//!                   COMPLETE ◄───────────────────────────────  WOKEN ─► ERROR
//! ```
//!
//! A transfer runs in three steps, each inside its own critical section:
//!
//! 1. [`Kernel::submit`] validates the request, marks the caller as blocked
//!    on `(device, direction)` *before* calling the driver, arms the
//!    direction's handler slot and runs the driver's retry loop.
//! 2. [`Kernel::park`] re-checks the wait channel. The completion interrupt
//!    may have fired between the two critical sections; it clears the
//!    channel, and then the caller does not sleep.
//! 3. [`Kernel::resume`] collects the result after the caller runs again,
//!    tearing the driver registration down if the wake was a signal.

use log::{debug, trace};

use crate::config::DRIVER_RETRY_LIMIT;
use crate::device::{AsyncDesc, Callback, DeviceId, Direction, TransferEvent};
use crate::error::{DriverError, Errno};
use crate::file::{Fd, OpenFlags};
use crate::kernel::Kernel;
use crate::scheduler::Scheduler;
use crate::task::{BlockObject, PendingIo, TaskId, UnblockReason};

/// Outcome of [`Kernel::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Finished synchronously with this many bytes.
    Done(usize),
    /// The driver armed the transfer; the caller must park.
    Armed(Ticket),
}

/// Identifies an armed transfer between `submit`, `park` and `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub fd: Fd,
    pub device: DeviceId,
    pub direction: Direction,
}

impl Ticket {
    fn block_object(&self) -> BlockObject {
        BlockObject::Transfer { device: self.device, direction: self.direction }
    }
}

/// Completion callback armed for every bridged transfer. `context` is the
/// waiting task's id.
fn transfer_done(sched: &mut Scheduler, event: &TransferEvent, context: usize) {
    let tid = TaskId(context);
    let Some(task) = sched.tasks.get_mut(tid) else {
        return;
    };
    let Some(io) = task
        .io
        .as_mut()
        .filter(|io| io.device == event.device && io.direction == event.direction)
    else {
        return;
    };
    io.result = Some(match event.result {
        _ if event.canceled => Err(Errno::Again),
        Ok(n) if n > io.nbyte => Err(Errno::Io),
        result => result,
    });

    let object = BlockObject::Transfer { device: event.device, direction: event.direction };
    if task.block_object == Some(object) {
        let priority = task.priority;
        sched.tasks.assert_active(tid, UnblockReason::Transfer);
        sched.update_on_wake(priority);
    }
    trace!("transfer done for task {}: {:?}", tid.0, event.result);
}

impl Kernel {
    /// Validate a transfer on `fd` and hand it to the driver.
    pub fn submit(
        &mut self,
        tid: TaskId,
        fd: Fd,
        direction: Direction,
        buf: usize,
        nbyte: usize,
    ) -> Result<Submitted, Errno> {
        let task = self.sched.tasks.get(tid).ok_or(Errno::Srch)?;
        let file = *task.files.get(fd)?;
        if !file.flags.allows(direction) {
            return Err(Errno::BadF);
        }
        let device = self.devices.get(file.device).ok_or(Errno::Io)?;
        if !device.mode.allows(direction) {
            return Err(Errno::Perm);
        }
        if nbyte == 0 {
            return Ok(Submitted::Done(0));
        }
        if !task.owned_memory.contains(buf, nbyte) {
            debug!("task {}: buffer {buf:#x}+{nbyte} outside owned memory", tid.0);
            return Err(Errno::Perm);
        }
        if device.handlers.slot(direction).is_armed() {
            return Err(Errno::Busy);
        }

        let ticket = Ticket { fd, device: file.device, direction };
        if let Some(task) = self.sched.tasks.get_mut(tid) {
            task.block_object = Some(ticket.block_object());
            task.io = Some(PendingIo { device: file.device, direction, nbyte, result: None });
        }
        let desc = AsyncDesc {
            device: file.device,
            direction,
            loc: file.offset,
            flags: file.flags,
            buf,
            nbyte,
            tid,
        };

        let outcome = self.invoke_driver(tid, desc);
        match outcome {
            Ok(Some(n)) => {
                self.abandon(tid, ticket);
                self.advance_offset(tid, fd, n);
                Ok(Submitted::Done(n))
            }
            Ok(None) if file.flags.contains(OpenFlags::NONBLOCK) => {
                self.cancel_registration(tid, ticket);
                self.abandon(tid, ticket);
                Err(Errno::Again)
            }
            Ok(None) => Ok(Submitted::Armed(ticket)),
            Err(e) => {
                self.abandon(tid, ticket);
                Err(e)
            }
        }
    }

    /// Arm the handler slot and call the driver until it finishes, arms,
    /// fails or runs out of retries. `Ok(None)` means armed.
    fn invoke_driver(&mut self, tid: TaskId, desc: AsyncDesc) -> Result<Option<usize>, Errno> {
        let device = self.devices.get_mut(desc.device).ok_or(Errno::Io)?;
        device
            .handlers
            .slot_mut(desc.direction)
            .arm(Callback { func: transfer_done, context: tid.0 }, tid)?;

        let mut last = Errno::Loop;
        for attempt in 1..=DRIVER_RETRY_LIMIT {
            let mut call = desc;
            let ret = match desc.direction {
                Direction::Read => device.driver.read(&mut call),
                Direction::Write => device.driver.write(&mut call),
            };
            match ret {
                Ok(n) if n > desc.nbyte => return Err(Errno::Io),
                Ok(n) if n > 0 => return Ok(Some(n)),
                Ok(_) if call.nbyte > 0 => return Ok(None),
                Ok(_) => last = Errno::Loop,
                Err(DriverError::Glitch) => last = Errno::Fault,
                Err(DriverError::Errno(e)) => return Err(e),
            }
            debug!("device {} {:?}: no progress (attempt {attempt})", desc.device.0, desc.direction);
        }
        Err(last)
    }

    /// Put the caller to sleep on its armed transfer. Returns `false` when
    /// the completion already ran and the caller must not sleep.
    pub fn park(&mut self, tid: TaskId, ticket: Ticket) -> bool {
        let still_waiting = self
            .sched
            .tasks
            .get(tid)
            .is_some_and(|t| t.block_object == Some(ticket.block_object()));
        if still_waiting {
            self.sched.tasks.deassert_active(tid);
            self.sched.update_on_sleep();
        }
        still_waiting
    }

    /// Collect the result of an armed transfer once the caller runs again.
    ///
    /// Without a result the wake was a signal: the registration is torn
    /// down driver-side and the call fails with `EINTR`.
    pub fn resume(&mut self, tid: TaskId, ticket: Ticket) -> Result<usize, Errno> {
        let task = self.sched.tasks.get_mut(tid).ok_or(Errno::Srch)?;
        let result = task.io.take().and_then(|io| io.result);
        task.block_object = None;

        match result {
            Some(Ok(n)) => {
                self.advance_offset(tid, ticket.fd, n);
                Ok(n)
            }
            Some(Err(e)) => Err(e),
            None => {
                self.cancel_registration(tid, ticket);
                Err(Errno::Intr)
            }
        }
    }

    /// Submit, sleep and resume in one step. Only usable where parking
    /// returns control once the task is scheduled again.
    pub fn transfer(
        &mut self,
        tid: TaskId,
        fd: Fd,
        direction: Direction,
        buf: usize,
        nbyte: usize,
        mut wait: impl FnMut(&mut Kernel),
    ) -> Result<usize, Errno> {
        match self.submit(tid, fd, direction, buf, nbyte)? {
            Submitted::Done(n) => Ok(n),
            Submitted::Armed(ticket) => {
                if self.park(tid, ticket) {
                    wait(self);
                }
                self.resume(tid, ticket)
            }
        }
    }

    /// Driver ISR entry: the armed transfer in `direction` finished.
    pub fn complete_transfer(
        &mut self,
        device: DeviceId,
        direction: Direction,
        result: Result<usize, Errno>,
    ) -> bool {
        self.devices.execute_handler(&mut self.sched, device, direction, result, false)
    }

    /// Driver ISR entry: the device was reset mid-transfer.
    pub fn reset_device(&mut self, device: DeviceId) -> usize {
        self.devices.cancel_all(&mut self.sched, device)
    }

    /// Empty the slot if `tid` still owns it and let the driver tear the
    /// operation down.
    fn cancel_registration(&mut self, tid: TaskId, ticket: Ticket) {
        if let Some(device) = self.devices.get_mut(ticket.device) {
            let slot = device.handlers.slot_mut(ticket.direction);
            if slot.owner() == Some(tid) {
                slot.take();
                device.driver.cancel(ticket.direction);
                debug!("task {}: canceled {:?} on device {}", tid.0, ticket.direction, ticket.device.0);
            }
        }
    }

    /// Forget the transfer state of a call that finished without sleeping.
    fn abandon(&mut self, tid: TaskId, ticket: Ticket) {
        if let Some(device) = self.devices.get_mut(ticket.device) {
            let slot = device.handlers.slot_mut(ticket.direction);
            if slot.owner() == Some(tid) {
                slot.take();
            }
        }
        if let Some(task) = self.sched.tasks.get_mut(tid) {
            task.block_object = None;
            task.io = None;
        }
    }

    fn advance_offset(&mut self, tid: TaskId, fd: Fd, n: usize) {
        if let Some(file) = self.sched.tasks.get_mut(tid).and_then(|t| t.files.get_mut(fd).ok()) {
            file.offset += n as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceMode;
    use crate::signal::{Signal, SignalSet};
    use crate::testing::{boot, spawn, FakeTimer, Probe, Reply, ScriptedDriver, TASK_MEMORY};
    use std::rc::Rc;

    const BUF: usize = TASK_MEMORY.base + 0x100;

    struct Rig {
        k: Kernel,
        task: TaskId,
        dev: DeviceId,
        fd: Fd,
        probe: Rc<Probe>,
        _timer: &'static FakeTimer,
    }

    fn rig(replies: &[Reply], fallback: Reply, flags: OpenFlags) -> Rig {
        let (mut k, timer) = boot();
        let (driver, probe) = ScriptedDriver::scripted(replies, fallback);
        let dev = k.register_device("uart0", DeviceMode::all(), driver).unwrap();
        let task = spawn(&mut k, 4);
        assert_eq!(k.schedule(), task);
        let fd = k.open(task, "uart0", flags).unwrap();
        Rig { k, task, dev, fd, probe, _timer: timer }
    }

    #[test]
    fn test_scenario_a_async_read_completes() {
        let mut r = rig(&[], Reply::Arm, OpenFlags::RDONLY);
        let Submitted::Armed(ticket) = r.k.submit(r.task, r.fd, Direction::Read, BUF, 10).unwrap()
        else {
            panic!("expected an armed transfer");
        };
        assert_eq!(r.probe.last().unwrap().nbyte, 10);
        assert!(r.k.park(r.task, ticket));
        assert!(!r.k.sched.tasks.get(r.task).unwrap().is_active());
        assert_eq!(r.k.schedule(), TaskId::KERNEL);

        assert!(r.k.complete_transfer(r.dev, Direction::Read, Ok(6)));
        let task = r.k.sched.tasks.get(r.task).unwrap();
        assert!(task.is_active());
        assert_eq!(task.unblock_reason, UnblockReason::Transfer);
        assert!(r.k.sched.needs_reschedule());
        assert_eq!(r.k.schedule(), r.task);

        assert_eq!(r.k.resume(r.task, ticket), Ok(6));
        let task = r.k.sched.tasks.get(r.task).unwrap();
        assert_eq!(task.files.get(r.fd).unwrap().offset, 6);
        assert_eq!(task.io, None);
    }

    #[test]
    fn test_completion_before_park_does_not_sleep() {
        let mut r = rig(&[], Reply::Arm, OpenFlags::RDONLY);
        let Ok(Submitted::Armed(ticket)) = r.k.submit(r.task, r.fd, Direction::Read, BUF, 4) else {
            panic!("expected an armed transfer");
        };
        // Interrupt fires between the driver call and the park.
        r.k.complete_transfer(r.dev, Direction::Read, Ok(4));
        assert!(!r.k.park(r.task, ticket));
        assert!(r.k.sched.tasks.get(r.task).unwrap().is_runnable());
        assert_eq!(r.k.resume(r.task, ticket), Ok(4));
    }

    #[test]
    fn test_scenario_b_signal_interrupts_write() {
        let mut r = rig(&[], Reply::Arm, OpenFlags::WRONLY);
        r.k.catch_signals(r.task, SignalSet::USR1).unwrap();
        let Ok(Submitted::Armed(ticket)) = r.k.submit(r.task, r.fd, Direction::Write, BUF, 8)
        else {
            panic!("expected an armed transfer");
        };
        assert!(r.k.park(r.task, ticket));

        r.k.send_signal(r.task, Signal::Usr1).unwrap();
        assert_eq!(r.k.sched.tasks.unblock_reason_of(r.task), UnblockReason::Signal);
        assert_eq!(r.k.resume(r.task, ticket), Err(Errno::Intr));
        assert_eq!(r.probe.cancels(), vec![Direction::Write]);
        assert!(!r.k.devices.get(r.dev).unwrap().handlers.write.is_armed());

        // A late completion finds nothing to deliver to.
        assert!(!r.k.complete_transfer(r.dev, Direction::Write, Ok(8)));
    }

    #[test]
    fn test_signal_before_park_still_interrupts() {
        let mut r = rig(&[], Reply::Arm, OpenFlags::WRONLY);
        r.k.catch_signals(r.task, SignalSet::USR1).unwrap();
        let Ok(Submitted::Armed(ticket)) = r.k.submit(r.task, r.fd, Direction::Write, BUF, 8)
        else {
            panic!("expected an armed transfer");
        };
        // Signal lands while the caller is still active, before it parks.
        r.k.send_signal(r.task, Signal::Usr1).unwrap();
        assert_eq!(r.k.sched.tasks.get(r.task).unwrap().block_object, None);
        assert!(!r.k.park(r.task, ticket));
        assert!(r.k.sched.tasks.get(r.task).unwrap().is_runnable());

        assert_eq!(r.k.resume(r.task, ticket), Err(Errno::Intr));
        assert_eq!(r.probe.cancels(), vec![Direction::Write]);
        assert!(!r.k.devices.get(r.dev).unwrap().handlers.write.is_armed());
    }

    #[test]
    fn test_overlong_driver_count_is_an_io_error() {
        let mut r = rig(&[], Reply::Complete(12), OpenFlags::RDONLY);
        assert_eq!(r.k.submit(r.task, r.fd, Direction::Read, BUF, 4), Err(Errno::Io));
        assert_eq!(r.probe.reads(), 1);
        let task = r.k.sched.tasks.get(r.task).unwrap();
        assert_eq!(task.files.get(r.fd).unwrap().offset, 0);
        assert_eq!(task.block_object, None);

        let mut r = rig(&[], Reply::Arm, OpenFlags::RDONLY);
        let Ok(Submitted::Armed(ticket)) = r.k.submit(r.task, r.fd, Direction::Read, BUF, 4) else {
            panic!("expected an armed transfer");
        };
        r.k.park(r.task, ticket);
        assert!(r.k.complete_transfer(r.dev, Direction::Read, Ok(64)));
        assert_eq!(r.k.resume(r.task, ticket), Err(Errno::Io));
        assert_eq!(r.k.sched.tasks.get(r.task).unwrap().files.get(r.fd).unwrap().offset, 0);
    }

    #[test]
    fn test_scenario_c_idle_driver_gives_eloop() {
        let mut r = rig(&[], Reply::Idle, OpenFlags::RDONLY);
        let err = r.k.submit(r.task, r.fd, Direction::Read, BUF, 10);
        assert_eq!(err, Err(Errno::Loop));
        assert_eq!(r.probe.reads(), DRIVER_RETRY_LIMIT as usize);
        let task = r.k.sched.tasks.get(r.task).unwrap();
        assert_eq!(task.block_object, None);
        assert!(task.is_runnable());
        assert!(!r.k.devices.get(r.dev).unwrap().handlers.read.is_armed());
    }

    #[test]
    fn test_glitch_is_retried_then_efault() {
        let glitch = Reply::Fail(DriverError::Glitch);
        let mut r = rig(&[glitch, glitch], Reply::Complete(3), OpenFlags::RDONLY);
        assert_eq!(r.k.submit(r.task, r.fd, Direction::Read, BUF, 3), Ok(Submitted::Done(3)));
        assert_eq!(r.probe.reads(), 3);

        let mut r = rig(&[], glitch, OpenFlags::RDONLY);
        assert_eq!(r.k.submit(r.task, r.fd, Direction::Read, BUF, 3), Err(Errno::Fault));
        assert_eq!(r.probe.reads(), DRIVER_RETRY_LIMIT as usize);
    }

    #[test]
    fn test_driver_errno_passes_through() {
        let mut r = rig(&[], Reply::Fail(DriverError::Errno(Errno::Other(121))), OpenFlags::RDWR);
        assert_eq!(r.k.submit(r.task, r.fd, Direction::Write, BUF, 1), Err(Errno::Other(121)));
        assert_eq!(r.probe.writes(), 1);
    }

    #[test]
    fn test_sync_completion_advances_offset() {
        let mut r = rig(&[], Reply::Complete(5), OpenFlags::RDWR);
        assert_eq!(r.k.submit(r.task, r.fd, Direction::Write, BUF, 5), Ok(Submitted::Done(5)));
        assert_eq!(r.k.submit(r.task, r.fd, Direction::Read, BUF, 5), Ok(Submitted::Done(5)));
        assert_eq!(r.probe.last().unwrap().loc, 5);
        let task = r.k.sched.tasks.get(r.task).unwrap();
        assert_eq!(task.files.get(r.fd).unwrap().offset, 10);
        assert_eq!(task.block_object, None);
    }

    #[test]
    fn test_buffer_outside_owned_memory_never_reaches_driver() {
        let mut r = rig(&[], Reply::Complete(1), OpenFlags::RDWR);
        let end = TASK_MEMORY.base + TASK_MEMORY.len;
        for (buf, len) in [(end - 4, 8), (TASK_MEMORY.base - 1, 2), (0x0800_0000, 4), (usize::MAX, 2)] {
            assert_eq!(r.k.submit(r.task, r.fd, Direction::Read, buf, len), Err(Errno::Perm));
        }
        assert_eq!(r.probe.calls(), 0);
        assert_eq!(r.k.sched.tasks.get(r.task).unwrap().block_object, None);
    }

    #[test]
    fn test_permission_checks() {
        let mut r = rig(&[], Reply::Complete(1), OpenFlags::RDONLY);
        assert_eq!(r.k.submit(r.task, r.fd, Direction::Write, BUF, 1), Err(Errno::BadF));
        assert_eq!(r.k.submit(r.task, 7, Direction::Read, BUF, 1), Err(Errno::BadF));

        let (driver, probe) = ScriptedDriver::new(Reply::Complete(1));
        r.k.register_device("rom", DeviceMode::READ, driver).unwrap();
        let fd = r.k.open(r.task, "rom", OpenFlags::RDONLY).unwrap();
        r.k.sched.tasks.get_mut(r.task).unwrap().files.get_mut(fd).unwrap().flags = OpenFlags::RDWR;
        assert_eq!(r.k.submit(r.task, fd, Direction::Write, BUF, 1), Err(Errno::Perm));
        assert_eq!(probe.calls(), 0);
    }

    #[test]
    fn test_zero_length_is_checked_then_short_circuits() {
        let mut r = rig(&[], Reply::Arm, OpenFlags::RDONLY);
        assert_eq!(r.k.submit(r.task, r.fd, Direction::Read, 0, 0), Ok(Submitted::Done(0)));
        assert_eq!(r.k.submit(r.task, r.fd, Direction::Write, BUF, 0), Err(Errno::BadF));
        assert_eq!(r.probe.calls(), 0);
        assert_eq!(r.k.sched.tasks.get(r.task).unwrap().io, None);
    }

    #[test]
    fn test_second_transfer_same_direction_is_busy() {
        let mut r = rig(&[], Reply::Arm, OpenFlags::RDWR);
        let other = spawn(&mut r.k, 4);
        let fd = r.k.open(other, "uart0", OpenFlags::RDWR).unwrap();

        assert!(matches!(
            r.k.submit(r.task, r.fd, Direction::Read, BUF, 4),
            Ok(Submitted::Armed(_))
        ));
        assert_eq!(r.k.submit(other, fd, Direction::Read, BUF, 4), Err(Errno::Busy));
        assert!(matches!(r.k.submit(other, fd, Direction::Write, BUF, 4), Ok(Submitted::Armed(_))));
        assert_eq!(r.probe.reads(), 1);
        assert!(r.k.sched.tasks.get(other).unwrap().block_object.is_some());
    }

    #[test]
    fn test_device_reset_wakes_with_eagain() {
        let mut r = rig(&[], Reply::Arm, OpenFlags::RDONLY);
        let Ok(Submitted::Armed(ticket)) = r.k.submit(r.task, r.fd, Direction::Read, BUF, 10)
        else {
            panic!("expected an armed transfer");
        };
        r.k.park(r.task, ticket);
        assert_eq!(r.k.reset_device(r.dev), 1);
        assert!(!r.k.complete_transfer(r.dev, Direction::Read, Ok(10)));
        assert_eq!(r.k.resume(r.task, ticket), Err(Errno::Again));
        assert_eq!(r.k.sched.tasks.get(r.task).unwrap().files.get(r.fd).unwrap().offset, 0);
    }

    #[test]
    fn test_nonblocking_armed_transfer_is_torn_down() {
        let mut r = rig(&[], Reply::Arm, OpenFlags::RDONLY | OpenFlags::NONBLOCK);
        assert_eq!(r.k.submit(r.task, r.fd, Direction::Read, BUF, 10), Err(Errno::Again));
        assert_eq!(r.probe.cancels(), vec![Direction::Read]);
        assert!(!r.k.devices.get(r.dev).unwrap().handlers.read.is_armed());
        assert!(r.k.sched.tasks.get(r.task).unwrap().is_runnable());
    }

    #[test]
    fn test_higher_priority_completion_preempts() {
        let mut r = rig(&[], Reply::Arm, OpenFlags::RDONLY);
        let high = spawn(&mut r.k, 9);
        let fd = r.k.open(high, "uart0", OpenFlags::RDONLY).unwrap();
        assert_eq!(r.k.schedule(), high);
        let Ok(Submitted::Armed(ticket)) = r.k.submit(high, fd, Direction::Read, BUF, 2) else {
            panic!("expected an armed transfer");
        };
        r.k.park(high, ticket);
        assert_eq!(r.k.schedule(), r.task);

        r.k.complete_transfer(r.dev, Direction::Read, Ok(2));
        assert!(r.k.sched.needs_reschedule());
        assert_eq!(r.k.schedule(), high);
    }

    #[test]
    fn test_transfer_runs_wait_only_when_parked() {
        let mut r = rig(&[], Reply::Arm, OpenFlags::RDONLY);
        let dev = r.dev;
        let n = r.k.transfer(r.task, r.fd, Direction::Read, BUF, 9, |k| {
            k.complete_transfer(dev, Direction::Read, Ok(7));
        });
        assert_eq!(n, Ok(7));
    }
}
