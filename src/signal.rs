//! # Signals
//!
//! Signal numbers, per-task signal sets and the delivery policy. Delivery
//! is the path by which a blocked task is interrupted (reason SIGNAL) and by
//! which the fault handler kills a task.

use bitflags::bitflags;
use log::{debug, trace};

use crate::error::Errno;
use crate::kernel::Kernel;
use crate::task::{TaskFlags, TaskId, UnblockReason};

/// Signal numbers (Linux numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    Hup = 1,
    Int = 2,
    Kill = 9,
    Usr1 = 10,
    Usr2 = 12,
    Alrm = 14,
    Term = 15,
    Chld = 17,
    Cont = 18,
    Stop = 19,
}

impl Signal {
    pub const fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Some(match n {
            1 => Signal::Hup,
            2 => Signal::Int,
            9 => Signal::Kill,
            10 => Signal::Usr1,
            12 => Signal::Usr2,
            14 => Signal::Alrm,
            15 => Signal::Term,
            17 => Signal::Chld,
            18 => Signal::Cont,
            19 => Signal::Stop,
            _ => return None,
        })
    }

    pub const fn bit(self) -> SignalSet {
        SignalSet::from_bits_retain(1 << self as u32)
    }

    /// SIGKILL and SIGSTOP can't be caught.
    pub const fn catchable(self) -> bool {
        !matches!(self, Signal::Kill | Signal::Stop)
    }
}

bitflags! {
    /// Set of signals, one bit per signal number.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SignalSet: u32 {
        const HUP = 1 << 1;
        const INT = 1 << 2;
        const KILL = 1 << 9;
        const USR1 = 1 << 10;
        const USR2 = 1 << 12;
        const ALRM = 1 << 14;
        const TERM = 1 << 15;
        const CHLD = 1 << 17;
        const CONT = 1 << 18;
        const STOP = 1 << 19;
    }
}

/// What delivering a signal does to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Terminate,
    Stop,
    Continue,
    Ignore,
    /// Caught: record it and wake the task so its handler can run.
    Catch,
}

/// Delivery policy for `signal` given the target's catch mask.
pub fn disposition(signal: Signal, caught: SignalSet) -> Disposition {
    match signal {
        Signal::Kill => Disposition::Terminate,
        Signal::Stop => Disposition::Stop,
        Signal::Cont => Disposition::Continue,
        s if caught.contains(s.bit()) => Disposition::Catch,
        Signal::Chld => Disposition::Ignore,
        _ => Disposition::Terminate,
    }
}

/// Exit status reported for a task terminated by `signal`.
pub const fn killed_status(signal: Signal) -> i32 {
    128 + signal as i32
}

impl Kernel {
    /// Deliver `signal` to task `id`.
    ///
    /// Fails with `ESRCH` if the slot is free or already a zombie, and with
    /// `EPERM` for the kernel context.
    pub fn send_signal(&mut self, id: TaskId, signal: Signal) -> Result<(), Errno> {
        if id.is_kernel() {
            return Err(Errno::Perm);
        }
        let task = self.sched.tasks.get_mut(id).ok_or(Errno::Srch)?;
        if task.is_zombie() {
            return Err(Errno::Srch);
        }
        let action = disposition(signal, task.caught_signals);
        trace!("signal {:?} -> task {}: {:?}", signal, id.0, action);

        match action {
            Disposition::Terminate => {
                task.pending_signals.insert(signal.bit());
                self.exit(id, killed_status(signal));
            }
            Disposition::Stop => {
                task.flags.insert(TaskFlags::STOPPED);
                self.sched.tasks.deassert_active(id);
                // A stopped task that was running gives up the CPU.
                self.sched.update_on_sleep();
            }
            Disposition::Continue => {
                let was_stopped = task.flags.contains(TaskFlags::STOPPED);
                task.flags.remove(TaskFlags::STOPPED);
                if was_stopped && task.block_object.is_none() {
                    let priority = task.priority;
                    self.sched.tasks.assert_active(id, UnblockReason::Signal);
                    self.sched.update_on_wake(priority);
                }
            }
            Disposition::Ignore => {}
            Disposition::Catch => {
                task.pending_signals.insert(signal.bit());
                task.flags.insert(TaskFlags::SIGCAUGHT);
                // A task between submit and park is still active; clearing
                // its wait channel keeps it from parking.
                if task.block_object.is_some() {
                    let (priority, was_active) = (task.priority, task.is_active());
                    debug!("signal interrupts blocked task {}", id.0);
                    self.sched.tasks.assert_active(id, UnblockReason::Signal);
                    if !was_active {
                        self.sched.update_on_wake(priority);
                    }
                }
            }
        }
        Ok(())
    }

    /// Register `set` as the signals task `id` handles itself.
    pub fn catch_signals(&mut self, id: TaskId, set: SignalSet) -> Result<(), Errno> {
        let task = self.sched.tasks.get_mut(id).ok_or(Errno::Srch)?;
        task.caught_signals = set - SignalSet::KILL - SignalSet::STOP;
        Ok(())
    }

    /// Drain the pending signals of task `id`.
    pub fn take_pending_signals(&mut self, id: TaskId) -> SignalSet {
        match self.sched.tasks.get_mut(id) {
            Some(task) => {
                task.flags.remove(TaskFlags::SIGCAUGHT);
                core::mem::take(&mut task.pending_signals)
            }
            None => SignalSet::empty(),
        }
    }
}
