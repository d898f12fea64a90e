//! # Timed-Block Timer Service
//!
//! Maps absolute wake deadlines onto the single hardware compare channel.
//!
//! The hardware counter counts microseconds and wraps every
//! `TIMER_EPOCH_US`; the wrap raises the overflow interrupt, which bumps the
//! software epoch. A deadline is therefore a `{epoch, micros}` pair and the
//! compare channel only ever holds an offset inside the current epoch.
//!
//! ```text
//!  epoch n                        epoch n+1
//!  |----x-------x-----------------|----x------...
//!       ^       ^                      ^
//!       |       next compare           due at overflow
//!       now
//! ```
//!
//! The deadline "queue" is a scan of the task table. There is no ordered
//! structure: every match or overflow walks all slots, wakes what is due and
//! picks the nearest remaining in-epoch deadline as the next compare value.

use log::trace;

use crate::config::{MAX_TASKS, TIMER_EPOCH_US};
use crate::scheduler::Scheduler;
use crate::task::{BlockObject, Priority, TaskId, UnblockReason, WakeTime};

/// The one compare channel of the hardware microsecond timer.
pub trait CompareTimer {
    /// Microseconds elapsed in the current epoch.
    fn counter(&self) -> u32;
    /// The counter wrapped and the overflow interrupt has not run yet.
    fn overflow_pending(&self) -> bool;
    /// Raise the sleep-match interrupt when the counter reaches `micros`.
    fn set_compare(&self, micros: u32);
    fn disable_compare(&self);
}

pub struct SleepTimer {
    hw: &'static dyn CompareTimer,
    epoch: u32,
    /// Mirror of the programmed compare value.
    compare: Option<u32>,
}

impl SleepTimer {
    pub fn new(hw: &'static dyn CompareTimer) -> Self {
        hw.disable_compare();
        Self { hw, epoch: 0, compare: None }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Programmed compare value, `None` while the channel is disabled.
    pub fn compare(&self) -> Option<u32> {
        self.compare
    }

    /// Absolute time in microseconds.
    ///
    /// Correct inside a critical section too, where a wrap may be pending
    /// with the epoch not yet bumped.
    pub fn now(&self) -> u64 {
        let epoch_us = TIMER_EPOCH_US as u64;
        let counter = self.hw.counter();
        if self.hw.overflow_pending() {
            // Re-read: the first value may predate the wrap.
            return (self.epoch as u64 + 1) * epoch_us + self.hw.counter() as u64;
        }
        self.epoch as u64 * epoch_us + counter as u64
    }

    /// Block `tid` on `object` until `abs_us` or an earlier unrelated wake.
    ///
    /// Returns `false` without blocking if the deadline has already passed;
    /// the task is then re-activated with reason `Sleep`.
    pub fn timed_block(
        &mut self,
        sched: &mut Scheduler,
        tid: TaskId,
        object: BlockObject,
        abs_us: u64,
    ) -> bool {
        let wake = WakeTime::from_absolute(abs_us);
        let now = self.hw.counter();
        let Some(task) = sched.tasks.get_mut(tid) else {
            return false;
        };
        if wake.is_due(self.epoch, now) {
            sched.tasks.assert_active(tid, UnblockReason::Sleep);
            return false;
        }

        task.wake = wake;
        task.block_object = Some(object);
        sched.tasks.deassert_active(tid);
        trace!("task {} sleeps until {}:{}", tid.0, wake.epoch, wake.micros);

        if wake.epoch == self.epoch && self.compare.map_or(true, |c| wake.micros < c) {
            self.program(Some(wake.micros));
            // The counter may have passed the new value while it was written.
            if self.hw.counter() >= wake.micros {
                self.rescan(sched);
            }
        }
        sched.update_on_sleep();
        true
    }

    /// Counter wrapped: start a new epoch and wake everything now due.
    pub fn on_overflow(&mut self, sched: &mut Scheduler) {
        self.epoch = (self.epoch + 1).min(WakeTime::INVALID_EPOCH - 1);
        self.compare = None;
        self.rescan(sched);
    }

    /// The compare channel matched.
    pub fn on_sleep_match(&mut self, sched: &mut Scheduler) {
        self.rescan(sched);
    }

    /// Wake every due task, reprogram the channel to the nearest remaining
    /// in-epoch deadline, and let the scheduler see the highest woken
    /// priority. Returns that priority, if anything woke.
    fn rescan(&mut self, sched: &mut Scheduler) -> Option<Priority> {
        let now = self.hw.counter();
        let mut woken: Option<Priority> = None;
        let mut next: Option<u32> = None;

        for index in 1..MAX_TASKS {
            let id = TaskId(index);
            let Some(task) = sched.tasks.get(id) else {
                continue;
            };
            if task.is_active() || task.is_zombie() || !task.wake.is_set() {
                continue;
            }
            if task.wake.is_due(self.epoch, now) {
                let priority = task.priority;
                sched.tasks.assert_active(id, UnblockReason::Sleep);
                woken = Some(woken.map_or(priority, |p| p.max(priority)));
            } else if task.wake.epoch == self.epoch {
                let micros = task.wake.micros;
                next = Some(next.map_or(micros, |n| n.min(micros)));
            }
        }

        self.program(next);
        if let Some(priority) = woken {
            sched.update_on_wake(priority);
        }
        woken
    }

    fn program(&mut self, compare: Option<u32>) {
        match compare {
            Some(micros) => self.hw.set_compare(micros),
            None => self.hw.disable_compare(),
        }
        self.compare = compare;
    }
}
