//! # Fault Handling
//!
//! Policy for processor faults, keyed on who was running:
//!
//! - **Kernel context** (task 0): the record is persisted through the
//!   installed [`FaultLog`], an `error!` event is emitted and the kernel dies.
//!   A corrupted kernel cannot be trusted to continue.
//! - **Task**: every task of the faulting process is killed with `SIGKILL`
//!   through the normal signal path. Other processes are untouched.
//!
//! ## Epitaph
//!
//! [`die`] records why the kernel failed for debuggers:
//!
//! - `KERNEL_HAS_FAILED` is set to `true` on the way down. Any second entry
//!   (a fault while dying) halts immediately.
//! - `KERNEL_EPITAPH` receives as much of the failure message as fits, as
//!   UTF-8, padded with NULs.

use core::fmt::{Display, Write};

use log::{error, warn};

use crate::arch;
use crate::config::{EPITAPH_LEN, MAX_TASKS};
use crate::kernel::Kernel;
use crate::signal::Signal;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    HardFault,
    MemManage,
    BusFault,
    UsageFault,
    /// A task handed the kernel something it must never see.
    Protocol,
}

/// What the fault handler knows about one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub tid: TaskId,
    pub pid: TaskId,
    pub kind: FaultKind,
    pub pc: u32,
    /// Faulting data address, when the fault status registers hold one.
    pub address: Option<u32>,
}

/// Non-volatile storage for one fault record across a reset.
pub trait FaultLog {
    fn persist(&mut self, record: &FaultRecord);
    /// Read back and clear the stored record.
    fn recall(&mut self) -> Option<FaultRecord>;
}

/// Keeps the record in a RAM slot. Survives a warm reset only when placed
/// in a section the startup code does not zero.
#[derive(Debug, Default)]
pub struct RamFaultLog {
    slot: Option<FaultRecord>,
}

impl RamFaultLog {
    pub const fn new() -> Self {
        Self { slot: None }
    }
}

impl FaultLog for RamFaultLog {
    fn persist(&mut self, record: &FaultRecord) {
        self.slot = Some(*record);
    }

    fn recall(&mut self) -> Option<FaultRecord> {
        self.slot.take()
    }
}

impl Kernel {
    /// Install the fault log and report a record left by the previous boot.
    /// The record is recalled exactly once.
    pub fn install_fault_log(&mut self, log: &'static mut dyn FaultLog) {
        if let Some(record) = log.recall() {
            warn!(
                "previous boot died: {:?} in task {} (pid {}) at pc {:#010x}",
                record.kind, record.tid.0, record.pid.0, record.pc
            );
            self.boot_fault = Some(record);
        }
        self.fault_log = Some(log);
    }

    /// Fault record recalled at boot, if any.
    pub fn boot_fault(&self) -> Option<&FaultRecord> {
        self.boot_fault.as_ref()
    }

    /// Apply the fault policy. Returns only for task faults.
    pub fn handle_fault(&mut self, record: FaultRecord) {
        if record.tid.is_kernel() {
            if let Some(log) = self.fault_log.as_mut() {
                log.persist(&record);
            }
            error!("kernel fault: {:?} at pc {:#010x}", record.kind, record.pc);
            die(format_args!("kernel {:?} at pc {:#010x}", record.kind, record.pc));
        }

        let Some(pid) = self.sched.tasks.get(record.tid).map(|t| t.pid) else {
            return;
        };
        warn!(
            "task {} (pid {}) {:?} at pc {:#010x}, addr {:?}",
            record.tid.0, pid.0, record.kind, record.pc, record.address
        );

        if let Some(main) = self.sched.tasks.get_mut(pid) {
            main.reset_stack();
        }
        for index in 1..MAX_TASKS {
            let id = TaskId(index);
            let member = self
                .sched
                .tasks
                .get(id)
                .is_some_and(|t| t.pid == pid && !t.is_zombie());
            if !member {
                continue;
            }
            // SIGKILL is only refused for slots skipped above. A refusal
            // must still not leave a faulted task schedulable.
            if let Err(e) = self.send_signal(id, Signal::Kill) {
                warn!("task {} refused SIGKILL ({e}), removing it", id.0);
                self.devices.disarm_owned_by(id);
                self.heap.release_owned_by(id);
                self.sched.tasks.remove(id);
                self.sched.update_on_sleep();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Epitaph
// ---------------------------------------------------------------------------

#[used]
static mut KERNEL_HAS_FAILED: bool = false;

#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: the flag is only touched here, with interrupts masked by the
    // caller's critical section or by the fault exception itself.
    let previous_fail =
        unsafe { core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true) };
    if previous_fail {
        arch::halt();
    }
    // Safety: only the first caller gets past the flag.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Record `msg` as the kernel's epitaph and halt.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();
    arch::halt()
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = core::mem::take(&mut self.dest).split_at_mut(n);
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}
