//! # Devices and Transfer Handlers
//!
//! The driver capability trait, the async descriptor handed to drivers, and
//! the per-device transfer-handler slots that track at most one outstanding
//! operation per direction.
//!
//! ## Transfer handler lifecycle
//!
//! ```text
//!   EMPTY ──arm()──► ARMED ──take()──► {COMPLETED | CANCELED} ──► EMPTY
//! ```
//!
//! The stored callback is an `Option` that is taken (read and cleared in one
//! step) before it is invoked, so a completion racing a cancel delivers at
//! most once: whichever side takes the callback first wins, the other finds
//! the slot empty.

use bitflags::bitflags;
use log::trace;

use crate::config::MAX_DEVICES;
use crate::error::{DriverError, Errno, KernelError};
use crate::file::OpenFlags;
use crate::scheduler::Scheduler;
use crate::task::TaskId;

/// Index of a device in the device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub usize);

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

bitflags! {
    /// Access granted by a device node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl DeviceMode {
    pub fn allows(self, direction: Direction) -> bool {
        match direction {
            Direction::Read => self.contains(DeviceMode::READ),
            Direction::Write => self.contains(DeviceMode::WRITE),
        }
    }
}

// ---------------------------------------------------------------------------
// Callbacks and events
// ---------------------------------------------------------------------------

/// A `{callback, context}` pair invoked from interrupt context with the
/// scheduler so it can re-activate tasks.
pub struct Callback<E> {
    pub func: fn(&mut Scheduler, &E, usize),
    pub context: usize,
}

impl<E> Clone for Callback<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Callback<E> {}

impl<E> core::fmt::Debug for Callback<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Callback").field("context", &self.context).finish()
    }
}

impl<E> Callback<E> {
    pub fn invoke(self, sched: &mut Scheduler, event: &E) {
        (self.func)(sched, event, self.context)
    }
}

/// Completion (or cancellation) of an armed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub device: DeviceId,
    pub direction: Direction,
    pub result: Result<usize, Errno>,
    /// Set when the device was reset mid-transfer.
    pub canceled: bool,
}

/// A non-data event (timer match, DMA complete, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEvent {
    pub device: DeviceId,
    pub value: u32,
}

// ---------------------------------------------------------------------------
// Driver interface
// ---------------------------------------------------------------------------

/// Descriptor for one read or write, handed to the driver.
///
/// The driver reports how the call went through its return value and
/// `nbyte`:
///
/// | return      | `nbyte` on return | meaning                                  |
/// |-------------|-------------------|------------------------------------------|
/// | `Ok(n > 0)` | —                 | finished synchronously, `n` bytes moved  |
/// | `Ok(0)`     | `> 0`             | armed; completion arrives via the handler |
/// | `Ok(0)`     | `0`               | nothing happened, call again             |
/// | `Err(e)`    | —                 | could not start                          |
///
/// The completion handler is not part of the descriptor: it lives in the
/// device's [`TransferHandler`] slot for `direction`, and the driver's ISR
/// reaches it through `Kernel::complete_transfer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncDesc {
    pub device: DeviceId,
    pub direction: Direction,
    /// File offset.
    pub loc: u64,
    pub flags: OpenFlags,
    /// Buffer address, already validated against the caller's memory.
    pub buf: usize,
    pub nbyte: usize,
    pub tid: TaskId,
}

impl AsyncDesc {
    /// View the caller's buffer.
    ///
    /// # Safety
    /// `buf..buf + nbyte` was checked to lie in memory owned by `tid`; the
    /// caller must make sure that memory is mapped and not aliased for the
    /// duration of the borrow.
    pub unsafe fn buffer(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.buf as *mut u8, self.nbyte)
    }
}

/// `ioctl()` requests understood by the kernel or forwarded to drivers.
#[derive(Debug, Clone, Copy)]
pub enum IoctlRequest {
    /// Register (`Some`) or remove (`None`) the device's event action.
    SetAction(Option<Callback<DeviceEvent>>),
    /// Driver-specific request.
    Custom { cmd: u32, arg: usize },
}

/// Capability interface of a device driver.
pub trait Driver {
    fn open(&mut self, _flags: OpenFlags) -> Result<(), Errno> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn read(&mut self, desc: &mut AsyncDesc) -> Result<usize, DriverError>;

    fn write(&mut self, desc: &mut AsyncDesc) -> Result<usize, DriverError>;

    fn ioctl(&mut self, _request: &IoctlRequest) -> Result<isize, Errno> {
        Err(Errno::NoTty)
    }

    /// Tear down the armed operation in `direction`. The kernel has already
    /// emptied the handler slot.
    fn cancel(&mut self, _direction: Direction) {}
}

// ---------------------------------------------------------------------------
// Transfer handlers
// ---------------------------------------------------------------------------

/// One direction's outstanding-operation slot.
#[derive(Debug, Default)]
pub struct TransferHandler {
    armed: Option<(Callback<TransferEvent>, TaskId)>,
}

impl TransferHandler {
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Task that owns the armed operation.
    pub fn owner(&self) -> Option<TaskId> {
        self.armed.map(|(_, owner)| owner)
    }

    /// Arm the slot. At most one operation may be outstanding.
    pub fn arm(&mut self, callback: Callback<TransferEvent>, owner: TaskId) -> Result<(), Errno> {
        if self.armed.is_some() {
            return Err(Errno::Busy);
        }
        self.armed = Some((callback, owner));
        Ok(())
    }

    /// Read and clear the stored callback.
    pub fn take(&mut self) -> Option<Callback<TransferEvent>> {
        self.armed.take().map(|(callback, _)| callback)
    }
}

/// The read and write slots of one device.
#[derive(Debug, Default)]
pub struct TransferHandlers {
    pub read: TransferHandler,
    pub write: TransferHandler,
}

impl TransferHandlers {
    pub fn slot(&self, direction: Direction) -> &TransferHandler {
        match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    pub fn slot_mut(&mut self, direction: Direction) -> &mut TransferHandler {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}

// ---------------------------------------------------------------------------
// Device table
// ---------------------------------------------------------------------------

/// A registered device node.
pub struct Device {
    pub name: &'static str,
    pub mode: DeviceMode,
    pub driver: &'static mut dyn Driver,
    pub handlers: TransferHandlers,
    pub action: Option<Callback<DeviceEvent>>,
}

/// Name-to-driver table.
pub struct DeviceTable {
    devices: [Option<Device>; MAX_DEVICES],
}

impl DeviceTable {
    pub fn new() -> Self {
        Self { devices: core::array::from_fn(|_| None) }
    }

    pub fn register(
        &mut self,
        name: &'static str,
        mode: DeviceMode,
        driver: &'static mut dyn Driver,
    ) -> Result<DeviceId, KernelError> {
        if self.lookup(name).is_some() {
            return Err(KernelError::DuplicateDevice);
        }
        let index = self
            .devices
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::DeviceTableFull)?;
        self.devices[index] = Some(Device {
            name,
            mode,
            driver,
            handlers: TransferHandlers::default(),
            action: None,
        });
        Ok(DeviceId(index))
    }

    pub fn lookup(&self, name: &str) -> Option<DeviceId> {
        self.devices
            .iter()
            .position(|d| d.as_ref().is_some_and(|d| d.name == name))
            .map(DeviceId)
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Fire the handler of `(device, direction)` with `result`. Returns
    /// whether a callback was armed. The callback is taken before it runs.
    pub fn execute_handler(
        &mut self,
        sched: &mut Scheduler,
        device: DeviceId,
        direction: Direction,
        result: Result<usize, Errno>,
        canceled: bool,
    ) -> bool {
        let Some(callback) = self
            .get_mut(device)
            .and_then(|d| d.handlers.slot_mut(direction).take())
        else {
            trace!("device {} {:?}: no handler armed", device.0, direction);
            return false;
        };
        let event = TransferEvent { device, direction, result, canceled };
        callback.invoke(sched, &event);
        true
    }

    pub fn execute_read_handler(
        &mut self,
        sched: &mut Scheduler,
        device: DeviceId,
        result: Result<usize, Errno>,
    ) -> bool {
        self.execute_handler(sched, device, Direction::Read, result, false)
    }

    pub fn execute_write_handler(
        &mut self,
        sched: &mut Scheduler,
        device: DeviceId,
        result: Result<usize, Errno>,
    ) -> bool {
        self.execute_handler(sched, device, Direction::Write, result, false)
    }

    /// Cancel both directions of `device` (device reset mid-transfer).
    /// Returns how many handlers fired.
    pub fn cancel_all(&mut self, sched: &mut Scheduler, device: DeviceId) -> usize {
        [Direction::Read, Direction::Write]
            .into_iter()
            .filter(|&dir| self.execute_handler(sched, device, dir, Ok(0), true))
            .count()
    }

    /// Empty every slot armed by `owner` and let the drivers tear the
    /// operations down. No callback fires.
    pub fn disarm_owned_by(&mut self, owner: TaskId) {
        for device in self.devices.iter_mut().flatten() {
            for dir in [Direction::Read, Direction::Write] {
                let slot = device.handlers.slot_mut(dir);
                if slot.owner() == Some(owner) {
                    slot.take();
                    device.driver.cancel(dir);
                }
            }
        }
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}
