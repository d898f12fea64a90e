//! # Kernel
//!
//! The `Kernel` owns every piece of kernel state: the scheduler (and with it
//! the task table), the sleep timer, the device table and the heap. It is
//! built once at boot and installed in a global that the exception handlers
//! and the syscall layer reach through [`with_kernel`].
//!
//! Each component adds its own operations in an `impl Kernel` block next to
//! its code (signals, faults, the I/O bridge). This module holds task
//! lifecycle, the file-descriptor calls and the interrupt entry points.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► Kernel::new()            ← timer + heap region
//!         ├─► register_device() (×N)
//!         ├─► create_task()     (×N)
//!         ├─► kernel::install()
//!         └─► arch::start()            ← SysTick, priorities, first task
//! ```

use core::cell::RefCell;

use critical_section::Mutex;
use log::{debug, trace};

use crate::config::MAX_TASKS;
use crate::device::{DeviceEvent, DeviceId, DeviceMode, DeviceTable, Driver, IoctlRequest};
use crate::error::{Errno, KernelError};
use crate::fault::{FaultLog, FaultRecord};
use crate::file::{Fd, FileTable, OpenFile, OpenFlags};
use crate::heap::BumpHeap;
use crate::scheduler::Scheduler;
use crate::sync;
use crate::task::{
    BlockObject, MemoryRegion, Priority, TaskConfig, TaskFlags, TaskId, UnblockReason, WakeTime,
};
use crate::timer::{CompareTimer, SleepTimer};

pub struct Kernel {
    pub sched: Scheduler,
    pub timer: SleepTimer,
    pub devices: DeviceTable,
    pub heap: BumpHeap,
    pub(crate) fault_log: Option<&'static mut dyn FaultLog>,
    pub(crate) boot_fault: Option<FaultRecord>,
}

// Safety: the kernel lives in a single-core global and is only touched
// inside a critical section.
unsafe impl Send for Kernel {}

impl Kernel {
    pub fn new(timer: &'static dyn CompareTimer, heap: MemoryRegion) -> Self {
        Self {
            sched: Scheduler::new(),
            timer: SleepTimer::new(timer),
            devices: DeviceTable::new(),
            heap: BumpHeap::new(heap),
            fault_log: None,
            boot_fault: None,
        }
    }

    pub fn register_device(
        &mut self,
        name: &'static str,
        mode: DeviceMode,
        driver: &'static mut dyn Driver,
    ) -> Result<DeviceId, KernelError> {
        let id = self.devices.register(name, mode, driver)?;
        debug!("device {} registered as {name}", id.0);
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Create a boot-time task owned by the kernel context.
    pub fn create_task(&mut self, config: TaskConfig) -> Result<TaskId, KernelError> {
        self.sched.tasks.allocate(None, TaskId::KERNEL, config)
    }

    /// New thread in the creator's process.
    pub fn spawn_thread(&mut self, creator: TaskId, stack_top: usize) -> Result<TaskId, KernelError> {
        let (pid, config) = self.inherit(creator, stack_top)?;
        let id = self.sched.tasks.allocate(Some(pid), creator, config)?;
        self.sched.update_on_wake(config.priority);
        Ok(id)
    }

    /// New process whose main thread is a child of `creator`.
    pub fn spawn_process(&mut self, creator: TaskId, stack_top: usize) -> Result<TaskId, KernelError> {
        let (_, config) = self.inherit(creator, stack_top)?;
        let id = self.sched.tasks.allocate(None, creator, config)?;
        self.sched.update_on_wake(config.priority);
        Ok(id)
    }

    fn inherit(&self, creator: TaskId, stack_top: usize) -> Result<(TaskId, TaskConfig), KernelError> {
        let task = self.sched.tasks.get(creator).ok_or(KernelError::NoSuchTask(creator.0))?;
        let config = TaskConfig { priority: task.priority, memory: task.owned_memory, stack_top };
        Ok((task.pid, config))
    }

    /// Terminate task `id` with `status`. It stays a zombie until reaped.
    ///
    /// A thread whose process main thread is already gone is reaped at once
    /// unless a joiner was woken to collect it.
    pub fn exit(&mut self, id: TaskId, status: i32) {
        if id.is_kernel() {
            return;
        }
        let Some(task) = self.sched.tasks.get_mut(id) else {
            return;
        };
        if task.is_zombie() {
            return;
        }
        task.exit_status = status;
        task.flags.insert(TaskFlags::ZOMBIE);
        task.flags.remove(TaskFlags::STOPPED | TaskFlags::WAITCHILD);
        task.block_object = None;
        task.wake = WakeTime::NEVER;
        task.io = None;
        let files = core::mem::replace(&mut task.files, FileTable::EMPTY);
        let (parent, pid, is_main) = (task.parent, task.pid, task.is_main_thread());
        self.sched.tasks.deassert_active(id);
        debug!("task {} exited with {status}", id.0);

        self.devices.disarm_owned_by(id);
        for (_, file) in files.iter() {
            if let Some(device) = self.devices.get_mut(file.device) {
                device.driver.close().ok();
            }
        }

        let mut woken: Option<Priority> = None;
        let mut joined = false;
        for index in 1..MAX_TASKS {
            let waiter = TaskId(index);
            let Some(t) = self.sched.tasks.get(waiter) else {
                continue;
            };
            if t.is_active() || t.is_zombie() {
                continue;
            }
            let in_waitpid = t.flags.contains(TaskFlags::WAITCHILD);
            // Only a process main thread is collected by waitpid.
            let collects = in_waitpid && waiter == parent && is_main;
            let reason = match t.block_object {
                Some(BlockObject::Task(c)) if c == id && collects => UnblockReason::Wait,
                Some(BlockObject::AnyChild) if collects => UnblockReason::Wait,
                Some(BlockObject::Task(c)) if c == id && !in_waitpid => {
                    joined = true;
                    UnblockReason::PthreadJoined
                }
                _ => continue,
            };
            let priority = t.priority;
            self.sched.tasks.deassert_flag(waiter, TaskFlags::WAITCHILD);
            self.sched.tasks.assert_active(waiter, reason);
            woken = Some(woken.map_or(priority, |p| p.max(priority)));
        }

        let orphaned = !is_main && self.sched.tasks.get(pid).is_none_or(|m| m.is_zombie());
        if orphaned && !joined {
            self.reap(id).ok();
        }

        self.sched.update_on_sleep();
        if let Some(priority) = woken {
            self.sched.update_on_wake(priority);
        }
    }

    /// Wait for thread `target` of the caller's process to exit.
    ///
    /// Returns the exit status if `target` already exited (and reaps it), or
    /// `None` after blocking the caller until it does.
    pub fn join(&mut self, waiter: TaskId, target: TaskId) -> Result<Option<i32>, Errno> {
        if waiter == target {
            return Err(Errno::Inval);
        }
        let pid = self.sched.tasks.get(waiter).ok_or(Errno::Srch)?.pid;
        let t = self.sched.tasks.get(target).ok_or(Errno::Srch)?;
        if t.pid != pid {
            return Err(Errno::Srch);
        }
        if t.is_zombie() {
            let status = self.reap(target)?;
            self.set_reason(waiter, UnblockReason::PthreadJoinedComplete);
            return Ok(Some(status));
        }
        self.block_on(waiter, BlockObject::Task(target));
        Ok(None)
    }

    /// Wait for a child of `parent` (any child when `child` is `None`).
    ///
    /// Returns `(child, status)` for an already-exited child (which is
    /// reaped), or `None` after blocking the caller with WAITCHILD.
    pub fn waitpid(
        &mut self,
        parent: TaskId,
        child: Option<TaskId>,
    ) -> Result<Option<(TaskId, i32)>, Errno> {
        let zombie = match child {
            Some(c) => {
                let t = self
                    .sched
                    .tasks
                    .get(c)
                    .filter(|t| t.parent == parent && t.is_main_thread())
                    .ok_or(Errno::Srch)?;
                t.is_zombie().then_some(c)
            }
            None => {
                let mut children = self
                    .sched
                    .tasks
                    .iter()
                    .filter(|t| t.parent == parent && t.is_main_thread())
                    .filter(|t| !t.id.is_kernel() && t.id != parent)
                    .peekable();
                if children.peek().is_none() {
                    return Err(Errno::Srch);
                }
                children.find(|t| t.is_zombie()).map(|t| t.id)
            }
        };

        if let Some(c) = zombie {
            let status = self.reap(c)?;
            return Ok(Some((c, status)));
        }
        self.sched.tasks.assert_flag(parent, TaskFlags::WAITCHILD);
        self.block_on(parent, child.map_or(BlockObject::AnyChild, BlockObject::Task));
        Ok(None)
    }

    /// Free a zombie: release its heap chunks and return the slot.
    ///
    /// Reaping a process main thread also frees its threads that already
    /// exited; nothing else could join them.
    pub fn reap(&mut self, id: TaskId) -> Result<i32, Errno> {
        let task = self.sched.tasks.get(id).ok_or(Errno::Srch)?;
        if !task.is_zombie() {
            return Err(Errno::Inval);
        }
        let status = task.exit_status;
        let is_main = task.is_main_thread();
        self.release(id);
        if is_main {
            for index in 1..MAX_TASKS {
                let sibling = TaskId(index);
                if self.sched.tasks.get(sibling).is_some_and(|t| t.pid == id && t.is_zombie()) {
                    self.release(sibling);
                }
            }
        }
        Ok(status)
    }

    fn release(&mut self, id: TaskId) {
        let chunks = self.heap.release_owned_by(id);
        self.sched.tasks.remove(id);
        trace!("task {} reaped ({chunks} heap chunks)", id.0);
    }

    fn block_on(&mut self, id: TaskId, object: BlockObject) {
        if let Some(task) = self.sched.tasks.get_mut(id) {
            task.block_object = Some(object);
        }
        self.sched.tasks.deassert_active(id);
        self.sched.update_on_sleep();
    }

    fn set_reason(&mut self, id: TaskId, reason: UnblockReason) {
        if let Some(task) = self.sched.tasks.get_mut(id) {
            task.unblock_reason = reason;
        }
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    pub fn open(&mut self, tid: TaskId, name: &str, flags: OpenFlags) -> Result<Fd, Errno> {
        let id = self.devices.lookup(name).ok_or(Errno::NoEnt)?;
        let device = self.devices.get_mut(id).ok_or(Errno::NoEnt)?;
        if (flags.readable() && !device.mode.contains(DeviceMode::READ))
            || (flags.writable() && !device.mode.contains(DeviceMode::WRITE))
        {
            return Err(Errno::Perm);
        }
        let task = self.sched.tasks.get_mut(tid).ok_or(Errno::Srch)?;
        device.driver.open(flags)?;
        let file = OpenFile { device: id, flags, offset: 0 };
        task.files.insert(file).inspect_err(|_| {
            device.driver.close().ok();
        })
    }

    pub fn close(&mut self, tid: TaskId, fd: Fd) -> Result<(), Errno> {
        let task = self.sched.tasks.get_mut(tid).ok_or(Errno::Srch)?;
        let file = task.files.remove(fd)?;
        match self.devices.get_mut(file.device) {
            Some(device) => device.driver.close(),
            None => Ok(()),
        }
    }

    pub fn ioctl(&mut self, tid: TaskId, fd: Fd, request: IoctlRequest) -> Result<isize, Errno> {
        let task = self.sched.tasks.get(tid).ok_or(Errno::Srch)?;
        let file = *task.files.get(fd)?;
        let device = self.devices.get_mut(file.device).ok_or(Errno::BadF)?;
        match request {
            IoctlRequest::SetAction(action) => {
                device.action = action;
                Ok(0)
            }
            custom => device.driver.ioctl(&custom),
        }
    }

    /// Driver ISR entry for non-data events. Runs the device's registered
    /// action, if any.
    pub fn raise_event(&mut self, device: DeviceId, value: u32) -> bool {
        let Some(action) = self.devices.get(device).and_then(|d| d.action) else {
            return false;
        };
        action.invoke(&mut self.sched, &DeviceEvent { device, value });
        true
    }

    // -----------------------------------------------------------------------
    // Time and scheduling
    // -----------------------------------------------------------------------

    /// SysTick entry. Returns whether a context switch is wanted.
    pub fn tick(&mut self) -> bool {
        self.sched.tick();
        self.sched.needs_reschedule()
    }

    pub fn schedule(&mut self) -> TaskId {
        self.sched.schedule()
    }

    /// Sleep until absolute time `abs_us`. Returns `false` if the deadline
    /// already passed and the caller did not block.
    pub fn sleep_until(&mut self, tid: TaskId, abs_us: u64) -> bool {
        self.timer.timed_block(&mut self.sched, tid, BlockObject::Sleep, abs_us)
    }

    pub fn sleep_for(&mut self, tid: TaskId, micros: u64) -> bool {
        let deadline = self.timer.now().saturating_add(micros);
        self.sleep_until(tid, deadline)
    }

    pub fn now(&self) -> u64 {
        self.timer.now()
    }

    /// Timer ISR entry: counter wrapped.
    pub fn on_timer_overflow(&mut self) {
        self.timer.on_overflow(&mut self.sched);
    }

    /// Timer ISR entry: compare matched.
    pub fn on_sleep_match(&mut self) {
        self.timer.on_sleep_match(&mut self.sched);
    }
}

// ---------------------------------------------------------------------------
// Global kernel instance
// ---------------------------------------------------------------------------

static KERNEL: Mutex<RefCell<Option<Kernel>>> = Mutex::new(RefCell::new(None));

/// Install the booted kernel as the global instance.
pub fn install(kernel: Kernel) {
    sync::critical_section(|cs| {
        KERNEL.borrow_ref_mut(cs).replace(kernel);
    });
}

/// Run `f` on the global kernel inside a critical section. `None` before
/// [`install`].
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> Option<R> {
    sync::critical_section(|cs| KERNEL.borrow_ref_mut(cs).as_mut().map(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Callback;
    use crate::testing::{boot, spawn, Reply, ScriptedDriver, TASK_MEMORY};
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_spawn_inherits_priority_and_memory() {
        let (mut k, _) = boot();
        let main = spawn(&mut k, 6);
        let thread = k.spawn_thread(main, 0x2000_4000).unwrap();
        let child = k.spawn_process(main, 0x2000_5000).unwrap();

        let t = k.sched.tasks.get(thread).unwrap();
        assert_eq!((t.pid, t.parent, t.priority), (main, main, 6));
        assert_eq!(t.owned_memory, TASK_MEMORY);
        let c = k.sched.tasks.get(child).unwrap();
        assert_eq!((c.pid, c.parent), (child, main));
        assert_eq!(k.spawn_thread(TaskId(7), 0), Err(KernelError::NoSuchTask(7)));
    }

    #[test]
    fn test_exit_wakes_joiner_and_join_reaps() {
        let (mut k, _) = boot();
        let main = spawn(&mut k, 3);
        let worker = k.spawn_thread(main, 0x2000_4000).unwrap();
        k.heap.alloc(worker, 64).unwrap();

        assert_eq!(k.join(main, worker), Ok(None));
        assert!(!k.sched.tasks.get(main).unwrap().is_active());

        k.exit(worker, 7);
        let m = k.sched.tasks.get(main).unwrap();
        assert!(m.is_active());
        assert_eq!(m.unblock_reason, UnblockReason::PthreadJoined);

        assert_eq!(k.join(main, worker), Ok(Some(7)));
        assert!(k.sched.tasks.get(worker).is_none());
        assert_eq!(k.heap.chunks().count(), 0);
        assert_eq!(k.sched.tasks.unblock_reason_of(main), UnblockReason::PthreadJoinedComplete);
    }

    #[test]
    fn test_waitpid_any_child() {
        let (mut k, _) = boot();
        let parent = spawn(&mut k, 3);
        assert_eq!(k.waitpid(parent, None), Err(Errno::Srch));
        let a = k.spawn_process(parent, 0x2000_4000).unwrap();
        let b = k.spawn_process(parent, 0x2000_5000).unwrap();

        assert_eq!(k.waitpid(parent, None), Ok(None));
        assert!(k.sched.tasks.get(parent).unwrap().flags.contains(TaskFlags::WAITCHILD));

        k.exit(b, 2);
        let p = k.sched.tasks.get(parent).unwrap();
        assert!(p.is_active());
        assert_eq!(p.unblock_reason, UnblockReason::Wait);
        assert!(!p.flags.contains(TaskFlags::WAITCHILD));

        assert_eq!(k.waitpid(parent, None), Ok(Some((b, 2))));
        assert_eq!(k.waitpid(parent, Some(b)), Err(Errno::Srch));
        assert_eq!(k.waitpid(parent, Some(a)), Ok(None));
    }

    #[test]
    fn test_waitpid_ignores_threads() {
        let (mut k, _) = boot();
        let main = spawn(&mut k, 3);
        let thread = k.spawn_thread(main, 0x2000_4000).unwrap();
        assert_eq!(k.waitpid(main, None), Err(Errno::Srch));
        assert_eq!(k.waitpid(main, Some(thread)), Err(Errno::Srch));

        let child = k.spawn_process(main, 0x2000_5000).unwrap();
        assert_eq!(k.waitpid(main, None), Ok(None));
        k.exit(thread, 5);
        assert!(!k.sched.tasks.get(main).unwrap().is_active());

        k.exit(child, 1);
        assert_eq!(k.sched.tasks.unblock_reason_of(main), UnblockReason::Wait);
        assert_eq!(k.waitpid(main, None), Ok(Some((child, 1))));
        assert_eq!(k.join(main, thread), Ok(Some(5)));
    }

    #[test]
    fn test_exit_of_unrelated_task_leaves_waiter_blocked() {
        let (mut k, _) = boot();
        let parent = spawn(&mut k, 3);
        let child = k.spawn_process(parent, 0x2000_4000).unwrap();
        let stranger = spawn(&mut k, 3);
        k.waitpid(parent, Some(child)).unwrap();
        k.exit(stranger, 0);
        assert!(!k.sched.tasks.get(parent).unwrap().is_active());
        k.exit(child, 0);
        assert!(k.sched.tasks.get(parent).unwrap().is_active());
    }

    #[test]
    fn test_reap_requires_zombie() {
        let (mut k, _) = boot();
        let t = spawn(&mut k, 1);
        assert_eq!(k.reap(t), Err(Errno::Inval));
        k.exit(t, 0);
        assert_eq!(k.reap(t), Ok(0));
        assert_eq!(k.reap(t), Err(Errno::Srch));
    }

    #[test]
    fn test_exit_disarms_and_closes() {
        let (mut k, _) = boot();
        let (driver, probe) = ScriptedDriver::new(Reply::Arm);
        let dev = k.register_device("adc0", DeviceMode::READ, driver).unwrap();
        let t = spawn(&mut k, 2);
        let fd = k.open(t, "adc0", OpenFlags::RDONLY).unwrap();
        k.submit(t, fd, crate::device::Direction::Read, TASK_MEMORY.base, 4).unwrap();

        k.exit(t, 1);
        assert!(!k.devices.get(dev).unwrap().handlers.read.is_armed());
        assert_eq!(probe.cancels().len(), 1);
        assert!(k.sched.tasks.get(t).unwrap().files.iter().next().is_none());
    }

    #[test]
    fn test_open_checks_name_mode_and_table() {
        let (mut k, _) = boot();
        let (driver, _) = ScriptedDriver::new(Reply::Idle);
        k.register_device("rom", DeviceMode::READ, driver).unwrap();
        let t = spawn(&mut k, 2);
        assert_eq!(k.open(t, "nope", OpenFlags::RDONLY), Err(Errno::NoEnt));
        assert_eq!(k.open(t, "rom", OpenFlags::WRONLY), Err(Errno::Perm));
        for fd in 0..crate::config::MAX_OPEN_FILES as Fd {
            assert_eq!(k.open(t, "rom", OpenFlags::RDONLY), Ok(fd));
        }
        assert_eq!(k.open(t, "rom", OpenFlags::RDONLY), Err(Errno::MFile));
        assert_eq!(k.close(t, 3), Ok(()));
        assert_eq!(k.close(t, 3), Err(Errno::BadF));
        assert_eq!(k.open(t, "rom", OpenFlags::RDONLY), Ok(3));
    }

    static EVENTS: AtomicU32 = AtomicU32::new(0);

    fn on_event(_: &mut Scheduler, event: &DeviceEvent, context: usize) {
        EVENTS.fetch_add(event.value * context as u32, Ordering::SeqCst);
    }

    #[test]
    fn test_ioctl_set_action_and_raise_event() {
        let (mut k, _) = boot();
        let (driver, _) = ScriptedDriver::new(Reply::Idle);
        let dev = k.register_device("tim5", DeviceMode::all(), driver).unwrap();
        let t = spawn(&mut k, 2);
        let fd = k.open(t, "tim5", OpenFlags::RDWR).unwrap();

        assert!(!k.raise_event(dev, 1));
        let action = Callback { func: on_event, context: 10 };
        assert_eq!(k.ioctl(t, fd, IoctlRequest::SetAction(Some(action))), Ok(0));
        let before = EVENTS.load(Ordering::SeqCst);
        assert!(k.raise_event(dev, 3));
        assert!(k.raise_event(dev, 3));
        assert_eq!(EVENTS.load(Ordering::SeqCst) - before, 60);

        k.ioctl(t, fd, IoctlRequest::SetAction(None)).unwrap();
        assert!(!k.raise_event(dev, 3));
        assert_eq!(k.ioctl(t, fd, IoctlRequest::Custom { cmd: 42, arg: 0 }), Ok(42));
        assert_eq!(k.ioctl(t, 5, IoctlRequest::Custom { cmd: 1, arg: 0 }), Err(Errno::BadF));
    }

    #[test]
    fn test_sleep_for_blocks_until_match() {
        let (mut k, timer) = boot();
        let t = spawn(&mut k, 2);
        timer.set_now(1_000);
        assert!(k.sleep_for(t, 250));
        assert_eq!(timer.compare(), Some(1_250));
        timer.set_now(1_250);
        k.on_sleep_match();
        assert_eq!(k.sched.tasks.unblock_reason_of(t), UnblockReason::Sleep);
        assert!(!k.sleep_until(t, 1_000));
    }

    #[test]
    fn test_tick_reports_quantum_expiry() {
        let (mut k, _) = boot();
        let a = spawn(&mut k, 2);
        spawn(&mut k, 2);
        assert_eq!(k.schedule(), a);
        let wanted = (0..crate::config::TIME_SLICE_TICKS).map(|_| k.tick()).last();
        assert_eq!(wanted, Some(true));
        assert_ne!(k.schedule(), a);
    }
}
