//! # Kestrel Demo Firmware
//!
//! Two tasks talk through a loopback device on an STM32F407:
//!
//! | Task       | Priority | Behavior                                        |
//! |------------|----------|-------------------------------------------------|
//! | `consumer` | 3        | Blocks in `read()` until the producer writes    |
//! | `producer` | 2        | Writes a message, then sleeps 100 ms            |
//!
//! The consumer's read arms the loopback device. The producer's write copies
//! straight into the consumer's buffer and pends the device interrupt, whose
//! completion re-activates the consumer. It outranks the producer, so it
//! runs as soon as the interrupt returns.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicUsize, Ordering};

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::scb::Exception;
use cortex_m::peripheral::NVIC;
use cortex_m_rt::{entry, exception, ExceptionFrame};
use panic_halt as _;

use kestrel::arch::cortex_m4::{self, Tim2};
use kestrel::config::STACK_SIZE;
use kestrel::device::{AsyncDesc, DeviceId, DeviceMode, Direction, Driver};
use kestrel::error::DriverError;
use kestrel::fault::{self, FaultKind};
use kestrel::file::OpenFlags;
use kestrel::kernel::{self, with_kernel, Kernel};
use kestrel::syscall;
use kestrel::task::{MemoryRegion, TaskConfig};

const STACK_WORDS: usize = STACK_SIZE / 4;
const HEAP_BASE: usize = 0x2001_0000;
const HEAP_SIZE: usize = 0x4000;

static TIMER: Tim2 = Tim2::new();

// ---------------------------------------------------------------------------
// Loopback device
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Irq(u16);

// Safety: IRQ 0 is unused by the demo and serves as the loopback interrupt.
unsafe impl InterruptNumber for Irq {
    fn number(self) -> u16 {
        self.0
    }
}

const LOOPBACK_IRQ: Irq = Irq(0);
const TIM2_IRQN: i16 = 28;
const LOOPBACK: DeviceId = DeviceId(0);

/// Bytes handed to an armed reader, waiting for the interrupt to report.
static DELIVERED: AtomicUsize = AtomicUsize::new(0);

struct Loopback {
    data: [u8; 32],
    len: usize,
    reader: Option<AsyncDesc>,
}

impl Loopback {
    const fn new() -> Self {
        Self { data: [0; 32], len: 0, reader: None }
    }
}

impl Driver for Loopback {
    fn read(&mut self, desc: &mut AsyncDesc) -> Result<usize, DriverError> {
        if self.len == 0 {
            self.reader = Some(*desc);
            return Ok(0);
        }
        let n = self.len.min(desc.nbyte);
        // Safety: the kernel validated the buffer against the caller's memory.
        unsafe { desc.buffer()[..n].copy_from_slice(&self.data[..n]) };
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
        Ok(n)
    }

    fn write(&mut self, desc: &mut AsyncDesc) -> Result<usize, DriverError> {
        // Safety: as above.
        let src = unsafe { desc.buffer() };
        if let Some(reader) = self.reader.take() {
            let n = src.len().min(reader.nbyte);
            unsafe { reader.buffer()[..n].copy_from_slice(&src[..n]) };
            DELIVERED.store(n, Ordering::Release);
            NVIC::pend(LOOPBACK_IRQ);
            return Ok(n);
        }
        let n = src.len().min(self.data.len() - self.len);
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        Ok(n)
    }

    fn cancel(&mut self, direction: Direction) {
        if direction == Direction::Read {
            self.reader = None;
        }
    }
}

static mut LOOPBACK_DRIVER: Loopback = Loopback::new();

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Bytes the consumer has read so far.
static RECEIVED: AtomicUsize = AtomicUsize::new(0);

static mut CONSUMER_STACK: [u32; STACK_WORDS] = [0; STACK_WORDS];
static mut PRODUCER_STACK: [u32; STACK_WORDS] = [0; STACK_WORDS];

extern "C" fn consumer() -> ! {
    let fd = syscall::open("loop0", OpenFlags::RDONLY);
    let mut buf = [0u8; 16];
    loop {
        let n = syscall::read(fd, &mut buf);
        if n > 0 {
            RECEIVED.fetch_add(n as usize, Ordering::Relaxed);
        }
    }
}

extern "C" fn producer() -> ! {
    let fd = syscall::open("loop0", OpenFlags::WRONLY);
    loop {
        syscall::write(fd, b"ping");
        syscall::sleep(100_000);
    }
}

/// Owned memory of a task: its own stack.
fn stack_region(stack: &[u32]) -> MemoryRegion {
    MemoryRegion::new(stack.as_ptr() as usize, core::mem::size_of_val(stack))
}

// ---------------------------------------------------------------------------
// Exceptions and interrupts
// ---------------------------------------------------------------------------

#[exception]
fn MemoryManagement() {
    unsafe { cortex_m4::report_fault(FaultKind::MemManage) }
}

#[exception]
fn BusFault() {
    unsafe { cortex_m4::report_fault(FaultKind::BusFault) }
}

#[exception]
fn UsageFault() {
    unsafe { cortex_m4::report_fault(FaultKind::UsageFault) }
}

#[exception]
unsafe fn HardFault(ef: &ExceptionFrame) -> ! {
    fault::die(format_args!("hard fault at pc {:#010x}", ef.pc()))
}

#[exception]
unsafe fn DefaultHandler(irqn: i16) {
    match irqn {
        TIM2_IRQN => TIMER.on_interrupt(),
        0 => {
            let n = DELIVERED.swap(0, Ordering::Acquire);
            let switch = with_kernel(|k| {
                k.complete_transfer(LOOPBACK, Direction::Read, Ok(n));
                k.sched.needs_reschedule()
            });
            if switch == Some(true) {
                cortex_m4::request_switch();
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let Some(mut cp) = cortex_m::Peripherals::take() else {
        fault::die("core peripherals already taken");
    };
    cp.SCB.enable(Exception::MemoryManagement);
    cp.SCB.enable(Exception::BusFault);
    cp.SCB.enable(Exception::UsageFault);

    let mut k = Kernel::new(&TIMER, MemoryRegion::new(HEAP_BASE, HEAP_SIZE));

    // Safety: the statics are handed out exactly once, here, before the
    // scheduler starts.
    let (driver, consumer_stack, producer_stack) = unsafe {
        (
            &mut *core::ptr::addr_of_mut!(LOOPBACK_DRIVER),
            &mut *core::ptr::addr_of_mut!(CONSUMER_STACK),
            &mut *core::ptr::addr_of_mut!(PRODUCER_STACK),
        )
    };
    match k.register_device("loop0", DeviceMode::all(), driver) {
        Ok(id) if id == LOOPBACK => {}
        _ => fault::die("loopback registration failed"),
    }

    let tasks: [(&'static mut [u32; STACK_WORDS], extern "C" fn() -> !, u8); 2] =
        [(consumer_stack, consumer, 3), (producer_stack, producer, 2)];
    for (stack, entry, priority) in tasks {
        let memory = stack_region(&stack[..]);
        let stack_top = cortex_m4::init_stack(stack, entry);
        if k.create_task(TaskConfig { priority, memory, stack_top }).is_err() {
            fault::die("task table full");
        }
    }

    kernel::install(k);
    unsafe { NVIC::unmask(LOOPBACK_IRQ) };
    cortex_m4::start(cp, &TIMER)
}
