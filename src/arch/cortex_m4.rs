//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor:
//! context switching via PendSV, the SysTick quantum, the TIM2 microsecond
//! compare timer behind the sleep service, and the fault entry points.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): used by tasks in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack. The PendSV handler saves and restores R4–R11, which
//! completes the context.
//!
//! ## Interrupt Priorities
//!
//! - TIM2: priority 0x80, above the scheduler exceptions
//! - SysTick: priority 0xFF (lowest)
//! - PendSV: priority 0xFF (lowest), so a switch never preempts an ISR

use core::arch::{asm, naked_asm};
use core::ptr::{read_volatile, write_volatile};

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{NVIC, SCB};

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ, TIMER_EPOCH_US};
use crate::fault::{self, FaultKind, FaultRecord};
use crate::kernel::with_kernel;
use crate::task::TaskId;
use crate::timer::CompareTimer;

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Pend a context switch. It runs once no other ISR is active.
#[inline]
pub fn request_switch() {
    SCB::set_pendsv();
}

/// Stop the machine for good.
pub fn halt() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Set PendSV and SysTick to the lowest priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // SHPR3 (0xE000_ED20): [23:16] PendSV, [31:24] SysTick
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = read_volatile(shpr3);
        write_volatile(shpr3, val | (0xFF << 16) | (0xFF << 24));
    }
}

// ---------------------------------------------------------------------------
// Stack initialization
// ---------------------------------------------------------------------------

/// Lay out an initial exception frame at the top of `stack` so the first
/// PendSV return starts `entry`. Returns the initial stack pointer.
///
/// ```text
/// [Hardware stacked frame]
///   xPSR  (Thumb bit set)
///   PC    (entry)
///   LR    (task_return)
///   R12, R3, R2, R1, R0
/// [Software saved context]
///   R11 .. R4                <- returned stack pointer
/// ```
pub fn init_stack(stack: &'static mut [u32], entry: extern "C" fn() -> !) -> usize {
    let len = stack.len() & !1;
    let frame = &mut stack[len - 16..len];
    frame[..13].fill(0);
    frame[13] = task_return as usize as u32;
    frame[14] = entry as usize as u32;
    frame[15] = 0x0100_0000;
    frame.as_ptr() as usize
}

/// Landing pad for a task entry that returns.
extern "C" fn task_return() -> ! {
    crate::syscall::exit(0)
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

static mut IDLE_STACK: [u32; 64] = [0; 64];

extern "C" fn idle() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

/// Start the kernel installed with `kernel::install`. **Does not return.**
pub fn start(mut core_peripherals: cortex_m::Peripherals, timer: &'static Tim2) -> ! {
    configure_systick(&mut core_peripherals.SYST);
    set_interrupt_priorities();
    timer.start(&mut core_peripherals.NVIC);

    // Safety: runs once, before the first task exists.
    let idle_stack = unsafe { &mut *core::ptr::addr_of_mut!(IDLE_STACK) };
    let idle_sp = init_stack(idle_stack, idle);

    let first = with_kernel(|k| {
        if let Some(kernel_ctx) = k.sched.tasks.get_mut(TaskId::KERNEL) {
            kernel_ctx.stack_top = idle_sp;
            kernel_ctx.stack_pointer = idle_sp;
        }
        let next = k.schedule();
        k.sched.tasks.get(next).map(|t| t.stack_pointer)
    })
    .flatten();

    match first {
        Some(sp) => unsafe { start_first_task(sp as *const u32) },
        None => fault::die("no kernel installed"),
    }
}

/// Switch to PSP and branch to the first task in Thread mode.
///
/// # Safety
/// Must only be called once, with a stack prepared by [`init_stack`].
unsafe fn start_first_task(psp: *const u32) -> ! {
    asm!(
        // Skip the software-saved R4-R11
        "adds r0, #32",
        "msr psp, r0",

        // Thread mode uses PSP (CONTROL.SPSEL = 1)
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Pop the hardware frame by hand
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",          // LR
        "pop {{r5}}",          // PC
        "pop {{r6}}",          // xPSR

        "cpsie i",
        "bx r5",

        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV: save R4–R11 of the outgoing task, let the scheduler pick the
/// next one, restore its R4–R11 and return on its process stack.
///
/// # Safety
/// Naked exception handler entered by the NVIC.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {save_context}",
        "bl {do_schedule}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        // Return to Thread mode on PSP
        "ldr r0, =0xFFFFFFFD",
        "bx r0",
        save_context = sym save_current_context,
        do_schedule = sym do_context_switch,
    );
}

/// Store the outgoing task's stack pointer. Called from PendSV.
unsafe extern "C" fn save_current_context(psp: *mut u32) {
    with_kernel(|k| {
        let current = k.sched.current();
        if let Some(task) = k.sched.tasks.get_mut(current) {
            task.stack_pointer = psp as usize;
        }
    });
}

/// Pick the next task and return its stack pointer. Called from PendSV.
unsafe extern "C" fn do_context_switch() -> *mut u32 {
    let sp = with_kernel(|k| {
        let next = k.schedule();
        k.sched.tasks.get(next).map(|t| t.stack_pointer)
    })
    .flatten();
    match sp {
        Some(sp) => sp as *mut u32,
        None => fault::die("context switch without a kernel"),
    }
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick: quantum accounting, pends a switch when one is wanted.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    if with_kernel(|k| k.tick()).unwrap_or(false) {
        request_switch();
    }
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

const CFSR: *const u32 = 0xE000_ED28 as *const u32;
const MMFAR: *const u32 = 0xE000_ED34 as *const u32;
const BFAR: *const u32 = 0xE000_ED38 as *const u32;

/// Report a configurable fault taken by the running context. A task fault
/// kills its process and pends a switch away from it; a kernel fault dies.
///
/// # Safety
/// Call only from a fault exception handler.
pub unsafe fn report_fault(kind: FaultKind) {
    let cfsr = read_volatile(CFSR);
    let address = match kind {
        FaultKind::MemManage if cfsr & (1 << 7) != 0 => Some(read_volatile(MMFAR)),
        FaultKind::BusFault if cfsr & (1 << 15) != 0 => Some(read_volatile(BFAR)),
        _ => None,
    };
    // Stacked PC of the faulting task frame.
    let psp = cortex_m::register::psp::read() as *const u32;
    let pc = read_volatile(psp.add(6));

    let handled = with_kernel(|k| {
        let tid = k.sched.current();
        let pid = k.sched.tasks.get(tid).map_or(tid, |t| t.pid);
        k.handle_fault(FaultRecord { tid, pid, kind, pc, address });
    });
    if handled.is_none() {
        fault::die("fault before kernel install");
    }
    // Clear the sticky status bits.
    write_volatile(CFSR as *mut u32, cfsr);
    request_switch();
}

// ---------------------------------------------------------------------------
// TIM2 microsecond compare timer
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Irq(u16);

// Safety: 28 is the STM32F4 TIM2 interrupt line.
unsafe impl InterruptNumber for Irq {
    fn number(self) -> u16 {
        self.0
    }
}

const TIM2_IRQ: Irq = Irq(28);

/// STM32F4 TIM2 as the kernel's sleep timer: one count per microsecond,
/// update (overflow) every `TIMER_EPOCH_US`, channel 1 as the sleep-match
/// compare.
pub struct Tim2 {
    base: usize,
}

const RCC_APB1ENR: usize = 0x4002_3840;
const CR1: usize = 0x00;
const DIER: usize = 0x0C;
const SR: usize = 0x10;
const EGR: usize = 0x14;
const CNT: usize = 0x24;
const PSC: usize = 0x28;
const ARR: usize = 0x2C;
const CCR1: usize = 0x34;

const UIF: u32 = 1 << 0;
const CC1IF: u32 = 1 << 1;

impl Tim2 {
    pub const fn new() -> Self {
        Self { base: 0x4000_0000 }
    }

    fn read(&self, offset: usize) -> u32 {
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }

    fn start(&self, nvic: &mut NVIC) {
        unsafe {
            let enr = RCC_APB1ENR as *mut u32;
            write_volatile(enr, read_volatile(enr) | 1);
        }
        self.write(PSC, SYSTEM_CLOCK_HZ / 1_000_000 - 1);
        self.write(ARR, TIMER_EPOCH_US - 1);
        self.write(EGR, UIF);
        self.write(SR, 0);
        self.write(DIER, UIF);
        self.write(CR1, 1);
        unsafe {
            nvic.set_priority(TIM2_IRQ, 0x80);
            NVIC::unmask(TIM2_IRQ);
        }
    }

    /// TIM2 interrupt body. Route IRQ 28 here.
    pub fn on_interrupt(&self) {
        let sr = self.read(SR);
        self.write(SR, !(sr & (UIF | CC1IF)));
        let switch = with_kernel(|k| {
            if sr & UIF != 0 {
                k.on_timer_overflow();
            }
            if sr & CC1IF != 0 {
                k.on_sleep_match();
            }
            k.sched.needs_reschedule()
        });
        if switch.unwrap_or(false) {
            request_switch();
        }
    }
}

impl CompareTimer for Tim2 {
    fn counter(&self) -> u32 {
        self.read(CNT)
    }

    fn overflow_pending(&self) -> bool {
        self.read(SR) & UIF != 0
    }

    fn set_compare(&self, micros: u32) {
        self.write(CCR1, micros);
        self.write(SR, !CC1IF);
        self.write(DIER, self.read(DIER) | CC1IF);
    }

    fn disable_compare(&self) {
        self.write(DIER, self.read(DIER) & !CC1IF);
    }
}
