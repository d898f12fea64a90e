//! # Kestrel Configuration
//!
//! Compile-time constants governing the scheduler, the timer service and
//! the I/O bridge. All limits are fixed at compile time; no dynamic
//! allocation inside the kernel.

/// Maximum number of task-table slots, including slot 0 (kernel context).
pub const MAX_TASKS: usize = 8;

/// Maximum number of devices registered in the device table.
pub const MAX_DEVICES: usize = 8;

/// Per-task file descriptor table size.
pub const MAX_OPEN_FILES: usize = 8;

/// SysTick frequency in Hz. One tick is one unit of the round-robin quantum.
pub const TICK_HZ: u32 = 1000;

/// Round-robin quantum in ticks for equal-priority tasks.
pub const TIME_SLICE_TICKS: u32 = 10;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Length of one timer epoch in microseconds. The compare timer counts
/// microseconds and wraps (raising the overflow interrupt) at this value.
pub const TIMER_EPOCH_US: u32 = 1_000_000;

/// Per-task stack size in bytes. Must hold the deepest call chain plus the
/// hardware exception frame (32 bytes) and the software-saved context
/// (32 bytes for R4–R11).
pub const STACK_SIZE: usize = 1024;

/// Number of times the I/O bridge invokes a driver that reports zero
/// progress (or the privileged-call glitch) before giving up with `ELOOP`
/// (respectively `EFAULT`).
pub const DRIVER_RETRY_LIMIT: u32 = 5;

/// Number of chunk records kept by the heap allocator.
pub const HEAP_CHUNKS: usize = 32;

/// Size of the kernel epitaph buffer written on a fatal kernel fault.
pub const EPITAPH_LEN: usize = 128;
