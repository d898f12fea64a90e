//! # Kestrel
//!
//! A priority-preemptive real-time kernel for single-core ARM Cortex-M4
//! microcontrollers, built around a bridge that turns blocking POSIX-style
//! `read()`/`write()` calls into interrupt-driven, callback-completed device
//! operations.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├────────────────────────────────────────────────────────┤
//! │          Syscall surface (syscall.rs)                  │
//! │   open · read · write · ioctl · close · sleep · exit   │
//! ├──────────────┬──────────────┬──────────────┬───────────┤
//! │  I/O Bridge  │ Timer Service│ Fault Handler│  Signals  │
//! │  bridge.rs   │ timer.rs     │ fault.rs     │ signal.rs │
//! ├──────────────┴──────────────┴──────────────┴───────────┤
//! │   Kernel (kernel.rs): lifecycle · files · ISR entry    │
//! ├──────────────────────────┬─────────────────────────────┤
//! │  Scheduler (scheduler.rs)│  Devices (device.rs)        │
//! │  Task Table (table.rs)   │  Heap (heap.rs)             │
//! ├──────────────────────────┴─────────────────────────────┤
//! │            Arch Port (arch/cortex_m4.rs)               │
//! │   PendSV · SysTick · TIM2 compare · fault entry        │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Flow of a blocking read
//!
//! 1. The task calls `read()`; the bridge checks the descriptor, the
//!    device mode and that the buffer lies in the task's own memory.
//! 2. The driver either finishes synchronously or arms an interrupt.
//! 3. The completion interrupt fires the transfer handler, which
//!    re-activates the task; if it outranks the running task the scheduler
//!    preempts at once.
//!
//! ## Memory Model
//!
//! - **No allocation in the kernel**: fixed-size task, device and file
//!   tables sized in [`config`]
//! - **Arena-indexed tasks**: tasks and wait channels are ids, not pointers
//! - **Critical sections**: all kernel state is mutated inside
//!   `critical_section::with`

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod fault;
pub mod file;
pub mod heap;
pub mod kernel;
pub mod scheduler;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod table;
pub mod task;
pub mod timer;

#[cfg(test)]
mod testing;
