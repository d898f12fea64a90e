//! # Architecture Abstraction Layer
//!
//! Hardware boundary of the kernel. The Cortex-M4 port is built for bare
//! ARM targets; host builds get stand-ins so the portable core can be
//! exercised by the unit tests.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex_m4::{halt, request_switch};

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
mod host {
    /// No context switch on the host; callers drive `Kernel::schedule`.
    pub fn request_switch() {}

    /// Host builds cannot stop the machine; unwind instead.
    pub fn halt() -> ! {
        panic!("kernel halted")
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use host::{halt, request_switch};
