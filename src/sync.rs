//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections. All kernel state is mutated inside one,
//! which on a single core substitutes for locking.
//!
//! The implementation comes from the `critical-section` crate: on the
//! target `cortex-m` provides the single-core one (interrupts masked), on the
//! host the `std` implementation serves the tests.

use critical_section::CriticalSection;

/// Execute a closure within a critical section.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     // Access shared state safely
/// });
/// ```
///
/// Keep critical sections short; they add directly to interrupt latency.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}
