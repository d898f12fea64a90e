//! # Error Types
//!
//! POSIX error numbers returned through the syscall surface, the driver
//! error type consumed by the I/O bridge, and the boot-time kernel errors.

use thiserror::Error;

/// Wire value some drivers return when the privileged call itself glitched
/// rather than the operation failing. Mapped to [`DriverError::Glitch`].
pub const PRIVILEGED_CALL_GLITCH: i32 = -101_010;

/// A POSIX error number.
///
/// `Other` carries driver-supplied codes that have no named variant; they
/// are passed through to the caller verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Errno {
    #[error("operation not permitted")]
    Perm,
    #[error("no such file or directory")]
    NoEnt,
    #[error("no such task")]
    Srch,
    #[error("interrupted by a signal")]
    Intr,
    #[error("i/o error")]
    Io,
    #[error("bad file descriptor")]
    BadF,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("out of memory")]
    NoMem,
    #[error("bad address")]
    Fault,
    #[error("device busy")]
    Busy,
    #[error("invalid argument")]
    Inval,
    #[error("too many open files")]
    MFile,
    #[error("inappropriate ioctl for device")]
    NoTty,
    #[error("too many driver retries")]
    Loop,
    #[error("errno {0}")]
    Other(i32),
}

impl Errno {
    /// The POSIX numeric value.
    pub const fn code(self) -> i32 {
        match self {
            Errno::Perm => 1,
            Errno::NoEnt => 2,
            Errno::Srch => 3,
            Errno::Intr => 4,
            Errno::Io => 5,
            Errno::BadF => 9,
            Errno::Again => 11,
            Errno::NoMem => 12,
            Errno::Fault => 14,
            Errno::Busy => 16,
            Errno::Inval => 22,
            Errno::MFile => 24,
            Errno::NoTty => 25,
            Errno::Loop => 40,
            Errno::Other(code) => code,
        }
    }

    /// Inverse of [`Errno::code`]. Unknown codes become `Other`.
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Errno::Perm,
            2 => Errno::NoEnt,
            3 => Errno::Srch,
            4 => Errno::Intr,
            5 => Errno::Io,
            9 => Errno::BadF,
            11 => Errno::Again,
            12 => Errno::NoMem,
            14 => Errno::Fault,
            16 => Errno::Busy,
            22 => Errno::Inval,
            24 => Errno::MFile,
            25 => Errno::NoTty,
            40 => Errno::Loop,
            other => Errno::Other(other),
        }
    }
}

/// Collapse a kernel result into the classic syscall return convention:
/// the count on success, `-1` on failure with the error written to `errno`.
pub fn syscall_return(result: Result<usize, Errno>, errno: &mut i32) -> isize {
    match result {
        Ok(n) => n as isize,
        Err(e) => {
            *errno = e.code();
            -1
        }
    }
}

/// Failure reported by a driver's `read`/`write` entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The operation could not start. Propagated to the caller unchanged.
    #[error(transparent)]
    Errno(#[from] Errno),
    /// The privileged call glitched; the bridge retries it.
    #[error("privileged call glitch")]
    Glitch,
}

impl DriverError {
    /// Decode a C-style negative driver return.
    pub const fn from_raw(ret: i32) -> Self {
        if ret == PRIVILEGED_CALL_GLITCH {
            DriverError::Glitch
        } else {
            DriverError::Errno(Errno::from_code(-ret))
        }
    }
}

/// Errors raised while building the system at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("task table is full")]
    TaskTableFull,
    #[error("device table is full")]
    DeviceTableFull,
    #[error("device name already registered")]
    DuplicateDevice,
    #[error("task slot {0} is not in use")]
    NoSuchTask(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_codes_round_trip_through_posix_values() {
        for e in [Errno::Perm, Errno::Intr, Errno::Again, Errno::Loop, Errno::Fault] {
            assert_eq!(Errno::from_code(e.code()), e);
        }
        assert_eq!(Errno::from_code(121), Errno::Other(121));
    }

    #[test]
    fn test_messages_follow_posix_wording() {
        assert_eq!(Errno::NoEnt.to_string(), "no such file or directory");
        assert_eq!(Errno::BadF.to_string(), "bad file descriptor");
    }

    #[test]
    fn test_driver_raw_decoding() {
        assert_eq!(DriverError::from_raw(PRIVILEGED_CALL_GLITCH), DriverError::Glitch);
        assert_eq!(DriverError::from_raw(-5), DriverError::Errno(Errno::Io));
    }

    #[test]
    fn test_syscall_return_convention() {
        let mut errno = 0;
        assert_eq!(syscall_return(Ok(6), &mut errno), 6);
        assert_eq!(errno, 0);
        assert_eq!(syscall_return(Err(Errno::Intr), &mut errno), -1);
        assert_eq!(errno, 4);
    }
}
