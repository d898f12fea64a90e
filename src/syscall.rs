//! # Syscall Surface
//!
//! Blocking POSIX-style calls made by the running task against the global
//! kernel. Results follow the C convention: a nonnegative count on success,
//! `-1` with the task's `errno` set on failure.

use crate::arch;
use crate::bridge::Submitted;
use crate::device::{Direction, IoctlRequest};
use crate::error::{syscall_return, Errno};
use crate::file::{Fd, OpenFlags};
use crate::kernel::with_kernel;
use crate::task::TaskId;

fn current() -> Option<TaskId> {
    with_kernel(|k| k.sched.current())
}

/// Record `result` against `tid` and convert it to the C convention.
fn finish(tid: TaskId, result: Result<usize, Errno>) -> isize {
    with_kernel(|k| match k.sched.tasks.get_mut(tid) {
        Some(task) => syscall_return(result, &mut task.errno),
        None => -1,
    })
    .unwrap_or(-1)
}

fn transfer(fd: Fd, direction: Direction, buf: usize, nbyte: usize) -> isize {
    let Some(tid) = current() else {
        return -1;
    };
    let submitted = with_kernel(|k| k.submit(tid, fd, direction, buf, nbyte));
    let result = match submitted {
        Some(Ok(Submitted::Done(n))) => Ok(n),
        Some(Ok(Submitted::Armed(ticket))) => {
            if with_kernel(|k| k.park(tid, ticket)) == Some(true) {
                // Runs again once the completion or a signal re-activates us.
                arch::request_switch();
            }
            with_kernel(|k| k.resume(tid, ticket)).unwrap_or(Err(Errno::Srch))
        }
        Some(Err(e)) => Err(e),
        None => Err(Errno::Srch),
    };
    finish(tid, result)
}

pub fn read(fd: Fd, buf: &mut [u8]) -> isize {
    transfer(fd, Direction::Read, buf.as_mut_ptr() as usize, buf.len())
}

pub fn write(fd: Fd, buf: &[u8]) -> isize {
    transfer(fd, Direction::Write, buf.as_ptr() as usize, buf.len())
}

pub fn open(name: &str, flags: OpenFlags) -> Fd {
    let Some(tid) = current() else {
        return -1;
    };
    let result = with_kernel(|k| k.open(tid, name, flags)).unwrap_or(Err(Errno::Srch));
    finish(tid, result.map(|fd| fd as usize)) as Fd
}

pub fn close(fd: Fd) -> i32 {
    let Some(tid) = current() else {
        return -1;
    };
    let result = with_kernel(|k| k.close(tid, fd)).unwrap_or(Err(Errno::Srch));
    finish(tid, result.map(|()| 0)) as i32
}

pub fn ioctl(fd: Fd, request: IoctlRequest) -> isize {
    let Some(tid) = current() else {
        return -1;
    };
    match with_kernel(|k| k.ioctl(tid, fd, request)).unwrap_or(Err(Errno::Srch)) {
        Ok(ret) => ret,
        Err(e) => finish(tid, Err(e)),
    }
}

/// Last error of the calling task.
pub fn errno() -> i32 {
    with_kernel(|k| {
        let tid = k.sched.current();
        k.sched.tasks.get(tid).map_or(0, |t| t.errno)
    })
    .unwrap_or(0)
}

/// Sleep for at least `micros` microseconds.
pub fn sleep(micros: u64) {
    if with_kernel(|k| {
        let tid = k.sched.current();
        k.sleep_for(tid, micros)
    }) == Some(true)
    {
        arch::request_switch();
    }
}

/// Terminate the calling task.
pub fn exit(status: i32) -> ! {
    with_kernel(|k| {
        let tid = k.sched.current();
        k.exit(tid, status);
    });
    loop {
        arch::request_switch();
        core::hint::spin_loop();
    }
}
