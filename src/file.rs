//! # File Descriptors
//!
//! Per-task open-file table. Each entry binds a descriptor number to a
//! device, the access mode it was opened with, and the current offset.

use bitflags::bitflags;

use crate::config::MAX_OPEN_FILES;
use crate::device::{DeviceId, Direction};
use crate::error::Errno;

/// File descriptor number.
pub type Fd = i32;

bitflags! {
    /// `open()` flags, POSIX bit layout. Read-only is the absence of
    /// `WRONLY` and `RDWR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const NONBLOCK = 0o4000;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY)
    }

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }

    pub fn allows(self, direction: Direction) -> bool {
        match direction {
            Direction::Read => self.readable(),
            Direction::Write => self.writable(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    pub device: DeviceId,
    pub flags: OpenFlags,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct FileTable {
    files: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl FileTable {
    pub const EMPTY: FileTable = FileTable { files: [None; MAX_OPEN_FILES] };

    /// Store `file` in the lowest free descriptor.
    pub fn insert(&mut self, file: OpenFile) -> Result<Fd, Errno> {
        let slot = self.files.iter().position(Option::is_none).ok_or(Errno::MFile)?;
        self.files[slot] = Some(file);
        Ok(slot as Fd)
    }

    pub fn get(&self, fd: Fd) -> Result<&OpenFile, Errno> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.files.get(i))
            .and_then(Option::as_ref)
            .ok_or(Errno::BadF)
    }

    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut OpenFile, Errno> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.files.get_mut(i))
            .and_then(Option::as_mut)
            .ok_or(Errno::BadF)
    }

    pub fn remove(&mut self, fd: Fd) -> Result<OpenFile, Errno> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.files.get_mut(i))
            .and_then(Option::take)
            .ok_or(Errno::BadF)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Fd, &OpenFile)> {
        self.files
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (i as Fd, f)))
    }
}
