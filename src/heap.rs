//! # Heap
//!
//! Bump allocator over one memory region. Every chunk records the task that
//! allocated it so a task's memory can be returned in one sweep when the
//! task is reaped.
//!
//! Freed space is only reclaimed from the top: freeing the highest chunk
//! lowers the bump pointer to the end of the next-highest live chunk, while
//! holes below it stay unusable until everything above them is gone.

use log::trace;

use crate::config::HEAP_CHUNKS;
use crate::error::Errno;
use crate::task::{MemoryRegion, TaskId};

const ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub addr: usize,
    pub size: usize,
    pub owner: TaskId,
}

impl Chunk {
    fn end(&self) -> usize {
        self.addr + self.size
    }
}

pub struct BumpHeap {
    region: MemoryRegion,
    /// Next free address.
    top: usize,
    chunks: [Option<Chunk>; HEAP_CHUNKS],
}

impl BumpHeap {
    pub const fn new(region: MemoryRegion) -> Self {
        Self { region, top: region.base, chunks: [None; HEAP_CHUNKS] }
    }

    /// Allocate `size` bytes for `owner`, 8-byte aligned.
    pub fn alloc(&mut self, owner: TaskId, size: usize) -> Result<usize, Errno> {
        if size == 0 {
            return Err(Errno::Inval);
        }
        let addr = self.top.checked_add(ALIGN - 1).ok_or(Errno::NoMem)? & !(ALIGN - 1);
        let end = addr.checked_add(size).ok_or(Errno::NoMem)?;
        if !self.region.contains(addr, size) {
            return Err(Errno::NoMem);
        }
        let slot = self.chunks.iter_mut().find(|c| c.is_none()).ok_or(Errno::NoMem)?;
        *slot = Some(Chunk { addr, size, owner });
        self.top = end;
        trace!("heap: {size} bytes at {addr:#x} for task {}", owner.0);
        Ok(addr)
    }

    /// Release the chunk starting at `addr`.
    pub fn free(&mut self, addr: usize) -> Result<(), Errno> {
        let slot = self
            .chunks
            .iter_mut()
            .find(|c| c.is_some_and(|c| c.addr == addr))
            .ok_or(Errno::Inval)?;
        *slot = None;
        self.reclaim_top();
        Ok(())
    }

    /// Release every chunk owned by `owner`. Returns how many were freed.
    pub fn release_owned_by(&mut self, owner: TaskId) -> usize {
        let mut released = 0;
        for slot in self.chunks.iter_mut() {
            if slot.is_some_and(|c| c.owner == owner) {
                *slot = None;
                released += 1;
            }
        }
        if released > 0 {
            trace!("heap: released {released} chunks of task {}", owner.0);
            self.reclaim_top();
        }
        released
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().flatten()
    }

    /// Bytes between the region base and the bump pointer.
    pub fn used(&self) -> usize {
        self.top - self.region.base
    }

    fn reclaim_top(&mut self) {
        self.top = self
            .chunks()
            .map(Chunk::end)
            .max()
            .unwrap_or(self.region.base);
    }
}
