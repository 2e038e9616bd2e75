//! Open-resource table
//!
//! The core does not interpret open resources; it only copies the table on
//! fork and drops it on exit.

use crate::config::NR_OPEN;

/// Opaque handle to an open resource owned by another subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTable {
    slots: [Option<FileHandle>; NR_OPEN],
}

impl Default for FileTable {
    fn default() -> Self {
        FileTable {
            slots: [None; NR_OPEN],
        }
    }
}

impl FileTable {
    /// Install `handle` in the lowest free slot.
    pub fn open(&mut self, handle: FileHandle) -> Option<usize> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(handle);
        Some(fd)
    }

    pub fn close(&mut self, fd: usize) -> Option<FileHandle> {
        self.slots.get_mut(fd)?.take()
    }

    pub fn get(&self, fd: usize) -> Option<FileHandle> {
        self.slots.get(fd).copied().flatten()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn close_all(&mut self) {
        self.slots = [None; NR_OPEN];
    }
}
