//! Page frame table
//!
//! One reference count per frame over a fixed pool:
//! - 0 = free
//! - 1 = mapped by exactly one task
//! - N = shared by N mappings (fork)
//!
//! The frames' contents live in a single byte arena owned by the table.
//! Freed frames go back to the pool unzeroed.

use crate::config::PAGE_SIZE;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(u32);

impl FrameId {
    pub const fn new(index: u32) -> Self {
        FrameId(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Physical address of the frame within the pool.
    pub const fn start_address(self) -> u64 {
        self.0 as u64 * PAGE_SIZE as u64
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

pub struct FrameTable {
    refcounts: Vec<u16>,
    pinned: Vec<bool>,
    memory: Vec<u8>,
    free: usize,
}

impl FrameTable {
    pub fn new(frames: usize) -> Self {
        log::info!(
            "frame table: {} frames ({} KiB)",
            frames,
            frames * PAGE_SIZE / 1024
        );
        FrameTable {
            refcounts: vec![0; frames],
            pinned: vec![false; frames],
            memory: vec![0; frames * PAGE_SIZE],
            free: frames,
        }
    }

    /// Take the lowest-numbered free frame, count 0 -> 1.
    pub fn allocate(&mut self) -> Option<FrameId> {
        let index = self.refcounts.iter().position(|&c| c == 0)?;
        self.refcounts[index] = 1;
        self.free -= 1;
        let frame = FrameId(index as u32);
        log::trace!("allocated {}", frame);
        Some(frame)
    }

    /// Drop one reference. Returns true when the frame became free.
    /// Freeing a free frame is fatal.
    pub fn free(&mut self, frame: FrameId) -> bool {
        let count = &mut self.refcounts[frame.index()];
        if *count == 0 {
            log::error!("trying to free free page {}", frame);
            panic!("double free of {}", frame);
        }
        *count -= 1;
        if *count == 0 {
            self.pinned[frame.index()] = false;
            self.free += 1;
            log::trace!("freed {}", frame);
            return true;
        }
        false
    }

    /// Add a reference to an in-use frame. Returns the new count.
    pub fn share(&mut self, frame: FrameId) -> u16 {
        let count = &mut self.refcounts[frame.index()];
        if *count == 0 {
            log::error!("trying to share free page {}", frame);
            panic!("share of free {}", frame);
        }
        *count = match count.checked_add(1) {
            Some(n) => n,
            None => {
                log::error!("reference count overflow on {}", frame);
                panic!("too many references to {}", frame);
            }
        };
        *count
    }

    pub fn refcount(&self, frame: FrameId) -> u16 {
        self.refcounts[frame.index()]
    }

    pub fn is_free(&self, frame: FrameId) -> bool {
        self.refcounts[frame.index()] == 0
    }

    /// Exclude a frame from reclaim until unpinned or freed.
    pub fn pin(&mut self, frame: FrameId) {
        self.pinned[frame.index()] = true;
    }

    pub fn unpin(&mut self, frame: FrameId) {
        self.pinned[frame.index()] = false;
    }

    pub fn is_pinned(&self, frame: FrameId) -> bool {
        self.pinned[frame.index()]
    }

    pub fn bytes(&self, frame: FrameId) -> &[u8] {
        let start = frame.index() * PAGE_SIZE;
        &self.memory[start..start + PAGE_SIZE]
    }

    pub fn bytes_mut(&mut self, frame: FrameId) -> &mut [u8] {
        let start = frame.index() * PAGE_SIZE;
        &mut self.memory[start..start + PAGE_SIZE]
    }

    pub fn zero(&mut self, frame: FrameId) {
        self.bytes_mut(frame).fill(0);
    }

    pub fn copy(&mut self, from: FrameId, to: FrameId) {
        let src = from.index() * PAGE_SIZE;
        self.memory.copy_within(src..src + PAGE_SIZE, to.index() * PAGE_SIZE);
    }

    pub fn total(&self) -> usize {
        self.refcounts.len()
    }

    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// Frames with a count of at least one, each counted once.
    pub fn used_frames(&self) -> usize {
        self.refcounts.iter().filter(|&&c| c > 0).count()
    }

    /// free + used == total
    pub fn is_conserved(&self) -> bool {
        self.free_frames() + self.used_frames() == self.total()
    }

    pub fn iter_used(&self) -> impl Iterator<Item = (FrameId, u16)> + '_ {
        self.refcounts
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0)
            .map(|(i, &c)| (FrameId(i as u32), c))
    }
}
