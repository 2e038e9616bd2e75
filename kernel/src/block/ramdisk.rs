//! Memory-backed block device.
//!
//! Clones share the same storage, so a test can keep a handle after giving
//! one to the cache and inspect what actually reached the "disk". Reads and
//! writes of chosen blocks can be made to fail.

use super::{BlockDevice, BlockError};
use crate::config::BLOCK_SIZE;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

#[derive(Default)]
struct FaultPlan {
    reads: BTreeSet<u64>,
    writes: BTreeSet<u64>,
}

struct RamDiskInner {
    storage: Mutex<Vec<u8>>,
    block_size: usize,
    num_blocks: u64,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    faults: Mutex<FaultPlan>,
}

#[derive(Clone)]
pub struct RamDisk {
    inner: Arc<RamDiskInner>,
}

impl RamDisk {
    /// Zero-filled disk of `num_blocks` cache-sized blocks.
    pub fn new(num_blocks: u64) -> Self {
        Self::with_block_size(num_blocks, BLOCK_SIZE)
    }

    pub fn with_block_size(num_blocks: u64, block_size: usize) -> Self {
        RamDisk {
            inner: Arc::new(RamDiskInner {
                storage: Mutex::new(vec![0; num_blocks as usize * block_size]),
                block_size,
                num_blocks,
                reads: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
                faults: Mutex::new(FaultPlan::default()),
            }),
        }
    }

    /// Successful and failed block reads issued so far.
    pub fn reads(&self) -> u64 {
        self.inner.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    pub fn fail_reads_of(&self, block: u64) {
        self.inner.faults.lock().reads.insert(block);
    }

    pub fn fail_writes_of(&self, block: u64) {
        self.inner.faults.lock().writes.insert(block);
    }

    pub fn clear_faults(&self) {
        let mut faults = self.inner.faults.lock();
        faults.reads.clear();
        faults.writes.clear();
    }

    /// Raw contents of a block, bypassing counters and faults.
    pub fn peek(&self, block: u64) -> Vec<u8> {
        let range = self.range(block);
        self.inner.storage.lock()[range].to_vec()
    }

    /// Overwrite the start of a block, bypassing counters and faults.
    pub fn poke(&self, block: u64, data: &[u8]) {
        let range = self.range(block);
        let len = data.len().min(range.len());
        self.inner.storage.lock()[range.start..range.start + len].copy_from_slice(&data[..len]);
    }

    fn range(&self, block: u64) -> core::ops::Range<usize> {
        let start = block as usize * self.inner.block_size;
        start..start + self.inner.block_size
    }

    fn check(&self, block: u64, len: usize) -> Result<(), BlockError> {
        if block >= self.inner.num_blocks {
            return Err(BlockError::OutOfBounds);
        }
        if len < self.inner.block_size {
            return Err(BlockError::IoError);
        }
        Ok(())
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        self.check(block_num, buf.len())?;
        if self.inner.faults.lock().reads.contains(&block_num) {
            return Err(BlockError::IoError);
        }
        let range = self.range(block_num);
        let len = range.len();
        buf[..len].copy_from_slice(&self.inner.storage.lock()[range]);
        Ok(())
    }

    fn write_block(&self, block_num: u64, buf: &[u8]) -> Result<(), BlockError> {
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        self.check(block_num, buf.len())?;
        if self.inner.faults.lock().writes.contains(&block_num) {
            return Err(BlockError::IoError);
        }
        let range = self.range(block_num);
        let len = range.len();
        self.inner.storage.lock()[range].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.inner.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.inner.num_blocks
    }

    fn flush(&self) -> Result<(), BlockError> {
        self.inner.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
