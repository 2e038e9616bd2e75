//! Buffer cache
//!
//! A fixed pool of block-sized buffers keyed by (device, block):
//! - at most one buffer exists per (device, block) at any time
//! - a buffer with `count == 0` may be reused; dirty contents are written
//!   back before the buffer takes a new identity
//! - a buffer with I/O in flight is locked; requesters sleep until the
//!   completion unlocks it, then re-validate its identity
//!
//! Device I/O goes through a bounded request queue. On a single CPU the only
//! way a sleeper makes progress is the device completing requests, so every
//! wait loop drives [`BufferCache::complete_io`] itself; the kernel's device
//! interrupt entry point calls it too.

use super::{BlockDevice, BlockError, DeviceId};
use crate::config::{BLOCK_SIZE, NR_REQUEST};
use crate::task::Pid;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use crossbeam_queue::ArrayQueue;

/// Index of a buffer in the cache's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(usize);

impl BufferId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// How the cache blocks the calling task while a buffer is locked.
pub trait Sleeper {
    /// Put the current task to sleep on `buffer`. Returns the task that now
    /// waits, or `None` if the caller cannot sleep (early boot, idle task).
    fn sleep_on_buffer(&mut self, buffer: BufferId) -> Option<Pid>;

    /// Make a task that slept on a buffer runnable again.
    fn wake(&mut self, pid: Pid);
}

/// Sleeper for callers with no task context.
pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep_on_buffer(&mut self, _buffer: BufferId) -> Option<Pid> {
        None
    }

    fn wake(&mut self, _pid: Pid) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The device reported an error for the transfer
    Io(BlockError),
    /// Every buffer is referenced
    NoFreeBuffers,
    NoSuchDevice(DeviceId),
    DeviceExists(DeviceId),
    BlockSizeMismatch { expected: usize, found: usize },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(e) => write!(f, "block I/O failed: {}", e),
            CacheError::NoFreeBuffers => write!(f, "no free buffers"),
            CacheError::NoSuchDevice(dev) => write!(f, "no device {}", dev),
            CacheError::DeviceExists(dev) => write!(f, "device {} already registered", dev),
            CacheError::BlockSizeMismatch { expected, found } => {
                write!(f, "device block size {} does not match cache block size {}", found, expected)
            }
        }
    }
}

impl From<BlockError> for CacheError {
    fn from(e: BlockError) -> Self {
        CacheError::Io(e)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub device_reads: u64,
    pub device_writes: u64,
    pub evictions: u64,
    pub dropped_read_aheads: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoOp {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct IoRequest {
    buffer: BufferId,
    op: IoOp,
}

struct BufferHead {
    dev: Option<DeviceId>,
    block: u64,
    data: Box<[u8]>,
    uptodate: bool,
    dirty: bool,
    locked: bool,
    count: u32,
    /// Clock value of the last `get`; lower is older
    last_used: u64,
    waiters: Vec<Pid>,
    error: Option<BlockError>,
}

impl BufferHead {
    fn new() -> Self {
        BufferHead {
            dev: None,
            block: 0,
            data: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
            uptodate: false,
            dirty: false,
            locked: false,
            count: 0,
            last_used: 0,
            waiters: Vec::new(),
            error: None,
        }
    }

    /// Reuse preference: clean and unlocked first.
    fn badness(&self) -> u8 {
        ((self.dirty as u8) << 1) + self.locked as u8
    }
}

pub struct BufferCache {
    buffers: Vec<BufferHead>,
    index: BTreeMap<(DeviceId, u64), BufferId>,
    devices: BTreeMap<DeviceId, Box<dyn BlockDevice>>,
    requests: ArrayQueue<IoRequest>,
    clock: u64,
    stats: CacheStats,
}

impl BufferCache {
    pub fn new(capacity: usize) -> Self {
        log::info!("buffer cache: {} buffers of {} bytes", capacity, BLOCK_SIZE);
        BufferCache {
            buffers: (0..capacity).map(|_| BufferHead::new()).collect(),
            index: BTreeMap::new(),
            devices: BTreeMap::new(),
            requests: ArrayQueue::new(NR_REQUEST),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn register_device(&mut self, dev: DeviceId, device: Box<dyn BlockDevice>) -> Result<(), CacheError> {
        if self.devices.contains_key(&dev) {
            return Err(CacheError::DeviceExists(dev));
        }
        if device.block_size() != BLOCK_SIZE {
            return Err(CacheError::BlockSizeMismatch {
                expected: BLOCK_SIZE,
                found: device.block_size(),
            });
        }
        log::info!("block device {} registered: {} blocks", dev, device.num_blocks());
        self.devices.insert(dev, device);
        Ok(())
    }

    /// Size of a registered device in blocks.
    pub fn device_blocks(&self, dev: DeviceId) -> Option<u64> {
        self.devices.get(&dev).map(|d| d.num_blocks())
    }

    /// Return the buffer for (dev, block), referenced once more.
    ///
    /// A cached buffer is returned as is (after any in-flight I/O finishes).
    /// Otherwise the oldest unreferenced buffer is taken over, written back
    /// first if dirty, and returned not up to date.
    pub fn get(&mut self, dev: DeviceId, block: u64, sleeper: &mut dyn Sleeper) -> Result<BufferId, CacheError> {
        if !self.devices.contains_key(&dev) {
            return Err(CacheError::NoSuchDevice(dev));
        }
        loop {
            if let Some(&id) = self.index.get(&(dev, block)) {
                self.head_mut(id).count += 1;
                self.wait_on_buffer(id, sleeper);
                let head = self.head(id);
                if head.dev == Some(dev) && head.block == block {
                    self.touch(id);
                    self.stats.hits += 1;
                    log::trace!("cache hit {}:{} -> {}", dev, block, id);
                    return Ok(id);
                }
                self.head_mut(id).count -= 1;
                continue;
            }

            let victim = self.pick_victim().ok_or(CacheError::NoFreeBuffers)?;
            if self.head(victim).locked {
                self.wait_on_buffer(victim, sleeper);
                continue;
            }
            if self.head(victim).dirty {
                self.write_back(victim, sleeper)?;
                continue;
            }
            // Sleeping above may have let the block be cached elsewhere
            if self.index.contains_key(&(dev, block)) {
                continue;
            }

            let head = &mut self.buffers[victim.0];
            if let Some(old) = head.dev.take() {
                self.index.remove(&(old, head.block));
                self.stats.evictions += 1;
                log::debug!("buffer {} reused: {}:{} -> {}:{}", victim, old, head.block, dev, block);
            }
            head.dev = Some(dev);
            head.block = block;
            head.uptodate = false;
            head.dirty = false;
            head.error = None;
            head.count = 1;
            self.index.insert((dev, block), victim);
            self.touch(victim);
            self.stats.misses += 1;
            return Ok(victim);
        }
    }

    /// `get`, then fill the buffer from the device if it is not up to date.
    pub fn bread(&mut self, dev: DeviceId, block: u64, sleeper: &mut dyn Sleeper) -> Result<BufferId, CacheError> {
        let id = self.get(dev, block, sleeper)?;
        if !self.head(id).uptodate {
            self.submit(id, IoOp::Read, false, sleeper);
        }
        self.finish_read(id, sleeper)
    }

    /// Read `block` and start asynchronous reads of `ahead`.
    pub fn breada(
        &mut self,
        dev: DeviceId,
        block: u64,
        ahead: &[u64],
        sleeper: &mut dyn Sleeper,
    ) -> Result<BufferId, CacheError> {
        let id = self.get(dev, block, sleeper)?;
        if !self.head(id).uptodate && !self.head(id).locked {
            self.submit(id, IoOp::Read, false, sleeper);
        }
        self.read_ahead(dev, ahead, sleeper);
        self.finish_read(id, sleeper)
    }

    /// Start best-effort reads; nothing waits for them and failures are
    /// dropped. Requests that do not fit in the queue are not issued.
    pub fn read_ahead(&mut self, dev: DeviceId, blocks: &[u64], sleeper: &mut dyn Sleeper) {
        for &block in blocks {
            let id = match self.get(dev, block, sleeper) {
                Ok(id) => id,
                Err(e) => {
                    log::debug!("read-ahead of {}:{} skipped: {}", dev, block, e);
                    continue;
                }
            };
            let head = self.head(id);
            if !head.uptodate && !head.locked {
                self.submit(id, IoOp::Read, true, sleeper);
            }
            // Drop the reference without waiting for the read
            self.head_mut(id).count -= 1;
        }
    }

    /// Drop one reference. Releasing an unreferenced buffer is fatal.
    pub fn release(&mut self, id: BufferId) {
        let head = &mut self.buffers[id.0];
        if head.count == 0 {
            log::error!(
                "release of free buffer {} ({:?}:{})",
                id,
                head.dev,
                head.block
            );
            panic!("trying to free free buffer {}", id);
        }
        head.count -= 1;
    }

    pub fn mark_dirty(&mut self, id: BufferId) {
        self.head_mut(id).dirty = true;
    }

    /// Zero the payload and treat it as valid, modified data.
    pub fn zero_fill(&mut self, id: BufferId) {
        let head = self.head_mut(id);
        head.data.fill(0);
        head.uptodate = true;
        head.dirty = true;
    }

    /// Write one buffer back now and wait for the device.
    pub fn write(&mut self, id: BufferId, sleeper: &mut dyn Sleeper) -> Result<(), CacheError> {
        self.write_back(id, sleeper)
    }

    /// Write back every dirty buffer of `dev` (or of all devices) and flush
    /// the devices. The first error is reported after all writes finish.
    pub fn sync(&mut self, dev: Option<DeviceId>, sleeper: &mut dyn Sleeper) -> Result<(), CacheError> {
        let selected: Vec<BufferId> = (0..self.buffers.len())
            .map(BufferId)
            .filter(|&id| {
                let head = self.head(id);
                head.dev.is_some() && (dev.is_none() || head.dev == dev)
            })
            .collect();

        for &id in &selected {
            self.wait_on_buffer(id, sleeper);
            if self.head(id).dirty {
                self.submit(id, IoOp::Write, false, sleeper);
            }
        }

        let mut first_error = None;
        for &id in &selected {
            self.wait_on_buffer(id, sleeper);
            let head = self.head(id);
            if head.dirty {
                if let Some(e) = head.error {
                    first_error.get_or_insert(e);
                }
            }
        }

        for (&d, device) in self.devices.iter() {
            if dev.is_none() || dev == Some(d) {
                if let Err(e) = device.flush() {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(CacheError::Io(e)),
            None => Ok(()),
        }
    }

    /// Forget clean, unreferenced buffers of `dev`. Returns how many.
    pub fn invalidate(&mut self, dev: DeviceId) -> usize {
        let mut dropped = 0;
        for i in 0..self.buffers.len() {
            let head = &self.buffers[i];
            if head.dev == Some(dev) && head.count == 0 && !head.locked && !head.dirty {
                self.drop_identity(BufferId(i));
                dropped += 1;
            }
        }
        dropped
    }

    /// Discard the cached copy of a freed block, dirty or not. Referenced
    /// or locked buffers are left alone and `false` is returned.
    pub fn forget(&mut self, dev: DeviceId, block: u64) -> bool {
        let id = match self.index.get(&(dev, block)) {
            Some(&id) => id,
            None => return true,
        };
        let head = self.head(id);
        if head.count != 0 || head.locked {
            log::warn!("freed block {}:{} is still in use ({} refs)", dev, block, head.count);
            return false;
        }
        self.drop_identity(id);
        true
    }

    /// Perform the oldest queued request, unlock its buffer and wake the
    /// tasks sleeping on it. Returns the completed buffer.
    pub fn complete_io(&mut self, sleeper: &mut dyn Sleeper) -> Option<BufferId> {
        let req = self.requests.pop()?;
        let head = &mut self.buffers[req.buffer.0];
        let result = match head.dev.and_then(|dev| self.devices.get(&dev)) {
            None => Err(BlockError::DeviceNotReady),
            Some(device) => match req.op {
                IoOp::Read => {
                    self.stats.device_reads += 1;
                    device.read_block(head.block, &mut head.data)
                }
                IoOp::Write => {
                    self.stats.device_writes += 1;
                    device.write_block(head.block, &head.data)
                }
            },
        };
        match (req.op, result) {
            (IoOp::Read, Ok(())) => head.uptodate = true,
            (IoOp::Write, Ok(())) => head.dirty = false,
            (op, Err(e)) => {
                log::warn!("{:?} of {:?}:{} failed: {}", op, head.dev, head.block, e);
                head.error = Some(e);
                if op == IoOp::Read {
                    head.uptodate = false;
                }
            }
        }
        head.locked = false;
        let waiters = core::mem::take(&mut head.waiters);
        for pid in waiters {
            sleeper.wake(pid);
        }
        Some(req.buffer)
    }

    /// Complete every queued request.
    pub fn drain_io(&mut self, sleeper: &mut dyn Sleeper) -> usize {
        let mut done = 0;
        while self.complete_io(sleeper).is_some() {
            done += 1;
        }
        done
    }

    pub fn data(&self, id: BufferId) -> &[u8] {
        &self.head(id).data
    }

    /// Mutable payload; the caller marks the buffer dirty.
    pub fn data_mut(&mut self, id: BufferId) -> &mut [u8] {
        &mut self.head_mut(id).data
    }

    pub fn lookup(&self, dev: DeviceId, block: u64) -> Option<BufferId> {
        self.index.get(&(dev, block)).copied()
    }

    pub fn identity(&self, id: BufferId) -> Option<(DeviceId, u64)> {
        let head = self.head(id);
        head.dev.map(|dev| (dev, head.block))
    }

    pub fn count(&self, id: BufferId) -> u32 {
        self.head(id).count
    }

    pub fn is_dirty(&self, id: BufferId) -> bool {
        self.head(id).dirty
    }

    pub fn is_uptodate(&self, id: BufferId) -> bool {
        self.head(id).uptodate
    }

    pub fn is_locked(&self, id: BufferId) -> bool {
        self.head(id).locked
    }

    pub fn last_error(&self, id: BufferId) -> Option<BlockError> {
        self.head(id).error
    }

    /// Buffers currently holding (dev, block); never more than one.
    pub fn copies_of(&self, dev: DeviceId, block: u64) -> usize {
        self.buffers
            .iter()
            .filter(|h| h.dev == Some(dev) && h.block == block)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn free_buffers(&self) -> usize {
        self.buffers.iter().filter(|h| h.count == 0).count()
    }

    pub fn pending_io(&self) -> usize {
        self.requests.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn head(&self, id: BufferId) -> &BufferHead {
        &self.buffers[id.0]
    }

    fn head_mut(&mut self, id: BufferId) -> &mut BufferHead {
        &mut self.buffers[id.0]
    }

    fn touch(&mut self, id: BufferId) {
        self.clock += 1;
        let clock = self.clock;
        self.head_mut(id).last_used = clock;
    }

    fn pick_victim(&self) -> Option<BufferId> {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.count == 0)
            .min_by_key(|(_, h)| (h.badness(), h.last_used))
            .map(|(i, _)| BufferId(i))
    }

    fn drop_identity(&mut self, id: BufferId) {
        let head = &mut self.buffers[id.0];
        if let Some(dev) = head.dev.take() {
            self.index.remove(&(dev, head.block));
        }
        head.uptodate = false;
        head.dirty = false;
        head.error = None;
    }

    /// Lock the buffer and queue a transfer. A full queue is drained one
    /// completion at a time, except for best-effort reads which are dropped.
    fn submit(&mut self, id: BufferId, op: IoOp, best_effort: bool, sleeper: &mut dyn Sleeper) -> bool {
        let head = self.head_mut(id);
        head.locked = true;
        head.error = None;
        let mut req = IoRequest { buffer: id, op };
        loop {
            match self.requests.push(req) {
                Ok(()) => return true,
                Err(_) if best_effort => {
                    self.head_mut(id).locked = false;
                    self.stats.dropped_read_aheads += 1;
                    log::warn!("request queue full, read-ahead of {} dropped", id);
                    return false;
                }
                Err(rejected) => {
                    req = rejected;
                    self.complete_io(sleeper);
                }
            }
        }
    }

    fn wait_on_buffer(&mut self, id: BufferId, sleeper: &mut dyn Sleeper) {
        while self.head(id).locked {
            if let Some(pid) = sleeper.sleep_on_buffer(id) {
                let waiters = &mut self.head_mut(id).waiters;
                if !waiters.contains(&pid) {
                    waiters.push(pid);
                }
            }
            if self.complete_io(sleeper).is_none() {
                log::error!("buffer {} is locked but no request is queued", id);
                panic!("buffer {} locked without pending I/O", id);
            }
        }
    }

    fn finish_read(&mut self, id: BufferId, sleeper: &mut dyn Sleeper) -> Result<BufferId, CacheError> {
        self.wait_on_buffer(id, sleeper);
        if self.head(id).uptodate {
            return Ok(id);
        }
        let error = self.head(id).error.unwrap_or(BlockError::IoError);
        self.release(id);
        Err(CacheError::Io(error))
    }

    fn write_back(&mut self, id: BufferId, sleeper: &mut dyn Sleeper) -> Result<(), CacheError> {
        if self.head(id).dev.is_none() {
            log::error!("write of unassigned buffer {}", id);
            panic!("buffer {} has no device", id);
        }
        self.wait_on_buffer(id, sleeper);
        self.submit(id, IoOp::Write, false, sleeper);
        self.wait_on_buffer(id, sleeper);
        match self.head(id).error {
            Some(e) if self.head(id).dirty => Err(CacheError::Io(e)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;

    const DEV: DeviceId = DeviceId::new(3, 1);

    fn cache_with_disk(buffers: usize, blocks: u64) -> (BufferCache, RamDisk) {
        let disk = RamDisk::new(blocks);
        let mut cache = BufferCache::new(buffers);
        cache.register_device(DEV, Box::new(disk.clone())).unwrap();
        (cache, disk)
    }

    struct RecordingSleeper {
        pid: Pid,
        slept: Vec<BufferId>,
        woken: Vec<Pid>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep_on_buffer(&mut self, buffer: BufferId) -> Option<Pid> {
            self.slept.push(buffer);
            Some(self.pid)
        }

        fn wake(&mut self, pid: Pid) {
            self.woken.push(pid);
        }
    }

    #[test]
    fn repeated_get_shares_one_buffer() {
        let (mut cache, disk) = cache_with_disk(8, 16);
        let a = cache.bread(DEV, 5, &mut NoSleep).unwrap();
        let b = cache.bread(DEV, 5, &mut NoSleep).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.count(a), 2);
        assert_eq!(disk.reads(), 1, "second read must be served from the cache");
        assert_eq!(cache.copies_of(DEV, 5), 1);
    }

    #[test]
    fn dirty_victim_is_written_back_before_reuse() {
        let (mut cache, disk) = cache_with_disk(8, 32);
        let id = cache.get(DEV, 0, &mut NoSleep).unwrap();
        cache.data_mut(id)[..4].copy_from_slice(b"abcd");
        cache.mark_dirty(id);
        cache.release(id);

        // Pin the other seven buffers so block 0 is the only candidate
        for block in 1..8 {
            cache.get(DEV, block, &mut NoSleep).unwrap();
        }
        let id = cache.get(DEV, 8, &mut NoSleep).unwrap();
        assert_eq!(disk.writes(), 1);
        cache.release(id);
        assert_eq!(&disk.peek(0)[..4], b"abcd");
        assert!(cache.lookup(DEV, 0).is_none(), "block 0 should have been evicted");
    }

    #[test]
    fn clean_buffers_are_reused_before_dirty_ones() {
        let (mut cache, disk) = cache_with_disk(8, 32);
        for block in 0..8 {
            let id = cache.get(DEV, block, &mut NoSleep).unwrap();
            if block == 0 {
                cache.mark_dirty(id);
            }
            cache.release(id);
        }
        let id = cache.get(DEV, 20, &mut NoSleep).unwrap();
        cache.release(id);
        assert!(cache.lookup(DEV, 0).is_some(), "dirty block 0 should survive");
        assert!(cache.lookup(DEV, 1).is_none(), "oldest clean block should go");
        assert_eq!(disk.writes(), 0);
    }

    #[test]
    fn exhausted_cache_reports_no_free_buffers() {
        let (mut cache, _disk) = cache_with_disk(8, 32);
        for block in 0..8 {
            cache.get(DEV, block, &mut NoSleep).unwrap();
        }
        assert_eq!(cache.get(DEV, 9, &mut NoSleep), Err(CacheError::NoFreeBuffers));
    }

    #[test]
    #[should_panic(expected = "free buffer")]
    fn releasing_a_free_buffer_is_fatal() {
        let (mut cache, _disk) = cache_with_disk(8, 32);
        let id = cache.get(DEV, 1, &mut NoSleep).unwrap();
        cache.release(id);
        cache.release(id);
    }

    #[test]
    fn read_error_is_propagated_without_marking_valid() {
        let (mut cache, disk) = cache_with_disk(8, 32);
        disk.fail_reads_of(4);
        assert_eq!(cache.bread(DEV, 4, &mut NoSleep), Err(CacheError::Io(BlockError::IoError)));
        let id = cache.lookup(DEV, 4).unwrap();
        assert!(!cache.is_uptodate(id));
        assert_eq!(cache.count(id), 0);

        disk.clear_faults();
        let id = cache.bread(DEV, 4, &mut NoSleep).unwrap();
        assert!(cache.is_uptodate(id));
    }

    #[test]
    fn reader_sleeps_on_in_flight_read_ahead() {
        let (mut cache, disk) = cache_with_disk(8, 32);
        cache.read_ahead(DEV, &[3], &mut NoSleep);
        let id = cache.lookup(DEV, 3).unwrap();
        assert!(cache.is_locked(id));
        assert_eq!(cache.pending_io(), 1);

        let mut sleeper = RecordingSleeper {
            pid: Pid::new(7),
            slept: Vec::new(),
            woken: Vec::new(),
        };
        let got = cache.bread(DEV, 3, &mut sleeper).unwrap();
        assert_eq!(got, id);
        assert_eq!(sleeper.slept, vec![id]);
        assert_eq!(sleeper.woken, vec![Pid::new(7)]);
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn read_ahead_is_dropped_when_queue_is_full() {
        let (mut cache, _disk) = cache_with_disk(NR_REQUEST + 8, 64);
        let blocks: Vec<u64> = (0..(NR_REQUEST as u64 + 2)).collect();
        cache.read_ahead(DEV, &blocks, &mut NoSleep);
        assert_eq!(cache.pending_io(), NR_REQUEST);
        assert_eq!(cache.stats().dropped_read_aheads, 2);
        assert_eq!(cache.drain_io(&mut NoSleep), NR_REQUEST);
    }

    #[test]
    fn sync_writes_every_dirty_buffer_and_flushes() {
        let (mut cache, disk) = cache_with_disk(8, 32);
        for block in 0..3 {
            let id = cache.get(DEV, block, &mut NoSleep).unwrap();
            cache.data_mut(id)[0] = block as u8 + 1;
            cache.mark_dirty(id);
            cache.release(id);
        }
        cache.sync(Some(DEV), &mut NoSleep).unwrap();
        assert_eq!(disk.writes(), 3);
        assert_eq!(disk.flushes(), 1);
        assert_eq!(disk.peek(2)[0], 3);
        let id = cache.lookup(DEV, 1).unwrap();
        assert!(!cache.is_dirty(id));
    }

    #[test]
    fn failed_write_keeps_buffer_dirty() {
        let (mut cache, disk) = cache_with_disk(8, 32);
        disk.fail_writes_of(2);
        let id = cache.get(DEV, 2, &mut NoSleep).unwrap();
        cache.zero_fill(id);
        assert_eq!(cache.write(id, &mut NoSleep), Err(CacheError::Io(BlockError::IoError)));
        assert!(cache.is_dirty(id));
        cache.release(id);
    }

    #[test]
    fn unknown_device_and_block_size_are_rejected() {
        let mut cache = BufferCache::new(8);
        assert_eq!(
            cache.get(DEV, 0, &mut NoSleep),
            Err(CacheError::NoSuchDevice(DEV))
        );
        let small = RamDisk::with_block_size(8, 512);
        assert_eq!(
            cache.register_device(DEV, Box::new(small)),
            Err(CacheError::BlockSizeMismatch { expected: 1024, found: 512 })
        );
    }
}
