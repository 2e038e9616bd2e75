//! Buffer-backed allocation bitmaps
//!
//! One bit per unit, 1 = used, LSB-first within each byte, spread over
//! consecutive device blocks. The blocks stay referenced in the buffer
//! cache for as long as the set is loaded, so they are never evicted and
//! every change is visible through the cache's dirty flag.

use crate::block::cache::{BufferCache, BufferId, CacheError, Sleeper};
use crate::block::DeviceId;
use crate::config::BLOCK_SIZE;
use alloc::vec::Vec;

/// Units covered by one bitmap block.
pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

/// Outcome of setting or clearing a bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitChange {
    Changed,
    /// The bit already had the requested value; recorded as an anomaly
    AlreadyInState,
}

pub struct BitmapSet {
    dev: DeviceId,
    first_block: u64,
    buffers: Vec<BufferId>,
    units: u32,
    anomalies: u32,
}

impl BitmapSet {
    /// Read `blocks` bitmap blocks starting at `first_block` and keep them
    /// referenced. `units` bits are in use; any bits past it are ignored.
    pub fn load(
        cache: &mut BufferCache,
        dev: DeviceId,
        first_block: u64,
        blocks: usize,
        units: u32,
        sleeper: &mut dyn Sleeper,
    ) -> Result<Self, CacheError> {
        if units as u64 > blocks as u64 * BITS_PER_BLOCK as u64 {
            log::error!("bitmap of {} units does not fit in {} blocks", units, blocks);
            panic!("bitmap too small for {} units", units);
        }
        let mut buffers = Vec::with_capacity(blocks);
        for i in 0..blocks as u64 {
            match cache.bread(dev, first_block + i, sleeper) {
                Ok(id) => buffers.push(id),
                Err(e) => {
                    for id in buffers {
                        cache.release(id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(BitmapSet {
            dev,
            first_block,
            buffers,
            units,
            anomalies: 0,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.dev
    }

    pub fn first_block(&self) -> u64 {
        self.first_block
    }

    pub fn units(&self) -> u32 {
        self.units
    }

    /// Set/clear requests that found the bit already in that state.
    pub fn anomalies(&self) -> u32 {
        self.anomalies
    }

    /// Lowest free unit, if any.
    pub fn find_first_free(&self, cache: &BufferCache) -> Option<u32> {
        for (block, &id) in self.buffers.iter().enumerate() {
            let data = cache.data(id);
            if let Some(byte) = data.iter().position(|&b| b != 0xFF) {
                let bit = (!data[byte]).trailing_zeros();
                let unit = block as u32 * BITS_PER_BLOCK + byte as u32 * 8 + bit;
                // Units are scanned in ascending order, so nothing later fits either
                return if unit < self.units { Some(unit) } else { None };
            }
        }
        None
    }

    pub fn is_used(&self, cache: &BufferCache, unit: u32) -> bool {
        let (id, byte, mask) = self.locate(unit);
        cache.data(id)[byte] & mask != 0
    }

    pub fn mark_used(&mut self, cache: &mut BufferCache, unit: u32) -> BitChange {
        self.set(cache, unit, true)
    }

    pub fn mark_free(&mut self, cache: &mut BufferCache, unit: u32) -> BitChange {
        self.set(cache, unit, false)
    }

    pub fn count_free(&self, cache: &BufferCache) -> u32 {
        (0..self.units).filter(|&u| !self.is_used(cache, u)).count() as u32
    }

    /// Whether any backing block has unwritten changes.
    pub fn is_dirty(&self, cache: &BufferCache) -> bool {
        self.buffers.iter().any(|&id| cache.is_dirty(id))
    }

    /// Drop the references taken by `load`.
    pub fn release(self, cache: &mut BufferCache) {
        for id in self.buffers {
            cache.release(id);
        }
    }

    fn set(&mut self, cache: &mut BufferCache, unit: u32, used: bool) -> BitChange {
        let (id, byte, mask) = self.locate(unit);
        let data = cache.data_mut(id);
        if (data[byte] & mask != 0) == used {
            self.anomalies += 1;
            log::warn!(
                "bitmap {}@{}: unit {} already {}",
                self.dev,
                self.first_block,
                unit,
                if used { "used" } else { "free" }
            );
            return BitChange::AlreadyInState;
        }
        if used {
            data[byte] |= mask;
        } else {
            data[byte] &= !mask;
        }
        cache.mark_dirty(id);
        BitChange::Changed
    }

    fn locate(&self, unit: u32) -> (BufferId, usize, u8) {
        if unit >= self.units {
            log::error!(
                "bitmap {}@{}: unit {} outside 0..{}",
                self.dev,
                self.first_block,
                unit,
                self.units
            );
            panic!("bitmap unit {} out of range", unit);
        }
        let block = (unit / BITS_PER_BLOCK) as usize;
        let within = (unit % BITS_PER_BLOCK) as usize;
        (self.buffers[block], within / 8, 1u8 << (within % 8))
    }
}
