//! Swap area
//!
//! The swap device is divided into page-sized slots of four blocks. Slot 0
//! is the header page: a slot bitmap (1 = used) followed by the signature
//! `SWAP-SPACE` in the last ten bytes. Slot 0 itself is always marked used,
//! and the bitmap never extends into the signature bytes.

use crate::block::cache::{BufferCache, CacheError, Sleeper};
use crate::block::DeviceId;
use crate::config::{BLOCKS_PER_PAGE, BLOCK_SIZE, PAGE_SIZE};
use crate::fs::bitmap::{BitChange, BitmapSet};
use alloc::vec::Vec;
use core::fmt;

pub const SWAP_SIGNATURE: &[u8; 10] = b"SWAP-SPACE";

/// Slots addressable by the header bitmap.
pub const MAX_SWAP_SLOTS: u32 = ((PAGE_SIZE - SWAP_SIGNATURE.len()) * 8) as u32;

/// Page-sized slot on the swap device; slot `n` covers blocks `4n..4n+4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub const fn new(index: u32) -> Self {
        SwapSlot(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }

    pub const fn first_block(self) -> u64 {
        self.0 as u64 * BLOCKS_PER_PAGE as u64
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    NotEnabled,
    AlreadyEnabled,
    /// Header page lacks the signature
    BadSignature,
    /// Device cannot hold the header plus one slot
    TooSmall,
    /// Every slot is in use
    Full,
    /// Pages are still swapped out
    InUse(u32),
    Cache(CacheError),
}

impl fmt::Display for SwapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapError::NotEnabled => write!(f, "swap is not enabled"),
            SwapError::AlreadyEnabled => write!(f, "swap is already enabled"),
            SwapError::BadSignature => write!(f, "swap header signature missing"),
            SwapError::TooSmall => write!(f, "swap device too small"),
            SwapError::Full => write!(f, "swap space exhausted"),
            SwapError::InUse(n) => write!(f, "{} pages still in swap", n),
            SwapError::Cache(e) => write!(f, "swap I/O: {}", e),
        }
    }
}

impl From<CacheError> for SwapError {
    fn from(e: CacheError) -> Self {
        SwapError::Cache(e)
    }
}

fn slots_for(cache: &BufferCache, dev: DeviceId) -> Result<u32, SwapError> {
    let blocks = cache
        .device_blocks(dev)
        .ok_or(SwapError::Cache(CacheError::NoSuchDevice(dev)))?;
    let pages = blocks / BLOCKS_PER_PAGE as u64;
    if pages < 2 {
        return Err(SwapError::TooSmall);
    }
    Ok(pages.min(MAX_SWAP_SLOTS as u64) as u32)
}

pub struct SwapManager {
    dev: DeviceId,
    bitmap: BitmapSet,
}

impl SwapManager {
    /// Write a fresh header: every slot free except the header itself.
    pub fn format(cache: &mut BufferCache, dev: DeviceId, sleeper: &mut dyn Sleeper) -> Result<u32, SwapError> {
        let slots = slots_for(cache, dev)?;
        for i in 0..BLOCKS_PER_PAGE as u64 {
            let id = cache.get(dev, i, sleeper)?;
            cache.zero_fill(id);
            let data = cache.data_mut(id);
            if i == 0 {
                data[0] = 1;
            }
            if i == BLOCKS_PER_PAGE as u64 - 1 {
                data[BLOCK_SIZE - SWAP_SIGNATURE.len()..].copy_from_slice(SWAP_SIGNATURE);
            }
            cache.release(id);
        }
        cache.sync(Some(dev), sleeper)?;
        log::info!("swap area on {}: {} slots", dev, slots - 1);
        Ok(slots)
    }

    /// Validate the header and pin its bitmap.
    pub fn enable(cache: &mut BufferCache, dev: DeviceId, sleeper: &mut dyn Sleeper) -> Result<Self, SwapError> {
        let slots = slots_for(cache, dev)?;
        let tail = cache.bread(dev, BLOCKS_PER_PAGE as u64 - 1, sleeper)?;
        let signed = &cache.data(tail)[BLOCK_SIZE - SWAP_SIGNATURE.len()..] == SWAP_SIGNATURE;
        cache.release(tail);
        if !signed {
            log::warn!("no swap signature on {}", dev);
            return Err(SwapError::BadSignature);
        }
        let bitmap = BitmapSet::load(cache, dev, 0, BLOCKS_PER_PAGE, slots, sleeper)?;
        if !bitmap.is_used(cache, 0) {
            log::warn!("swap header slot of {} is marked free", dev);
            bitmap.release(cache);
            return Err(SwapError::BadSignature);
        }
        let manager = SwapManager { dev, bitmap };
        log::info!(
            "swap enabled on {}: {} of {} slots free",
            dev,
            manager.free_slots(cache),
            slots - 1
        );
        Ok(manager)
    }

    pub fn device(&self) -> DeviceId {
        self.dev
    }

    /// Usable slots, the header excluded.
    pub fn slots(&self) -> u32 {
        self.bitmap.units() - 1
    }

    pub fn free_slots(&self, cache: &BufferCache) -> u32 {
        self.bitmap.count_free(cache)
    }

    pub fn is_used(&self, cache: &BufferCache, slot: SwapSlot) -> bool {
        self.bitmap.is_used(cache, slot.index())
    }

    pub fn allocate_slot(&mut self, cache: &mut BufferCache) -> Result<SwapSlot, SwapError> {
        let index = self.bitmap.find_first_free(cache).ok_or(SwapError::Full)?;
        self.bitmap.mark_used(cache, index);
        Ok(SwapSlot(index))
    }

    /// Freeing the header slot or a slot past the area is fatal.
    pub fn free_slot(&mut self, cache: &mut BufferCache, slot: SwapSlot) -> BitChange {
        if slot.index() == 0 {
            log::error!("attempt to free swap header slot on {}", self.dev);
            panic!("freeing swap header slot");
        }
        self.bitmap.mark_free(cache, slot.index())
    }

    /// Write one page to `slot` and wait for the device.
    pub fn write_page(
        &mut self,
        cache: &mut BufferCache,
        slot: SwapSlot,
        page: &[u8],
        sleeper: &mut dyn Sleeper,
    ) -> Result<(), SwapError> {
        for (i, chunk) in page.chunks(BLOCK_SIZE).enumerate() {
            let id = cache.get(self.dev, slot.first_block() + i as u64, sleeper)?;
            cache.data_mut(id).copy_from_slice(chunk);
            cache.mark_dirty(id);
            let written = cache.write(id, sleeper);
            cache.release(id);
            written?;
        }
        log::trace!("wrote page to {} on {}", slot, self.dev);
        Ok(())
    }

    /// Read `slot` into `page`. The slot's later blocks are requested ahead
    /// of the first one.
    pub fn read_page(
        &mut self,
        cache: &mut BufferCache,
        slot: SwapSlot,
        page: &mut [u8],
        sleeper: &mut dyn Sleeper,
    ) -> Result<(), SwapError> {
        let first = slot.first_block();
        let ahead: Vec<u64> = (1..BLOCKS_PER_PAGE as u64).map(|i| first + i).collect();
        for (i, chunk) in page.chunks_mut(BLOCK_SIZE).enumerate() {
            let id = if i == 0 {
                cache.breada(self.dev, first, &ahead, sleeper)?
            } else {
                cache.bread(self.dev, first + i as u64, sleeper)?
            };
            chunk.copy_from_slice(cache.data(id));
            cache.release(id);
        }
        log::trace!("read page from {} on {}", slot, self.dev);
        Ok(())
    }

    /// Unpin the header bitmap; callers sync the device.
    pub fn disable(self, cache: &mut BufferCache) {
        self.bitmap.release(cache);
    }
}
