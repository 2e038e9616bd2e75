//! Zone and inode allocation for a MINIX-style volume
//!
//! Layout: boot block, super block, inode bitmap, zone bitmap, inode table,
//! data zones. Bit 0 of both bitmaps is reserved, so bit `n` of the zone map
//! stands for zone `first_data_zone + n - 1` and inode numbers start at 1.

use super::bitmap::{BitChange, BitmapSet, BITS_PER_BLOCK};
use crate::block::cache::{BufferCache, CacheError, Sleeper};
use crate::block::DeviceId;
use crate::config::BLOCK_SIZE;
use core::fmt;

/// Bytes per on-disk inode.
pub const INODE_SIZE: usize = 32;
pub const INODES_PER_BLOCK: u32 = (BLOCK_SIZE / INODE_SIZE) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsLayout {
    pub inodes: u32,
    pub zones: u32,
    pub imap_blocks: u32,
    pub zmap_blocks: u32,
    pub first_data_zone: u32,
}

impl FsLayout {
    /// Layout for a volume of `zones` blocks holding `inodes` inodes.
    pub fn new(zones: u32, inodes: u32) -> Self {
        let imap_blocks = (inodes + 1).div_ceil(BITS_PER_BLOCK);
        let inode_blocks = inodes.div_ceil(INODES_PER_BLOCK);
        let zmap_blocks = zones.div_ceil(BITS_PER_BLOCK);
        FsLayout {
            inodes,
            zones,
            imap_blocks,
            zmap_blocks,
            first_data_zone: 2 + imap_blocks + zmap_blocks + inode_blocks,
        }
    }

    pub const fn imap_start(&self) -> u64 {
        2
    }

    pub const fn zmap_start(&self) -> u64 {
        2 + self.imap_blocks as u64
    }

    /// Bits in the zone map, the reserved bit included.
    pub fn zone_units(&self) -> u32 {
        self.zones - self.first_data_zone + 1
    }

    pub fn inode_units(&self) -> u32 {
        self.inodes + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NoSpace,
    NoInodes,
    /// Layout does not fit the device
    BadLayout,
    Cache(CacheError),
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NoSpace => write!(f, "no free zones"),
            FsError::NoInodes => write!(f, "no free inodes"),
            FsError::BadLayout => write!(f, "layout does not fit the device"),
            FsError::Cache(e) => write!(f, "{}", e),
        }
    }
}

impl From<CacheError> for FsError {
    fn from(e: CacheError) -> Self {
        FsError::Cache(e)
    }
}

/// Mounted inode and zone bitmaps of one device.
pub struct FsBitmaps {
    dev: DeviceId,
    layout: FsLayout,
    imap: BitmapSet,
    zmap: BitmapSet,
}

impl FsBitmaps {
    /// Write empty bitmaps (only the reserved bits set).
    pub fn format(
        cache: &mut BufferCache,
        dev: DeviceId,
        layout: &FsLayout,
        sleeper: &mut dyn Sleeper,
    ) -> Result<(), FsError> {
        check_fits(cache, dev, layout)?;
        for (start, blocks) in [
            (layout.imap_start(), layout.imap_blocks),
            (layout.zmap_start(), layout.zmap_blocks),
        ] {
            for i in 0..blocks as u64 {
                let id = cache.get(dev, start + i, sleeper)?;
                cache.zero_fill(id);
                if i == 0 {
                    cache.data_mut(id)[0] = 1;
                }
                cache.release(id);
            }
        }
        cache.sync(Some(dev), sleeper)?;
        log::info!(
            "formatted {}: {} zones ({} data), {} inodes",
            dev,
            layout.zones,
            layout.zone_units() - 1,
            layout.inodes
        );
        Ok(())
    }

    pub fn mount(
        cache: &mut BufferCache,
        dev: DeviceId,
        layout: FsLayout,
        sleeper: &mut dyn Sleeper,
    ) -> Result<Self, FsError> {
        check_fits(cache, dev, &layout)?;
        let imap = BitmapSet::load(
            cache,
            dev,
            layout.imap_start(),
            layout.imap_blocks as usize,
            layout.inode_units(),
            sleeper,
        )?;
        let zmap = match BitmapSet::load(
            cache,
            dev,
            layout.zmap_start(),
            layout.zmap_blocks as usize,
            layout.zone_units(),
            sleeper,
        ) {
            Ok(zmap) => zmap,
            Err(e) => {
                imap.release(cache);
                return Err(e.into());
            }
        };
        Ok(FsBitmaps {
            dev,
            layout,
            imap,
            zmap,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.dev
    }

    pub fn layout(&self) -> &FsLayout {
        &self.layout
    }

    /// Allocate the lowest free zone and hand back its number with a
    /// zeroed, dirty buffer behind it.
    pub fn new_block(&mut self, cache: &mut BufferCache, sleeper: &mut dyn Sleeper) -> Result<u32, FsError> {
        let bit = self.zmap.find_first_free(cache).ok_or(FsError::NoSpace)?;
        let zone = bit + self.layout.first_data_zone - 1;
        let id = cache.get(self.dev, zone as u64, sleeper)?;
        self.zmap.mark_used(cache, bit);
        cache.zero_fill(id);
        cache.release(id);
        log::debug!("new block {} on {}", zone, self.dev);
        Ok(zone)
    }

    /// Return a zone to the free map. A zone outside the data area is fatal.
    pub fn free_block(&mut self, cache: &mut BufferCache, zone: u32) -> BitChange {
        if zone < self.layout.first_data_zone || zone >= self.layout.zones {
            log::error!(
                "free_block: zone {} outside data area {}..{} of {}",
                zone,
                self.layout.first_data_zone,
                self.layout.zones,
                self.dev
            );
            panic!("trying to free block {} not in datazone", zone);
        }
        cache.forget(self.dev, zone as u64);
        self.zmap.mark_free(cache, zone - self.layout.first_data_zone + 1)
    }

    pub fn new_inode(&mut self, cache: &mut BufferCache) -> Result<u32, FsError> {
        let ino = self.imap.find_first_free(cache).ok_or(FsError::NoInodes)?;
        self.imap.mark_used(cache, ino);
        Ok(ino)
    }

    /// Inode 0 and numbers past the table are fatal.
    pub fn free_inode(&mut self, cache: &mut BufferCache, ino: u32) -> BitChange {
        if ino == 0 || ino > self.layout.inodes {
            log::error!("free_inode: inode {} outside 1..={} of {}", ino, self.layout.inodes, self.dev);
            panic!("trying to free nonexistent inode {}", ino);
        }
        self.imap.mark_free(cache, ino)
    }

    pub fn free_zones(&self, cache: &BufferCache) -> u32 {
        self.zmap.count_free(cache)
    }

    pub fn free_inodes(&self, cache: &BufferCache) -> u32 {
        self.imap.count_free(cache)
    }

    pub fn is_dirty(&self, cache: &BufferCache) -> bool {
        self.imap.is_dirty(cache) || self.zmap.is_dirty(cache)
    }

    /// Unpin both bitmaps. Callers sync the device afterwards.
    pub fn unmount(self, cache: &mut BufferCache) {
        self.imap.release(cache);
        self.zmap.release(cache);
    }
}

fn check_fits(cache: &BufferCache, dev: DeviceId, layout: &FsLayout) -> Result<(), FsError> {
    let blocks = cache
        .device_blocks(dev)
        .ok_or(FsError::Cache(CacheError::NoSuchDevice(dev)))?;
    if layout.first_data_zone >= layout.zones || layout.zones as u64 > blocks || layout.inodes == 0 {
        return Err(FsError::BadLayout);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::cache::NoSleep;
    use crate::block::RamDisk;
    use alloc::boxed::Box;

    const DEV: DeviceId = DeviceId::new(3, 0);

    fn mounted(zones: u32, inodes: u32) -> (BufferCache, FsBitmaps, RamDisk) {
        let disk = RamDisk::new(zones as u64);
        let mut cache = BufferCache::new(16);
        cache.register_device(DEV, Box::new(disk.clone())).unwrap();
        let layout = FsLayout::new(zones, inodes);
        FsBitmaps::format(&mut cache, DEV, &layout, &mut NoSleep).unwrap();
        let fs = FsBitmaps::mount(&mut cache, DEV, layout, &mut NoSleep).unwrap();
        (cache, fs, disk)
    }

    #[test]
    fn layout_places_data_after_metadata() {
        let layout = FsLayout::new(360, 64);
        assert_eq!(layout.imap_blocks, 1);
        assert_eq!(layout.zmap_blocks, 1);
        // 64 inodes at 32 per block
        assert_eq!(layout.first_data_zone, 2 + 1 + 1 + 2);
    }

    #[test]
    fn blocks_are_handed_out_from_the_data_area_upwards() {
        let (mut cache, mut fs, _disk) = mounted(64, 16);
        let first = fs.layout().first_data_zone;
        assert_eq!(fs.new_block(&mut cache, &mut NoSleep), Ok(first));
        assert_eq!(fs.new_block(&mut cache, &mut NoSleep), Ok(first + 1));
        assert_eq!(fs.free_block(&mut cache, first), BitChange::Changed);
        assert_eq!(fs.new_block(&mut cache, &mut NoSleep), Ok(first));
        let id = cache.lookup(DEV, first as u64).unwrap();
        assert!(cache.is_dirty(id) && cache.data(id).iter().all(|&b| b == 0));
    }

    #[test]
    fn volume_fills_up() {
        let (mut cache, mut fs, _disk) = mounted(16, 8);
        let data_zones = fs.layout().zone_units() - 1;
        for _ in 0..data_zones {
            fs.new_block(&mut cache, &mut NoSleep).unwrap();
        }
        assert_eq!(fs.new_block(&mut cache, &mut NoSleep), Err(FsError::NoSpace));
        assert_eq!(fs.free_zones(&cache), 0);
    }

    #[test]
    fn inode_zero_is_never_allocated() {
        let (mut cache, mut fs, _disk) = mounted(64, 4);
        let inos: alloc::vec::Vec<u32> = (0..4).map(|_| fs.new_inode(&mut cache).unwrap()).collect();
        assert_eq!(inos, [1, 2, 3, 4]);
        assert_eq!(fs.new_inode(&mut cache), Err(FsError::NoInodes));
        fs.free_inode(&mut cache, 2);
        assert_eq!(fs.new_inode(&mut cache), Ok(2));
    }

    #[test]
    #[should_panic(expected = "not in datazone")]
    fn freeing_metadata_block_is_fatal() {
        let (mut cache, mut fs, _disk) = mounted(64, 16);
        fs.free_block(&mut cache, 1);
    }

    #[test]
    fn bitmaps_persist_across_remount() {
        let (mut cache, mut fs, _disk) = mounted(64, 16);
        let zone = fs.new_block(&mut cache, &mut NoSleep).unwrap();
        let layout = *fs.layout();
        fs.unmount(&mut cache);
        cache.sync(Some(DEV), &mut NoSleep).unwrap();
        cache.invalidate(DEV);
        let mut fs = FsBitmaps::mount(&mut cache, DEV, layout, &mut NoSleep).unwrap();
        assert_eq!(fs.new_block(&mut cache, &mut NoSleep), Ok(zone + 1));
    }
}
