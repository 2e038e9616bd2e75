//! Allocation bitmaps and the block/inode allocator built on them.

mod common;

use common::*;
use vmcore::block::cache::NoSleep;
use vmcore::block::RamDisk;
use vmcore::fs::bitmap::BITS_PER_BLOCK;
use vmcore::fs::{BitChange, BitmapSet, FsLayout};
use vmcore::{BufferCache, KernelConfig, KernelError};

fn loaded_bitmap(units: u32, blocks: usize) -> (BufferCache, BitmapSet) {
    let mut cache = BufferCache::new(16);
    cache
        .register_device(DISK_DEV, Box::new(RamDisk::new(16)))
        .unwrap();
    let bitmap = BitmapSet::load(&mut cache, DISK_DEV, 1, blocks, units, &mut NoSleep).unwrap();
    (cache, bitmap)
}

/// Setting then clearing a free bit restores it, and the lowest free unit
/// reported is never one that is in use.
#[test]
fn bitmap_round_trip_and_first_free() {
    let units = BITS_PER_BLOCK + 100;
    let (mut cache, mut bitmap) = loaded_bitmap(units, 2);
    let mut seed = 0x1234_5678u32;

    for _ in 0..3000 {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        let unit = (seed >> 4) % units;
        if bitmap.is_used(&cache, unit) {
            assert_eq!(bitmap.mark_free(&mut cache, unit), BitChange::Changed);
        } else {
            assert_eq!(bitmap.mark_used(&mut cache, unit), BitChange::Changed);
            assert_eq!(bitmap.mark_free(&mut cache, unit), BitChange::Changed);
            assert!(!bitmap.is_used(&cache, unit));
            if seed & 1 == 0 {
                bitmap.mark_used(&mut cache, unit);
            }
        }

        if let Some(free) = bitmap.find_first_free(&cache) {
            assert!(!bitmap.is_used(&cache, free));
            assert!((0..free).all(|u| bitmap.is_used(&cache, u)));
        }
    }
    assert_eq!(bitmap.anomalies(), 0);
}

#[test]
fn full_bitmap_has_no_free_unit() {
    let (mut cache, mut bitmap) = loaded_bitmap(10, 1);
    for unit in 0..10 {
        bitmap.mark_used(&mut cache, unit);
    }
    assert_eq!(bitmap.find_first_free(&cache), None);
    assert_eq!(bitmap.count_free(&cache), 0);
}

#[test]
fn double_free_is_counted_and_tolerated() {
    let (mut cache, mut bitmap) = loaded_bitmap(64, 1);
    bitmap.mark_used(&mut cache, 5);
    assert_eq!(bitmap.mark_free(&mut cache, 5), BitChange::Changed);
    assert_eq!(bitmap.mark_free(&mut cache, 5), BitChange::AlreadyInState);
    assert_eq!(bitmap.mark_used(&mut cache, 6), BitChange::Changed);
    assert_eq!(bitmap.mark_used(&mut cache, 6), BitChange::AlreadyInState);
    assert_eq!(bitmap.anomalies(), 2);
}

#[test]
#[should_panic(expected = "out of range")]
fn unit_past_the_end_is_fatal() {
    let (mut cache, mut bitmap) = loaded_bitmap(64, 1);
    bitmap.mark_used(&mut cache, 64);
}

fn mounted_kernel(layout: FsLayout) -> (vmcore::Kernel, RamDisk) {
    let mut kernel = kernel(KernelConfig::default());
    let disk = RamDisk::new(layout.zones as u64);
    kernel.register_device(DISK_DEV, Box::new(disk.clone())).unwrap();
    kernel.mkfs(DISK_DEV, layout).unwrap();
    kernel.mount(DISK_DEV, layout).unwrap();
    (kernel, disk)
}

#[test]
fn blocks_come_from_the_data_area_lowest_first() {
    let layout = FsLayout::new(64, 32);
    let (mut kernel, disk) = mounted_kernel(layout);
    disk.poke(layout.first_data_zone as u64, b"stale contents");

    let first = kernel.new_block(DISK_DEV).unwrap();
    let second = kernel.new_block(DISK_DEV).unwrap();
    assert_eq!(first, layout.first_data_zone);
    assert_eq!(second, first + 1);

    let id = kernel.bread(DISK_DEV, first as u64).unwrap();
    assert!(kernel.buffer_data(id).iter().all(|&b| b == 0), "new blocks are zeroed");
    kernel.brelse(id);

    assert_eq!(kernel.free_block(DISK_DEV, first).unwrap(), BitChange::Changed);
    assert_eq!(kernel.new_block(DISK_DEV).unwrap(), first);
}

#[test]
fn allocation_stops_when_the_zone_map_is_full() {
    let layout = FsLayout::new(16, 8);
    let (mut kernel, _disk) = mounted_kernel(layout);
    let data_zones = layout.zones - layout.first_data_zone;
    for _ in 0..data_zones {
        kernel.new_block(DISK_DEV).unwrap();
    }
    assert_eq!(kernel.free_zones(DISK_DEV).unwrap(), 0);
    assert_eq!(
        kernel.new_block(DISK_DEV),
        Err(KernelError::Fs(vmcore::fs::FsError::NoSpace))
    );
}

#[test]
fn inodes_start_at_one_and_are_reused() {
    let layout = FsLayout::new(64, 4);
    let (mut kernel, _disk) = mounted_kernel(layout);
    let inodes: Vec<u32> = (0..4).map(|_| kernel.new_inode(DISK_DEV).unwrap()).collect();
    assert_eq!(inodes, vec![1, 2, 3, 4]);
    assert_eq!(
        kernel.new_inode(DISK_DEV),
        Err(KernelError::Fs(vmcore::fs::FsError::NoInodes))
    );
    kernel.free_inode(DISK_DEV, 3).unwrap();
    assert_eq!(kernel.new_inode(DISK_DEV).unwrap(), 3);
}

#[test]
fn bitmaps_survive_unmount() {
    let layout = FsLayout::new(64, 32);
    let (mut kernel, disk) = mounted_kernel(layout);
    let zone = kernel.new_block(DISK_DEV).unwrap();
    let ino = kernel.new_inode(DISK_DEV).unwrap();
    kernel.umount(DISK_DEV).unwrap();

    // Bit 0 is reserved, so the first zone and inode are bits 1.
    assert_eq!(disk.peek(layout.imap_start())[0], 0b11);
    assert_eq!(disk.peek(layout.zmap_start())[0], 0b11);

    kernel.mount(DISK_DEV, layout).unwrap();
    assert_ne!(kernel.new_block(DISK_DEV).unwrap(), zone);
    assert_ne!(kernel.new_inode(DISK_DEV).unwrap(), ino);
}

#[test]
#[should_panic(expected = "not in datazone")]
fn freeing_a_metadata_block_is_fatal() {
    let layout = FsLayout::new(64, 32);
    let (mut kernel, _disk) = mounted_kernel(layout);
    let _ = kernel.free_block(DISK_DEV, 1);
}
