//! Shared setup for the integration tests: kernels, devices and images.

#![allow(dead_code)]

use vmcore::block::RamDisk;
use vmcore::process::ProgramImage;
use vmcore::{DeviceId, Kernel, KernelConfig, Pid};

pub const SWAP_DEV: DeviceId = DeviceId::new(3, 1);
pub const DISK_DEV: DeviceId = DeviceId::new(3, 2);

/// Blocks on the default swap disk: the header page plus 15 slots.
pub const SWAP_BLOCKS: u64 = 64;

pub fn kernel(config: KernelConfig) -> Kernel {
    Kernel::new(config).expect("valid test config")
}

/// Kernel with a formatted, enabled swap area on a fresh RamDisk.
pub fn kernel_with_swap(config: KernelConfig) -> (Kernel, RamDisk) {
    let mut kernel = kernel(config);
    let disk = RamDisk::new(SWAP_BLOCKS);
    kernel
        .register_device(SWAP_DEV, Box::new(disk.clone()))
        .expect("register swap disk");
    kernel.format_swap(SWAP_DEV).expect("mkswap");
    kernel.enable_swap(SWAP_DEV).expect("swapon");
    (kernel, disk)
}

/// An image whose whole footprint is one page of code.
pub fn one_page_image(name: &str) -> ProgramImage {
    ProgramImage::new(name, &[0xC3; 16], &[], 0)
}

/// Code page filled with a recognisable byte pattern.
pub fn patterned_image(name: &str, seed: u8) -> ProgramImage {
    let code: Vec<u8> = (0..4096u32).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
    ProgramImage::new(name, &code, &[], 0)
}

pub fn spawn(kernel: &mut Kernel, image: &ProgramImage) -> Pid {
    kernel.spawn(image).expect("spawn")
}

pub fn assert_consistent(kernel: &Kernel) {
    if let Err(e) = kernel.check_invariants() {
        panic!("kernel invariant broken: {}", e);
    }
}
