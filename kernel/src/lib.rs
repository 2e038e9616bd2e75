//! Kernel core: paged memory with swap, task table and scheduler, and the
//! buffer cache that backs block, inode and swap-slot allocation.
//!
//! The crate is `no_std` + `alloc`. Every table lives in an explicit
//! [`Kernel`] context; the optional global instance in [`kernel`] wraps one
//! behind a single spin lock, which is the only critical section.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod fs;
pub mod kernel;
pub mod logger;
pub mod memory;
pub mod process;
pub mod signal;
pub mod task;

pub use block::cache::{BufferCache, BufferId, CacheError};
pub use block::{BlockDevice, BlockError, DeviceId};
pub use config::{KernelConfig, SharingPolicy};
pub use kernel::{Kernel, KernelError, KernelStats};
pub use task::Pid;
