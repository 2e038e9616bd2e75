//! Block and inode allocation on top of the buffer cache.

pub mod allocator;
pub mod bitmap;

pub use allocator::{FsBitmaps, FsError, FsLayout};
pub use bitmap::{BitChange, BitmapSet};
