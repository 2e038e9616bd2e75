//! Paged memory: the frame table, per-task address spaces, the swap area
//! and the fault path that ties them together.

pub mod address_space;
pub mod fault;
pub mod frame_allocator;
pub mod swap;

pub use address_space::{AddressSpace, MemoryLayout, PageEntry, PageState};
pub use fault::{Access, FaultError, FaultResolution, MemoryError};
pub use frame_allocator::{FrameId, FrameTable};
pub use swap::{SwapError, SwapManager, SwapSlot};
