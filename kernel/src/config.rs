//! Shared constants and runtime configuration.

use core::fmt;

/// Size of a device block and of a buffer-cache payload.
pub const BLOCK_SIZE: usize = 1024;
/// Size of a page frame.
pub const PAGE_SIZE: usize = 4096;
/// Blocks making up one page (and one swap slot).
pub const BLOCKS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SIZE;
/// Size of each task's linear window (one 64 MiB segment per slot).
pub const TASK_SIZE: u32 = 0x0400_0000;
/// Open-resource slots per task.
pub const NR_OPEN: usize = 20;
/// Capacity of the block request queue.
pub const NR_REQUEST: usize = 32;
/// Timer ticks per second.
pub const HZ: u64 = 100;
/// Base priority given to the root task.
pub const DEFAULT_PRIORITY: u32 = 15;
/// Table slot of the root/idle task.
pub const IDLE_SLOT: usize = 0;

/// What `fork` does with writable pages it shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingPolicy {
    /// Parent and child map the same frame writable; writes are visible to both.
    SharedNoCow,
    /// Both mappings become read-only; the first write copies the frame.
    CopyOnWrite,
}

/// Runtime parameters of a [`Kernel`](crate::Kernel) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    pub max_tasks: usize,
    pub frames: usize,
    pub buffers: usize,
    pub sharing: SharingPolicy,
    /// Bytes below `TASK_SIZE` that may be faulted in as stack.
    pub stack_limit: u32,
    pub priority: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            max_tasks: 64,
            frames: 256,
            buffers: 64,
            sharing: SharingPolicy::SharedNoCow,
            stack_limit: 8 * 1024 * 1024,
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl KernelConfig {
    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_buffers(mut self, buffers: usize) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_sharing(mut self, sharing: SharingPolicy) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn with_stack_limit(mut self, stack_limit: u32) -> Self {
        self.stack_limit = stack_limit;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Reject configurations the tables cannot be built from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks < 2 {
            return Err(ConfigError::TooFewTasks(self.max_tasks));
        }
        // Frame reference counts are u16 and every task may share a frame.
        if self.max_tasks > u16::MAX as usize {
            return Err(ConfigError::TooManyTasks(self.max_tasks));
        }
        if self.frames == 0 {
            return Err(ConfigError::NoFrames);
        }
        // The swap header pins one page worth of buffers and a page transfer
        // needs another.
        if self.buffers < 2 * BLOCKS_PER_PAGE {
            return Err(ConfigError::TooFewBuffers(self.buffers));
        }
        if self.stack_limit == 0
            || self.stack_limit % PAGE_SIZE as u32 != 0
            || self.stack_limit >= TASK_SIZE
        {
            return Err(ConfigError::BadStackLimit(self.stack_limit));
        }
        if self.priority == 0 {
            return Err(ConfigError::ZeroPriority);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    TooFewTasks(usize),
    TooManyTasks(usize),
    NoFrames,
    TooFewBuffers(usize),
    BadStackLimit(u32),
    ZeroPriority,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::TooFewTasks(n) => write!(f, "task table needs at least 2 slots, got {}", n),
            ConfigError::TooManyTasks(n) => write!(f, "task table is limited to {} slots, got {}", u16::MAX, n),
            ConfigError::NoFrames => write!(f, "frame pool is empty"),
            ConfigError::TooFewBuffers(n) => {
                write!(f, "buffer cache needs at least {} buffers, got {}", 2 * BLOCKS_PER_PAGE, n)
            }
            ConfigError::BadStackLimit(l) => write!(f, "stack limit {:#x} is not a page multiple below the task size", l),
            ConfigError::ZeroPriority => write!(f, "priority must be at least 1"),
        }
    }
}
