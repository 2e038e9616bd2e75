//! The kernel context
//!
//! [`Kernel`] owns every table: frames, tasks, the buffer cache, the swap
//! area and mounted bitmaps. Operations live in `impl Kernel` blocks next to
//! the subsystem they belong to (`memory::fault`, `process`, `signal`,
//! `task::scheduler`); this file holds construction, device plumbing and the
//! cross-table invariant check.
//!
//! A process-wide instance can be installed with [`init`] and reached with
//! [`with_kernel`]. Its mutex is the only critical section: interrupt entry
//! points are called with the lock held.

use crate::block::cache::{BufferCache, BufferId, CacheError, CacheStats};
use crate::block::{BlockDevice, DeviceId};
use crate::config::{ConfigError, KernelConfig};
use crate::fs::{BitChange, FsBitmaps, FsError, FsLayout};
use crate::memory::address_space::PageEntry;
use crate::memory::{FaultError, FrameId, FrameTable, MemoryError, SwapError, SwapManager, SwapSlot};
use crate::process::{ExecError, ForkError, WaitError};
use crate::signal::SignalError;
use crate::task::{InvariantError, Pid, Switch, Task, TaskError, TaskState, TaskTable};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use conquer_once::spin::OnceCell;
use core::fmt;
use spin::Mutex;

/// Event counters kept by the kernel context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub forks: u64,
    /// Pages duplicated on a copy-on-write fault
    pub page_copies: u64,
    /// Pages written out to swap to free a frame
    pub evictions: u64,
    pub swap_ins: u64,
    pub demand_zero: u64,
    pub context_switches: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Config(ConfigError),
    Cache(CacheError),
    Swap(SwapError),
    Memory(MemoryError),
    Fault(FaultError),
    Fork(ForkError),
    Wait(WaitError),
    Exec(ExecError),
    Signal(SignalError),
    Task(TaskError),
    Fs(FsError),
    Invariant(InvariantError),
    /// Device already holds a mounted filesystem or the swap area
    Busy(DeviceId),
    NotMounted(DeviceId),
    AlreadyInitialized,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Config(e) => write!(f, "config: {}", e),
            KernelError::Cache(e) => write!(f, "buffer cache: {}", e),
            KernelError::Swap(e) => write!(f, "swap: {}", e),
            KernelError::Memory(e) => write!(f, "memory: {}", e),
            KernelError::Fault(e) => write!(f, "page fault: {}", e),
            KernelError::Fork(e) => write!(f, "fork: {}", e),
            KernelError::Wait(e) => write!(f, "wait: {}", e),
            KernelError::Exec(e) => write!(f, "exec: {}", e),
            KernelError::Signal(e) => write!(f, "signal: {}", e),
            KernelError::Task(e) => write!(f, "{}", e),
            KernelError::Fs(e) => write!(f, "fs: {}", e),
            KernelError::Invariant(e) => write!(f, "invariant: {}", e),
            KernelError::Busy(dev) => write!(f, "device {} is busy", dev),
            KernelError::NotMounted(dev) => write!(f, "nothing mounted on {}", dev),
            KernelError::AlreadyInitialized => write!(f, "kernel already initialized"),
        }
    }
}

macro_rules! kernel_error_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for KernelError {
                fn from(e: $source) -> Self {
                    KernelError::$variant(e)
                }
            }
        )*
    };
}

kernel_error_from! {
    ConfigError => Config,
    CacheError => Cache,
    SwapError => Swap,
    MemoryError => Memory,
    FaultError => Fault,
    ForkError => Fork,
    WaitError => Wait,
    ExecError => Exec,
    SignalError => Signal,
    TaskError => Task,
    FsError => Fs,
    InvariantError => Invariant,
}

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) frames: FrameTable,
    pub(crate) tasks: TaskTable,
    pub(crate) cache: BufferCache,
    pub(crate) swap: Option<SwapManager>,
    pub(crate) filesystems: BTreeMap<DeviceId, FsBitmaps>,
    /// Ticks since boot
    pub(crate) jiffies: u64,
    pub(crate) stats: KernelStats,
    /// Task slot where the next eviction scan starts
    pub(crate) swap_cursor: usize,
}

impl Kernel {
    /// Boot state: every frame free, only the root task, empty cache.
    pub fn new(config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let root = Task::root(config.priority, config.stack_limit);
        let kernel = Kernel {
            frames: FrameTable::new(config.frames),
            tasks: TaskTable::new(config.max_tasks, root),
            cache: BufferCache::new(config.buffers),
            swap: None,
            filesystems: BTreeMap::new(),
            jiffies: 0,
            stats: KernelStats::default(),
            swap_cursor: 0,
            config,
        };
        log::info!(
            "kernel: {} task slots, {} frames, {} buffers, {:?}",
            kernel.config.max_tasks,
            kernel.config.frames,
            kernel.config.buffers,
            kernel.config.sharing
        );
        Ok(kernel)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    pub fn swap(&self) -> Option<&SwapManager> {
        self.swap.as_ref()
    }

    pub fn jiffies(&self) -> u64 {
        self.jiffies
    }

    pub fn stats(&self) -> KernelStats {
        self.stats
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Slot of a task that has not exited.
    pub(crate) fn live_slot(&self, pid: Pid) -> Result<usize, TaskError> {
        let slot = self.tasks.slot_of(pid).ok_or(TaskError::NoSuchTask(pid))?;
        match self.tasks.task(slot) {
            Some(task) if task.state == TaskState::Zombie => Err(TaskError::Zombie(pid)),
            Some(_) => Ok(slot),
            None => Err(TaskError::NoSuchTask(pid)),
        }
    }

    pub(crate) fn live_task_mut(&mut self, pid: Pid) -> Result<&mut Task, TaskError> {
        let slot = self.live_slot(pid)?;
        self.tasks.task_mut(slot).ok_or(TaskError::NoSuchTask(pid))
    }

    /// Make `pid` the current task without consulting the scheduler, as a
    /// syscall entry on its behalf would.
    pub fn switch_to(&mut self, pid: Pid) -> Result<Switch, TaskError> {
        let slot = self.live_slot(pid)?;
        let switch = self.tasks.switch_to(slot);
        if switch.switched() {
            self.stats.context_switches += 1;
        }
        Ok(switch)
    }

    pub fn register_device(&mut self, dev: DeviceId, device: Box<dyn BlockDevice>) -> Result<(), CacheError> {
        self.cache.register_device(dev, device)?;
        log::info!("registered block device {}", dev);
        Ok(())
    }

    /// Disk interrupt: finish the oldest queued request and wake its waiters.
    pub fn device_interrupt(&mut self) -> Option<BufferId> {
        self.cache.complete_io(&mut self.tasks)
    }

    fn check_free(&self, dev: DeviceId) -> Result<(), KernelError> {
        let swapping = self.swap.as_ref().map_or(false, |s| s.device() == dev);
        if swapping || self.filesystems.contains_key(&dev) {
            return Err(KernelError::Busy(dev));
        }
        Ok(())
    }
}

/// Swap area management
impl Kernel {
    /// Write a fresh swap header on `dev`; returns the slot count including
    /// the header.
    pub fn format_swap(&mut self, dev: DeviceId) -> Result<u32, KernelError> {
        self.check_free(dev)?;
        Ok(SwapManager::format(&mut self.cache, dev, &mut self.tasks)?)
    }

    pub fn enable_swap(&mut self, dev: DeviceId) -> Result<(), KernelError> {
        if self.swap.is_some() {
            return Err(SwapError::AlreadyEnabled.into());
        }
        self.check_free(dev)?;
        self.swap = Some(SwapManager::enable(&mut self.cache, dev, &mut self.tasks)?);
        Ok(())
    }

    /// Turn swap off. Refused while any page is still swapped out.
    pub fn disable_swap(&mut self) -> Result<(), KernelError> {
        let swapped: usize = self.tasks.iter().map(|(_, t)| t.space.swapped_pages()).sum();
        if swapped > 0 {
            return Err(SwapError::InUse(swapped as u32).into());
        }
        let swap = self.swap.take().ok_or(SwapError::NotEnabled)?;
        let dev = swap.device();
        swap.disable(&mut self.cache);
        self.cache.sync(Some(dev), &mut self.tasks)?;
        log::info!("swap disabled on {}", dev);
        Ok(())
    }
}

/// Buffer access on behalf of the current task
impl Kernel {
    pub fn getblk(&mut self, dev: DeviceId, block: u64) -> Result<BufferId, CacheError> {
        self.cache.get(dev, block, &mut self.tasks)
    }

    pub fn bread(&mut self, dev: DeviceId, block: u64) -> Result<BufferId, CacheError> {
        self.cache.bread(dev, block, &mut self.tasks)
    }

    /// Read `block` and start reads of `ahead` without waiting for them.
    pub fn breada(&mut self, dev: DeviceId, block: u64, ahead: &[u64]) -> Result<BufferId, CacheError> {
        self.cache.breada(dev, block, ahead, &mut self.tasks)
    }

    pub fn read_ahead(&mut self, dev: DeviceId, blocks: &[u64]) {
        self.cache.read_ahead(dev, blocks, &mut self.tasks)
    }

    pub fn brelse(&mut self, id: BufferId) {
        self.cache.release(id)
    }

    pub fn mark_dirty(&mut self, id: BufferId) {
        self.cache.mark_dirty(id)
    }

    pub fn buffer_data(&self, id: BufferId) -> &[u8] {
        self.cache.data(id)
    }

    pub fn buffer_data_mut(&mut self, id: BufferId) -> &mut [u8] {
        self.cache.data_mut(id)
    }

    pub fn bwrite(&mut self, id: BufferId) -> Result<(), CacheError> {
        self.cache.write(id, &mut self.tasks)
    }

    pub fn sync(&mut self, dev: Option<DeviceId>) -> Result<(), CacheError> {
        self.cache.sync(dev, &mut self.tasks)
    }
}

/// Filesystem bitmaps
impl Kernel {
    pub fn mkfs(&mut self, dev: DeviceId, layout: FsLayout) -> Result<(), KernelError> {
        self.check_free(dev)?;
        Ok(FsBitmaps::format(&mut self.cache, dev, &layout, &mut self.tasks)?)
    }

    pub fn mount(&mut self, dev: DeviceId, layout: FsLayout) -> Result<(), KernelError> {
        self.check_free(dev)?;
        let bitmaps = FsBitmaps::mount(&mut self.cache, dev, layout, &mut self.tasks)?;
        self.filesystems.insert(dev, bitmaps);
        log::info!("mounted {}", dev);
        Ok(())
    }

    /// Unpin the bitmaps of `dev` and write everything back.
    pub fn umount(&mut self, dev: DeviceId) -> Result<(), KernelError> {
        let bitmaps = self.filesystems.remove(&dev).ok_or(KernelError::NotMounted(dev))?;
        bitmaps.unmount(&mut self.cache);
        self.cache.sync(Some(dev), &mut self.tasks)?;
        log::info!("unmounted {}", dev);
        Ok(())
    }

    /// Allocate and zero a data zone.
    pub fn new_block(&mut self, dev: DeviceId) -> Result<u32, KernelError> {
        let bitmaps = self.filesystems.get_mut(&dev).ok_or(KernelError::NotMounted(dev))?;
        Ok(bitmaps.new_block(&mut self.cache, &mut self.tasks)?)
    }

    pub fn free_block(&mut self, dev: DeviceId, zone: u32) -> Result<BitChange, KernelError> {
        let bitmaps = self.filesystems.get_mut(&dev).ok_or(KernelError::NotMounted(dev))?;
        Ok(bitmaps.free_block(&mut self.cache, zone))
    }

    pub fn new_inode(&mut self, dev: DeviceId) -> Result<u32, KernelError> {
        let bitmaps = self.filesystems.get_mut(&dev).ok_or(KernelError::NotMounted(dev))?;
        Ok(bitmaps.new_inode(&mut self.cache)?)
    }

    pub fn free_inode(&mut self, dev: DeviceId, ino: u32) -> Result<BitChange, KernelError> {
        let bitmaps = self.filesystems.get_mut(&dev).ok_or(KernelError::NotMounted(dev))?;
        Ok(bitmaps.free_inode(&mut self.cache, ino))
    }

    pub fn free_zones(&self, dev: DeviceId) -> Result<u32, KernelError> {
        let bitmaps = self.filesystems.get(&dev).ok_or(KernelError::NotMounted(dev))?;
        Ok(bitmaps.free_zones(&self.cache))
    }
}

impl Kernel {
    /// Cross-table consistency: the task table's own structure, one
    /// mapping per frame reference, frame conservation, and swap slots
    /// owned by exactly one page each.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        self.tasks.check_invariants()?;

        let mut mappings: BTreeMap<FrameId, u16> = BTreeMap::new();
        let mut slots: BTreeSet<SwapSlot> = BTreeSet::new();
        for (_, task) in self.tasks.iter() {
            for (_, entry) in task.space.iter() {
                match entry {
                    PageEntry::Resident { frame, .. } => *mappings.entry(frame).or_insert(0) += 1,
                    PageEntry::Swapped { slot } => {
                        if !slots.insert(slot) {
                            return Err(InvariantError::SwapSlotMismatch { slot: slot.index() });
                        }
                    }
                }
            }
        }

        for (frame, refcount) in self.frames.iter_used() {
            let mapped = mappings.remove(&frame).unwrap_or(0);
            if mapped != refcount {
                return Err(InvariantError::RefcountMismatch {
                    frame: frame.index() as u32,
                    refcount,
                    mappings: mapped,
                });
            }
        }
        if let Some((frame, mapped)) = mappings.into_iter().next() {
            return Err(InvariantError::RefcountMismatch {
                frame: frame.index() as u32,
                refcount: 0,
                mappings: mapped,
            });
        }
        if !self.frames.is_conserved() {
            return Err(InvariantError::FrameCountMismatch {
                free: self.frames.free_frames(),
                used: self.frames.used_frames(),
                total: self.frames.total(),
            });
        }

        match &self.swap {
            Some(swap) => {
                if let Some(slot) = slots.iter().find(|&&s| !swap.is_used(&self.cache, s)) {
                    return Err(InvariantError::SwapSlotMismatch { slot: slot.index() });
                }
                let used = swap.slots() - swap.free_slots(&self.cache);
                if used as usize != slots.len() {
                    return Err(InvariantError::SwapSlotMismatch { slot: 0 });
                }
            }
            None => {
                if let Some(slot) = slots.iter().next() {
                    return Err(InvariantError::SwapSlotMismatch { slot: slot.index() });
                }
            }
        }
        Ok(())
    }
}

static KERNEL: OnceCell<Mutex<Kernel>> = OnceCell::uninit();

/// Install the process-wide kernel. Fails if one is already installed.
pub fn init(config: KernelConfig) -> Result<(), KernelError> {
    let kernel = Kernel::new(config)?;
    KERNEL
        .try_init_once(move || Mutex::new(kernel))
        .map_err(|_| KernelError::AlreadyInitialized)
}

/// Run `f` with the global kernel locked; `None` before [`init`].
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> Option<R> {
    let kernel = KERNEL.get()?;
    let mut guard = kernel.lock();
    Some(f(&mut guard))
}
