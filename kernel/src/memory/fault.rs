//! Frame allocation with reclaim, and the page-fault path
//!
//! Reclaim picks the first private (refcount 1), unpinned resident page in
//! task-slot order starting at a rotating cursor, lowest address first,
//! writes it to a free swap slot and frees its frame.

use super::address_space::{vpn_of, PageEntry, PageState, Vpn};
use super::frame_allocator::FrameId;
use super::swap::{SwapError, SwapSlot};
use crate::config::{PAGE_SIZE, TASK_SIZE};
use crate::kernel::Kernel;
use crate::signal::constants::{SIGBUS, SIGKILL, SIGSEGV};
use crate::task::{Pid, TaskState};
use alloc::vec::Vec;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// A zeroed frame was mapped
    DemandZero,
    /// The page was read back from swap
    SwappedIn,
    /// A shared frame was copied for the writer
    CopiedOnWrite,
    /// The writer was the frame's only user; write access restored
    WriteEnabled,
    /// Nothing to do
    AlreadyMapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No free frame and nothing evictable
    OutOfMemory,
    /// Eviction failed writing to swap
    Swap(SwapError),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "out of memory"),
            MemoryError::Swap(e) => write!(f, "eviction failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    NoSuchTask(Pid),
    /// Address outside every region; SIGSEGV raised
    Segv { addr: u32 },
    /// No frame could be found; SIGKILL raised
    OutOfMemory,
    /// Reading the page back from swap failed; SIGBUS raised
    Bus(SwapError),
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::NoSuchTask(pid) => write!(f, "no task with pid {}", pid),
            FaultError::Segv { addr } => write!(f, "segmentation fault at {:#010x}", addr),
            FaultError::OutOfMemory => write!(f, "out of memory"),
            FaultError::Bus(e) => write!(f, "swap-in failed: {}", e),
        }
    }
}

impl Kernel {
    /// Take a free frame (count 0 -> 1), evicting a page to swap if the
    /// pool is empty.
    pub fn allocate_frame(&mut self) -> Result<FrameId, MemoryError> {
        if let Some(frame) = self.frames.allocate() {
            return Ok(frame);
        }
        self.swap_out()?;
        self.frames.allocate().ok_or(MemoryError::OutOfMemory)
    }

    /// Drop a reference; true when the frame went back to the pool.
    pub fn free_frame(&mut self, frame: FrameId) -> bool {
        self.frames.free(frame)
    }

    pub fn share_frame(&mut self, frame: FrameId) -> u16 {
        self.frames.share(frame)
    }

    fn swap_out(&mut self) -> Result<(), MemoryError> {
        let swap = self.swap.as_mut().ok_or(MemoryError::OutOfMemory)?;
        let capacity = self.tasks.capacity();
        for step in 0..capacity {
            let slot = (self.swap_cursor + step) % capacity;
            let frames = &self.frames;
            let victim = self.tasks.task(slot).and_then(|task| {
                task.space.iter().find_map(|(vpn, entry)| match entry {
                    PageEntry::Resident { frame, .. }
                        if frames.refcount(frame) == 1 && !frames.is_pinned(frame) =>
                    {
                        Some((vpn, frame))
                    }
                    _ => None,
                })
            });
            let (vpn, frame) = match victim {
                Some(v) => v,
                None => continue,
            };

            let swap_slot = match swap.allocate_slot(&mut self.cache) {
                Ok(s) => s,
                Err(SwapError::Full) => {
                    log::warn!("swap full, cannot evict");
                    return Err(MemoryError::OutOfMemory);
                }
                Err(e) => return Err(MemoryError::Swap(e)),
            };
            if let Err(e) = swap.write_page(&mut self.cache, swap_slot, self.frames.bytes(frame), &mut self.tasks) {
                log::warn!("eviction of {} to {} failed: {}", frame, swap_slot, e);
                swap.free_slot(&mut self.cache, swap_slot);
                return Err(MemoryError::Swap(e));
            }

            if let Some(task) = self.tasks.task_mut(slot) {
                task.space.map(vpn, PageEntry::Swapped { slot: swap_slot });
                log::debug!(
                    "evicted page {:#x} of task {} ({}) to {}",
                    vpn as usize * PAGE_SIZE,
                    task.pid,
                    frame,
                    swap_slot
                );
            }
            self.frames.free(frame);
            self.swap_cursor = slot;
            self.stats.evictions += 1;
            return Ok(());
        }
        Err(MemoryError::OutOfMemory)
    }

    /// Resolve a fault by `pid` at `addr` (an offset in its window).
    ///
    /// Bad addresses, exhausted memory and swap read errors raise SIGSEGV,
    /// SIGKILL and SIGBUS respectively on the faulting task only.
    pub fn page_fault(&mut self, pid: Pid, addr: u32, access: Access) -> Result<FaultResolution, FaultError> {
        let slot = self.fault_slot(pid)?;
        let vpn = vpn_of(addr);
        let (entry, valid) = match self.tasks.task(slot) {
            Some(task) => (task.space.entry(vpn), addr < TASK_SIZE && task.space.layout.contains(addr)),
            None => return Err(FaultError::NoSuchTask(pid)),
        };

        let result = match entry {
            Some(PageEntry::Resident { writable, .. }) if access == Access::Read || writable => {
                Ok(FaultResolution::AlreadyMapped)
            }
            Some(PageEntry::Resident { frame, .. }) => self.write_protect_fault(slot, vpn, frame),
            Some(PageEntry::Swapped { slot: swap_slot }) => self.swap_in(slot, vpn, swap_slot),
            None if !valid => {
                log::debug!("task {}: {:?} of unmapped address {:#010x}", pid, access, addr);
                Err(FaultError::Segv { addr })
            }
            None => self.demand_zero(slot, vpn),
        };

        match result {
            Err(FaultError::Segv { .. }) => self.force_signal(pid, SIGSEGV),
            Err(FaultError::OutOfMemory) => self.force_signal(pid, SIGKILL),
            Err(FaultError::Bus(_)) => self.force_signal(pid, SIGBUS),
            _ => {}
        }
        result
    }

    fn fault_slot(&self, pid: Pid) -> Result<usize, FaultError> {
        self.tasks
            .slot_of(pid)
            .filter(|&slot| self.tasks.task(slot).map_or(false, |t| t.state != TaskState::Zombie))
            .ok_or(FaultError::NoSuchTask(pid))
    }

    fn new_frame_for_fault(&mut self) -> Result<FrameId, FaultError> {
        self.allocate_frame().map_err(|e| {
            log::warn!("no frame for fault: {}", e);
            FaultError::OutOfMemory
        })
    }

    fn demand_zero(&mut self, slot: usize, vpn: Vpn) -> Result<FaultResolution, FaultError> {
        let frame = self.new_frame_for_fault()?;
        self.frames.zero(frame);
        self.map_page(slot, vpn, PageEntry::Resident { frame, writable: true });
        self.stats.demand_zero += 1;
        Ok(FaultResolution::DemandZero)
    }

    fn write_protect_fault(&mut self, slot: usize, vpn: Vpn, frame: FrameId) -> Result<FaultResolution, FaultError> {
        if self.frames.refcount(frame) == 1 {
            if let Some(task) = self.tasks.task_mut(slot) {
                task.space.set_writable(vpn, true);
            }
            return Ok(FaultResolution::WriteEnabled);
        }
        let copy = self.new_frame_for_fault()?;
        self.frames.copy(frame, copy);
        self.frames.free(frame);
        self.map_page(slot, vpn, PageEntry::Resident { frame: copy, writable: true });
        self.stats.page_copies += 1;
        log::debug!("copy-on-write: {} -> {} at page {:#x}", frame, copy, vpn);
        Ok(FaultResolution::CopiedOnWrite)
    }

    fn swap_in(&mut self, slot: usize, vpn: Vpn, swap_slot: SwapSlot) -> Result<FaultResolution, FaultError> {
        let frame = self.new_frame_for_fault()?;
        let swap = match self.swap.as_mut() {
            Some(swap) => swap,
            None => {
                log::error!("page {:#x} is in {} but swap is off", vpn, swap_slot);
                self.frames.free(frame);
                return Err(FaultError::Bus(SwapError::NotEnabled));
            }
        };
        if let Err(e) = swap.read_page(&mut self.cache, swap_slot, self.frames.bytes_mut(frame), &mut self.tasks) {
            log::warn!("swap-in of {} failed: {}", swap_slot, e);
            self.frames.free(frame);
            return Err(FaultError::Bus(e));
        }
        swap.free_slot(&mut self.cache, swap_slot);
        self.map_page(slot, vpn, PageEntry::Resident { frame, writable: true });
        self.stats.swap_ins += 1;
        Ok(FaultResolution::SwappedIn)
    }

    fn map_page(&mut self, slot: usize, vpn: Vpn, entry: PageEntry) {
        if let Some(task) = self.tasks.task_mut(slot) {
            task.space.map(vpn, entry);
        }
    }

    /// Drop the frames and swap slots behind `entries`.
    pub(crate) fn release_pages(&mut self, entries: Vec<PageEntry>) {
        for entry in entries {
            match entry {
                PageEntry::Resident { frame, .. } => {
                    self.frames.free(frame);
                }
                PageEntry::Swapped { slot } => match self.swap.as_mut() {
                    Some(swap) => {
                        swap.free_slot(&mut self.cache, slot);
                    }
                    None => log::error!("{} released with swap off", slot),
                },
            }
        }
    }

    /// Frame backing `addr`, faulting it in (for writing if asked).
    fn resident_frame(&mut self, pid: Pid, addr: u32, access: Access) -> Result<FrameId, FaultError> {
        loop {
            let slot = self.fault_slot(pid)?;
            let entry = self.tasks.task(slot).and_then(|t| t.space.entry(vpn_of(addr)));
            match entry {
                Some(PageEntry::Resident { frame, writable }) if access == Access::Read || writable => {
                    return Ok(frame)
                }
                _ => {
                    self.page_fault(pid, addr, access)?;
                }
            }
        }
    }

    /// Copy bytes out of a task's memory, faulting pages in as needed.
    pub fn read_user(&mut self, pid: Pid, addr: u32, len: usize) -> Result<Vec<u8>, FaultError> {
        let end = user_end(addr, len)?;
        let mut out = Vec::with_capacity(len);
        let mut cur = addr;
        while cur < end {
            let frame = self.resident_frame(pid, cur, Access::Read)?;
            let offset = cur as usize % PAGE_SIZE;
            let n = (PAGE_SIZE - offset).min((end - cur) as usize);
            out.extend_from_slice(&self.frames.bytes(frame)[offset..offset + n]);
            cur += n as u32;
        }
        Ok(out)
    }

    /// Copy bytes into a task's memory through the write-fault path.
    pub fn write_user(&mut self, pid: Pid, addr: u32, data: &[u8]) -> Result<(), FaultError> {
        let end = user_end(addr, data.len())?;
        let mut cur = addr;
        let mut done = 0;
        while cur < end {
            let frame = self.resident_frame(pid, cur, Access::Write)?;
            let offset = cur as usize % PAGE_SIZE;
            let n = (PAGE_SIZE - offset).min((end - cur) as usize);
            self.frames.bytes_mut(frame)[offset..offset + n].copy_from_slice(&data[done..done + n]);
            cur += n as u32;
            done += n;
        }
        Ok(())
    }

    /// Where the page holding `addr` currently lives.
    pub fn page_state(&self, pid: Pid, addr: u32) -> Option<PageState> {
        let task = self.tasks.get(pid)?;
        Some(match task.space.entry(vpn_of(addr)) {
            None => PageState::Unmapped,
            Some(PageEntry::Resident { frame, writable }) => PageState::Resident {
                frame,
                refcount: self.frames.refcount(frame),
                writable,
            },
            Some(PageEntry::Swapped { slot }) => PageState::Swapped { slot },
        })
    }
}

fn user_end(addr: u32, len: usize) -> Result<u32, FaultError> {
    u32::try_from(len)
        .ok()
        .and_then(|len| addr.checked_add(len))
        .filter(|&end| end <= TASK_SIZE)
        .ok_or(FaultError::Segv { addr })
}
