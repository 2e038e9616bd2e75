//! fork: duplicate a task into a free table slot
//!
//! The child's pages are the parent's frames, shared by reference count:
//! - SharedNoCow: both keep the mapping as it was, writes are seen by both
//! - CopyOnWrite: both mappings lose write access; the first write copies
//!
//! A page the parent has in swap is read back in for the parent and the
//! swap slot is handed to the child, so no slot is ever shared.

use crate::config::SharingPolicy;
use crate::kernel::Kernel;
use crate::memory::address_space::{AddressSpace, PageEntry, Vpn};
use crate::memory::swap::SwapError;
use crate::memory::{MemoryError, SwapSlot};
use crate::task::{Pid, Task, TaskState, TaskTimes};
use alloc::vec::Vec;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    NoSuchTask(Pid),
    /// No free task slot
    TableFull,
    OutOfMemory,
    Swap(SwapError),
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkError::NoSuchTask(pid) => write!(f, "no task with pid {}", pid),
            ForkError::TableFull => write!(f, "task table full"),
            ForkError::OutOfMemory => write!(f, "out of memory"),
            ForkError::Swap(e) => write!(f, "{}", e),
        }
    }
}

impl From<MemoryError> for ForkError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::OutOfMemory => ForkError::OutOfMemory,
            MemoryError::Swap(e) => ForkError::Swap(e),
        }
    }
}

impl Kernel {
    /// Create a runnable child of `parent`. Returns the child's pid; the
    /// child's saved `eax` is 0 and the parent's is the child's pid.
    pub fn fork(&mut self, parent: Pid) -> Result<Pid, ForkError> {
        let parent_slot = self.live_slot(parent).map_err(|_| ForkError::NoSuchTask(parent))?;
        let child_slot = self.tasks.find_free_slot().ok_or(ForkError::TableFull)?;
        let space = self.copy_address_space(parent, parent_slot)?;
        let pid = self.tasks.next_pid();

        let parent_task = match self.tasks.task_mut(parent_slot) {
            Some(task) => task,
            None => return Err(ForkError::NoSuchTask(parent)),
        };
        parent_task.context.eax = pid.as_u32();
        let mut context = parent_task.context;
        context.eax = 0;
        let child = Task {
            pid,
            name: parent_task.name.clone(),
            state: TaskState::Runnable,
            counter: parent_task.priority,
            priority: parent_task.priority,
            exit_code: 0,
            parent: None,
            youngest_child: None,
            younger_sibling: None,
            older_sibling: None,
            signals: parent_task.signals.fork(),
            alarm: 0,
            times: TaskTimes::default(),
            start_time: self.jiffies,
            context,
            space,
            files: parent_task.files.clone(),
            wait_channel: None,
        };
        let pages = child.space.len();

        self.tasks.insert(child_slot, child);
        self.tasks.link_child(parent_slot, child_slot);
        self.stats.forks += 1;
        log::info!(
            "fork: task {} -> child {} in slot {} ({} pages, {:?})",
            parent,
            pid,
            child_slot,
            pages,
            self.config.sharing
        );
        Ok(pid)
    }

    fn copy_address_space(&mut self, parent: Pid, parent_slot: usize) -> Result<AddressSpace, ForkError> {
        let cow = self.config.sharing == SharingPolicy::CopyOnWrite;
        let layout = match self.tasks.task(parent_slot) {
            Some(task) => task.space.layout,
            None => return Err(ForkError::NoSuchTask(parent)),
        };
        let mut child = AddressSpace::new(layout);

        // Reading a page back can evict another parent page, so rescan
        // until every swapped parent page has been handed over.
        while let Some((vpn, slot)) = self.next_swapped_page(parent_slot, &child) {
            if let Err(e) = self.take_back_swapped_page(parent_slot, vpn, slot) {
                self.release_pages(child.take_all());
                return Err(e);
            }
            child.map(vpn, PageEntry::Swapped { slot });
        }

        let shared: Vec<(Vpn, PageEntry)> = match self.tasks.task(parent_slot) {
            Some(task) => task.space.iter().filter(|(vpn, _)| child.entry(*vpn).is_none()).collect(),
            None => Vec::new(),
        };
        for (vpn, entry) in shared {
            if let PageEntry::Resident { frame, writable } = entry {
                self.frames.share(frame);
                if cow {
                    if let Some(task) = self.tasks.task_mut(parent_slot) {
                        task.space.set_writable(vpn, false);
                    }
                }
                child.map(
                    vpn,
                    PageEntry::Resident {
                        frame,
                        writable: writable && !cow,
                    },
                );
            }
        }
        Ok(child)
    }

    fn next_swapped_page(
        &self,
        parent_slot: usize,
        child: &AddressSpace,
    ) -> Option<(Vpn, SwapSlot)> {
        self.tasks.task(parent_slot)?.space.iter().find_map(|(vpn, entry)| match entry {
            PageEntry::Swapped { slot } if child.entry(vpn).is_none() => Some((vpn, slot)),
            _ => None,
        })
    }

    /// Read `slot` into a new frame and map it for the parent at `vpn`.
    fn take_back_swapped_page(
        &mut self,
        parent_slot: usize,
        vpn: Vpn,
        slot: SwapSlot,
    ) -> Result<(), ForkError> {
        let frame = self.allocate_frame()?;
        let swap = match self.swap.as_mut() {
            Some(swap) => swap,
            None => {
                self.frames.free(frame);
                return Err(ForkError::Swap(SwapError::NotEnabled));
            }
        };
        if let Err(e) = swap.read_page(&mut self.cache, slot, self.frames.bytes_mut(frame), &mut self.tasks) {
            self.frames.free(frame);
            return Err(ForkError::Swap(e));
        }
        if let Some(task) = self.tasks.task_mut(parent_slot) {
            task.space.map(vpn, PageEntry::Resident { frame, writable: true });
        }
        self.stats.swap_ins += 1;
        Ok(())
    }
}
