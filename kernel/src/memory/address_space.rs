//! Per-task address space: region bounds plus page entries
//!
//! Addresses are offsets within the task's 64 MiB linear window. Valid
//! regions:
//! - code, data and bss from 0 up to the break
//! - the stack, growing down from `TASK_SIZE` to `stack_floor`
//!
//! A page is Unmapped (no entry), Resident or Swapped; never both.

use super::frame_allocator::FrameId;
use super::swap::SwapSlot;
use crate::config::{PAGE_SIZE, TASK_SIZE};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Virtual page number within a task window.
pub type Vpn = u32;

pub const fn vpn_of(addr: u32) -> Vpn {
    addr / PAGE_SIZE as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEntry {
    Resident { frame: FrameId, writable: bool },
    Swapped { slot: SwapSlot },
}

/// What a lookup of one page reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Unmapped,
    Resident {
        frame: FrameId,
        refcount: u16,
        writable: bool,
    },
    Swapped {
        slot: SwapSlot,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub end_code: u32,
    pub start_data: u32,
    pub end_data: u32,
    pub brk: u32,
    /// Lowest address the stack may grow down to
    pub stack_floor: u32,
}

impl MemoryLayout {
    /// Layout with no image: only the stack is valid.
    pub const fn empty(stack_limit: u32) -> Self {
        MemoryLayout {
            end_code: 0,
            start_data: 0,
            end_data: 0,
            brk: 0,
            stack_floor: TASK_SIZE - stack_limit,
        }
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr < self.brk || (addr >= self.stack_floor && addr < TASK_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    pub layout: MemoryLayout,
    pages: BTreeMap<Vpn, PageEntry>,
}

impl AddressSpace {
    pub fn new(layout: MemoryLayout) -> Self {
        AddressSpace {
            layout,
            pages: BTreeMap::new(),
        }
    }

    pub fn entry(&self, vpn: Vpn) -> Option<PageEntry> {
        self.pages.get(&vpn).copied()
    }

    pub fn map(&mut self, vpn: Vpn, entry: PageEntry) -> Option<PageEntry> {
        self.pages.insert(vpn, entry)
    }

    pub fn unmap(&mut self, vpn: Vpn) -> Option<PageEntry> {
        self.pages.remove(&vpn)
    }

    pub fn set_writable(&mut self, vpn: Vpn, writable: bool) {
        if let Some(PageEntry::Resident { writable: w, .. }) = self.pages.get_mut(&vpn) {
            *w = writable;
        }
    }

    /// Entries in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (Vpn, PageEntry)> + '_ {
        self.pages.iter().map(|(&vpn, &entry)| (vpn, entry))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn resident_pages(&self) -> usize {
        self.pages
            .values()
            .filter(|e| matches!(e, PageEntry::Resident { .. }))
            .count()
    }

    pub fn swapped_pages(&self) -> usize {
        self.pages.len() - self.resident_pages()
    }

    /// Remove every entry at or above `from` and below `to`.
    pub fn take_range(&mut self, from: Vpn, to: Vpn) -> Vec<PageEntry> {
        let doomed: Vec<Vpn> = self.pages.range(from..to).map(|(&vpn, _)| vpn).collect();
        doomed
            .into_iter()
            .filter_map(|vpn| self.pages.remove(&vpn))
            .collect()
    }

    pub fn take_all(&mut self) -> Vec<PageEntry> {
        core::mem::take(&mut self.pages).into_values().collect()
    }
}
