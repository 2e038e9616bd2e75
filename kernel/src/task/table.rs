//! Fixed-capacity task table
//!
//! Slot 0 always holds the root/idle task. Exactly one slot is current.
//! Parent/child relations are slot indices kept consistent by
//! `link_child`/`unlink`.

use super::context::Switch;
use super::{Pid, Task, TaskState, WaitChannel};
use crate::block::cache::{BufferId, Sleeper};
use crate::config::IDLE_SLOT;
use alloc::vec::Vec;
use core::fmt;

/// A broken structural invariant found by `check_invariants`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    RootMissing,
    RootNotRunnable,
    CurrentEmpty(usize),
    ZombieCurrent(Pid),
    DuplicatePid(Pid),
    BrokenLink { slot: usize },
    RefcountMismatch { frame: u32, refcount: u16, mappings: u16 },
    FrameCountMismatch { free: usize, used: usize, total: usize },
    SwapSlotMismatch { slot: u32 },
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantError::RootMissing => write!(f, "root task missing from slot 0"),
            InvariantError::RootNotRunnable => write!(f, "root task is not runnable"),
            InvariantError::CurrentEmpty(slot) => write!(f, "current slot {} is empty", slot),
            InvariantError::ZombieCurrent(pid) => write!(f, "zombie {} is current", pid),
            InvariantError::DuplicatePid(pid) => write!(f, "pid {} used twice", pid),
            InvariantError::BrokenLink { slot } => write!(f, "task tree links of slot {} are inconsistent", slot),
            InvariantError::RefcountMismatch { frame, refcount, mappings } => write!(
                f,
                "frame {} has refcount {} but {} mappings",
                frame, refcount, mappings
            ),
            InvariantError::FrameCountMismatch { free, used, total } => {
                write!(f, "{} free + {} used frames != {} total", free, used, total)
            }
            InvariantError::SwapSlotMismatch { slot } => write!(f, "swap slot {} ownership is inconsistent", slot),
        }
    }
}

pub struct TaskTable {
    slots: Vec<Option<Task>>,
    current: usize,
    last_pid: u32,
    switches: u64,
}

impl TaskTable {
    pub(crate) fn new(capacity: usize, root: Task) -> Self {
        let mut slots: Vec<Option<Task>> = (0..capacity).map(|_| None).collect();
        slots[IDLE_SLOT] = Some(root);
        TaskTable {
            slots,
            current: IDLE_SLOT,
            last_pid: 0,
            switches: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots, zombies included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn current_pid(&self) -> Pid {
        self.current().pid
    }

    pub fn current(&self) -> &Task {
        match &self.slots[self.current] {
            Some(task) => task,
            None => {
                log::error!("current slot {} is empty", self.current);
                panic!("no current task");
            }
        }
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }

    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map_or(false, |t| t.pid == pid))
    }

    pub fn get(&self, pid: Pid) -> Option<&Task> {
        self.slot_of(pid).and_then(|slot| self.task(slot))
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        let slot = self.slot_of(pid)?;
        self.task_mut(slot)
    }

    pub fn task(&self, slot: usize) -> Option<&Task> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn task_mut(&mut self, slot: usize) -> Option<&mut Task> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Occupied slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Task)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, t)| t.as_ref().map(|t| (slot, t)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Task)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, t)| t.as_mut().map(|t| (slot, t)))
    }

    pub(crate) fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Next unused pid, counting up from the last one handed out.
    pub(crate) fn next_pid(&mut self) -> Pid {
        loop {
            self.last_pid = if self.last_pid >= i32::MAX as u32 { 1 } else { self.last_pid + 1 };
            let candidate = Pid::new(self.last_pid);
            if self.slot_of(candidate).is_none() {
                return candidate;
            }
        }
    }

    pub(crate) fn insert(&mut self, slot: usize, task: Task) {
        if self.slots[slot].is_some() {
            log::error!("insert into occupied task slot {}", slot);
            panic!("task slot {} in use", slot);
        }
        self.slots[slot] = Some(task);
    }

    pub(crate) fn remove(&mut self, slot: usize) -> Option<Task> {
        if slot == IDLE_SLOT {
            log::error!("attempt to remove the root task");
            panic!("root task cannot be removed");
        }
        self.slots[slot].take()
    }

    /// Children of `slot`, youngest first.
    pub fn children(&self, slot: usize) -> Vec<usize> {
        let mut children = Vec::new();
        let mut next = self.task(slot).and_then(|t| t.youngest_child);
        while let Some(child) = next {
            children.push(child);
            next = self.task(child).and_then(|t| t.older_sibling);
        }
        children
    }

    /// Make `child` the youngest child of `parent`.
    pub(crate) fn link_child(&mut self, parent: usize, child: usize) {
        let older = self.task(parent).and_then(|t| t.youngest_child);
        if let Some(older) = older {
            if let Some(t) = self.task_mut(older) {
                t.younger_sibling = Some(child);
            }
        }
        if let Some(t) = self.task_mut(child) {
            t.parent = Some(parent);
            t.older_sibling = older;
            t.younger_sibling = None;
        }
        if let Some(t) = self.task_mut(parent) {
            t.youngest_child = Some(child);
        }
    }

    /// Detach `child` from its parent's child list.
    pub(crate) fn unlink(&mut self, child: usize) {
        let (parent, older, younger) = match self.task(child) {
            Some(t) => (t.parent, t.older_sibling, t.younger_sibling),
            None => return,
        };
        if let Some(older) = older {
            if let Some(t) = self.task_mut(older) {
                t.younger_sibling = younger;
            }
        }
        match younger {
            Some(younger) => {
                if let Some(t) = self.task_mut(younger) {
                    t.older_sibling = older;
                }
            }
            None => {
                if let Some(t) = parent.and_then(|p| self.task_mut(p)) {
                    t.youngest_child = older;
                }
            }
        }
        if let Some(t) = self.task_mut(child) {
            t.parent = None;
            t.older_sibling = None;
            t.younger_sibling = None;
        }
    }

    /// Put the current task to sleep on `channel`. The idle task never
    /// sleeps; `None` is returned for it.
    pub fn sleep_on(&mut self, channel: WaitChannel, interruptible: bool) -> Option<Pid> {
        if self.current == IDLE_SLOT {
            return None;
        }
        let slot = self.current;
        let task = self.task_mut(slot)?;
        task.state = if interruptible {
            TaskState::InterruptibleWait
        } else {
            TaskState::UninterruptibleWait
        };
        task.wait_channel = Some(channel);
        Some(task.pid)
    }

    /// Make every task sleeping on `channel` runnable, in slot order.
    pub fn wake_up(&mut self, channel: WaitChannel) -> usize {
        let mut woken = 0;
        for (_, task) in self.iter_mut() {
            if task.wait_channel == Some(channel) && is_sleeping(task.state) {
                task.state = TaskState::Runnable;
                task.wait_channel = None;
                woken += 1;
            }
        }
        woken
    }

    /// Make one sleeping task runnable, whatever it waits for.
    pub fn wake(&mut self, pid: Pid) -> bool {
        match self.get_mut(pid) {
            Some(task) if is_sleeping(task.state) => {
                task.state = TaskState::Runnable;
                task.wait_channel = None;
                true
            }
            _ => false,
        }
    }

    /// Make `slot` current. Saving and restoring registers is the caller's
    /// business; only the bookkeeping happens here.
    pub(crate) fn switch_to(&mut self, slot: usize) -> Switch {
        let from = self.current_pid();
        if slot == self.current {
            return Switch { from, to: from };
        }
        let to = match self.task(slot) {
            Some(task) => task.pid,
            None => {
                log::error!("switch to empty slot {}", slot);
                panic!("switch to empty task slot");
            }
        };
        self.current = slot;
        self.switches += 1;
        log::debug!("switch {} -> {}", from, to);
        Switch { from, to }
    }

    /// Structural checks over the table alone.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        let root = self.task(IDLE_SLOT).ok_or(InvariantError::RootMissing)?;
        if root.pid != Pid::ROOT || root.state != TaskState::Runnable {
            return Err(InvariantError::RootNotRunnable);
        }
        let current = self
            .task(self.current)
            .ok_or(InvariantError::CurrentEmpty(self.current))?;
        if current.state == TaskState::Zombie {
            return Err(InvariantError::ZombieCurrent(current.pid));
        }

        for (slot, task) in self.iter() {
            if self.iter().filter(|(_, t)| t.pid == task.pid).count() > 1 {
                return Err(InvariantError::DuplicatePid(task.pid));
            }
            let broken = InvariantError::BrokenLink { slot };
            if let Some(parent) = task.parent {
                if !self.children(parent).contains(&slot) {
                    return Err(broken);
                }
            } else if slot != IDLE_SLOT {
                return Err(broken);
            }
            for child in self.children(slot) {
                if self.task(child).and_then(|t| t.parent) != Some(slot) {
                    return Err(broken);
                }
            }
            if let Some(younger) = task.younger_sibling {
                if self.task(younger).and_then(|t| t.older_sibling) != Some(slot) {
                    return Err(broken);
                }
            }
        }
        Ok(())
    }
}

fn is_sleeping(state: TaskState) -> bool {
    matches!(
        state,
        TaskState::InterruptibleWait | TaskState::UninterruptibleWait
    )
}

impl Sleeper for TaskTable {
    fn sleep_on_buffer(&mut self, buffer: BufferId) -> Option<Pid> {
        self.sleep_on(WaitChannel::Buffer(buffer), false)
    }

    fn wake(&mut self, pid: Pid) {
        TaskTable::wake(self, pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(n: usize) -> TaskTable {
        let mut table = TaskTable::new(8, Task::root(15, 0x10000));
        for _ in 0..n {
            let slot = table.find_free_slot().unwrap();
            let mut task = Task::root(15, 0x10000);
            task.pid = table.next_pid();
            table.insert(slot, task);
            table.link_child(IDLE_SLOT, slot);
        }
        table
    }

    #[test]
    fn children_are_listed_youngest_first() {
        let table = table_with(3);
        assert_eq!(table.children(IDLE_SLOT), vec![3, 2, 1]);
        assert_eq!(table.check_invariants(), Ok(()));
    }

    #[test]
    fn unlink_middle_child_keeps_siblings_consistent() {
        let mut table = table_with(3);
        table.unlink(2);
        assert_eq!(table.children(IDLE_SLOT), vec![3, 1]);
        table.remove(2);
        assert_eq!(table.check_invariants(), Ok(()));
        table.unlink(3);
        assert_eq!(table.children(IDLE_SLOT), vec![1]);
    }

    #[test]
    fn pids_skip_ones_in_use() {
        let mut table = table_with(2);
        table.last_pid = 0;
        assert_eq!(table.next_pid(), Pid::new(3));
    }

    #[test]
    fn idle_never_sleeps() {
        let mut table = table_with(1);
        assert_eq!(table.sleep_on(WaitChannel::Event(1), true), None);
        table.switch_to(1);
        assert_eq!(table.sleep_on(WaitChannel::Event(1), true), Some(Pid::new(1)));
        assert_eq!(table.wake_up(WaitChannel::Event(2)), 0);
        assert_eq!(table.wake_up(WaitChannel::Event(1)), 1);
        assert_eq!(table.current().state(), TaskState::Runnable);
    }
}
