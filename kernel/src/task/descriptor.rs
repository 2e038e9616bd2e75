//! Task descriptor
//!
//! Tree links are task-table slot indices: `parent`, the youngest child,
//! and the younger/older siblings of this task under its parent.

use super::{CpuContext, FileTable, Pid, TaskState, TaskTimes, WaitChannel};
use crate::config::TASK_SIZE;
use crate::memory::address_space::{AddressSpace, MemoryLayout};
use crate::signal::SignalState;
use alloc::string::String;

#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) pid: Pid,
    pub(crate) name: String,
    pub(crate) state: TaskState,
    /// Remaining ticks in the current time slice
    pub(crate) counter: u32,
    pub(crate) priority: u32,
    /// Exit status once Zombie; the stop signal while Stopped and unreported
    pub(crate) exit_code: i32,
    pub(crate) parent: Option<usize>,
    pub(crate) youngest_child: Option<usize>,
    pub(crate) younger_sibling: Option<usize>,
    pub(crate) older_sibling: Option<usize>,
    pub(crate) signals: SignalState,
    /// Jiffies at which SIGALRM is due; 0 when no alarm is set
    pub(crate) alarm: u64,
    pub(crate) times: TaskTimes,
    pub(crate) start_time: u64,
    pub(crate) context: CpuContext,
    pub(crate) space: AddressSpace,
    pub(crate) files: FileTable,
    pub(crate) wait_channel: Option<WaitChannel>,
}

impl Task {
    pub(crate) fn root(priority: u32, stack_limit: u32) -> Self {
        Task {
            pid: Pid::ROOT,
            name: String::from("idle"),
            state: TaskState::Runnable,
            counter: priority,
            priority,
            exit_code: 0,
            parent: None,
            youngest_child: None,
            younger_sibling: None,
            older_sibling: None,
            signals: SignalState::new(),
            alarm: 0,
            times: TaskTimes::default(),
            start_time: 0,
            context: CpuContext::default(),
            space: AddressSpace::new(MemoryLayout::empty(stack_limit)),
            files: FileTable::default(),
            wait_channel: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn signals(&self) -> &SignalState {
        &self.signals
    }

    pub fn alarm(&self) -> u64 {
        self.alarm
    }

    pub fn times(&self) -> TaskTimes {
        self.times
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn context(&self) -> &CpuContext {
        &self.context
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut FileTable {
        &mut self.files
    }

    pub fn wait_channel(&self) -> Option<WaitChannel> {
        self.wait_channel
    }

    pub fn is_zombie(&self) -> bool {
        self.state == TaskState::Zombie
    }

    /// Linear base address of the window belonging to table slot `slot`.
    pub fn segment_base(slot: usize) -> u64 {
        slot as u64 * TASK_SIZE as u64
    }
}
