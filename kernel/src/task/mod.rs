//! Tasks: descriptors, the fixed task table, and scheduling.

pub mod context;
pub mod descriptor;
pub mod files;
pub mod scheduler;
pub mod table;

use crate::block::cache::BufferId;
use core::fmt;

pub use context::{CpuContext, Switch};
pub use descriptor::Task;
pub use files::{FileHandle, FileTable};
pub use table::{InvariantError, TaskTable};

/// Process identifier. Pid 0 is the root/idle task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const ROOT: Pid = Pid(0);

    pub const fn new(id: u32) -> Self {
        Pid(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Running or eligible to run
    Runnable,
    /// Sleeping; woken by its event or by an unblocked signal
    InterruptibleWait,
    /// Sleeping; only its event wakes it
    UninterruptibleWait,
    /// Stopped by a signal until SIGCONT
    Stopped,
    /// Exited, waiting for the parent to collect the status
    Zombie,
}

/// What a sleeping task waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChannel {
    Buffer(BufferId),
    ChildExit,
    Pause,
    /// Caller-defined event for `sleep_on`/`wake_up`
    Event(u32),
}

/// CPU time in ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskTimes {
    pub utime: u64,
    pub stime: u64,
    /// Accumulated from reaped children
    pub cutime: u64,
    pub cstime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    NoSuchTask(Pid),
    /// The task has already exited
    Zombie(Pid),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::NoSuchTask(pid) => write!(f, "no task with pid {}", pid),
            TaskError::Zombie(pid) => write!(f, "task {} has exited", pid),
        }
    }
}
