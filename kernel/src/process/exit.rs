//! Task exit and the parent's wait.

use crate::config::IDLE_SLOT;
use crate::kernel::Kernel;
use crate::signal::constants::SIGCHLD;
use crate::task::{Pid, TaskError, TaskState, WaitChannel};
use core::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Return `WaitStatus::NoHang` instead of sleeping
    pub nohang: bool,
    /// Also report children stopped by a signal
    pub untraced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// A zombie child was reaped
    Exited { pid: Pid, code: i32 },
    Stopped { pid: Pid, signal: u32 },
    /// Matching children exist but none has anything to report
    NoHang,
    /// The caller now sleeps on `WaitChannel::ChildExit`; call again once woken
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    NoSuchTask(Pid),
    /// No child matches the request
    NoChildren,
    /// A signal other than SIGCHLD is pending
    Interrupted,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::NoSuchTask(pid) => write!(f, "no task with pid {}", pid),
            WaitError::NoChildren => write!(f, "no child processes"),
            WaitError::Interrupted => write!(f, "interrupted by signal"),
        }
    }
}

impl Kernel {
    /// Terminate `pid` with `code`. Its pages and files are released at
    /// once; the descriptor stays as a zombie until the parent waits.
    pub fn exit(&mut self, pid: Pid, code: i32) -> Result<(), TaskError> {
        let slot = self.live_slot(pid)?;
        if slot == IDLE_SLOT {
            log::error!("task 0 trying to exit (code {})", code);
            panic!("root task cannot exit");
        }

        let (entries, parent) = match self.tasks.task_mut(slot) {
            Some(task) => {
                task.files.close_all();
                task.alarm = 0;
                (task.space.take_all(), task.parent)
            }
            None => return Err(TaskError::NoSuchTask(pid)),
        };
        self.release_pages(entries);

        let heir = parent.unwrap_or(IDLE_SLOT);
        for child in self.tasks.children(slot) {
            self.tasks.unlink(child);
            self.tasks.link_child(heir, child);
            if self.tasks.task(child).map_or(false, |t| t.is_zombie()) {
                self.notify_parent(heir);
            }
        }

        if let Some(task) = self.tasks.task_mut(slot) {
            task.state = TaskState::Zombie;
            task.exit_code = code;
            task.wait_channel = None;
        }
        self.notify_parent(heir);
        log::info!("task {} exited with code {}", pid, code);

        if slot == self.tasks.current_slot() {
            self.schedule();
        }
        Ok(())
    }

    /// Collect a child of `pid`: any child, or only `target`.
    ///
    /// A zombie is reaped and its times are added to the caller's child
    /// times. With `untraced`, a stopped child is reported once. Otherwise
    /// the caller sleeps until a child changes state, unless it is the root
    /// task, which never sleeps.
    pub fn wait(&mut self, pid: Pid, target: Option<Pid>, options: WaitOptions) -> Result<WaitStatus, WaitError> {
        let slot = self.live_slot(pid).map_err(|_| WaitError::NoSuchTask(pid))?;
        let children: alloc::vec::Vec<usize> = self
            .tasks
            .children(slot)
            .into_iter()
            .filter(|&c| target.map_or(true, |t| self.tasks.task(c).map_or(false, |task| task.pid == t)))
            .collect();
        if children.is_empty() {
            return Err(WaitError::NoChildren);
        }

        for child in children {
            let (child_pid, state, exit_code) = match self.tasks.task(child) {
                Some(t) => (t.pid, t.state, t.exit_code),
                None => continue,
            };
            match state {
                TaskState::Zombie => return Ok(self.reap(slot, child, child_pid, exit_code)),
                TaskState::Stopped if options.untraced && exit_code != 0 => {
                    if let Some(t) = self.tasks.task_mut(child) {
                        t.exit_code = 0;
                    }
                    return Ok(WaitStatus::Stopped {
                        pid: child_pid,
                        signal: exit_code as u32,
                    });
                }
                _ => {}
            }
        }

        if options.nohang {
            return Ok(WaitStatus::NoHang);
        }
        let task = match self.tasks.task_mut(slot) {
            Some(task) => task,
            None => return Err(WaitError::NoSuchTask(pid)),
        };
        task.signals.clear_pending(SIGCHLD);
        if task.signals.has_deliverable_signals() {
            return Err(WaitError::Interrupted);
        }
        if slot == IDLE_SLOT {
            return Ok(WaitStatus::Blocked);
        }
        task.state = TaskState::InterruptibleWait;
        task.wait_channel = Some(WaitChannel::ChildExit);
        if slot == self.tasks.current_slot() {
            self.schedule();
        }
        Ok(WaitStatus::Blocked)
    }

    fn reap(&mut self, parent: usize, child: usize, pid: Pid, code: i32) -> WaitStatus {
        self.tasks.unlink(child);
        if let Some(zombie) = self.tasks.remove(child) {
            if let Some(t) = self.tasks.task_mut(parent) {
                t.times.cutime += zombie.times.utime + zombie.times.cutime;
                t.times.cstime += zombie.times.stime + zombie.times.cstime;
            }
        }
        log::debug!("reaped task {} (code {})", pid, code);
        WaitStatus::Exited { pid, code }
    }
}
