//! Signal raise and delivery

use super::constants::*;
use super::types::{default_action, SignalAction, SignalDefaultAction};
use crate::config::IDLE_SLOT;
use crate::kernel::Kernel;
use crate::task::{CpuContext, Pid, TaskState, WaitChannel};
use core::fmt;

/// Bytes pushed on the user stack for a handler frame.
pub const SIGNAL_FRAME_SIZE: u32 = 8 * 4;

/// State saved when a user handler is entered, restored by `sigreturn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFrame {
    pub signal: u32,
    pub handler: u32,
    pub restorer: u32,
    pub saved_context: CpuContext,
    pub saved_blocked: u32,
}

/// What a checkpoint did with the next deliverable signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The task's context now enters a user handler
    Handler(SignalFrame),
    Stopped(u32),
    Terminated { signal: u32, code: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    NoSuchTask(Pid),
    InvalidSignal(u32),
    /// SIGKILL and SIGSTOP keep their default action
    Uncatchable(u32),
    InvalidArgument,
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::NoSuchTask(pid) => write!(f, "no task with pid {}", pid),
            SignalError::InvalidSignal(sig) => write!(f, "invalid signal {}", sig),
            SignalError::Uncatchable(sig) => write!(f, "{} cannot be caught or ignored", signal_name(*sig)),
            SignalError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

impl Kernel {
    /// Raise `sig` on `pid`. Only SIGCONT and SIGKILL act immediately, by
    /// resuming a stopped target.
    pub fn kill(&mut self, pid: Pid, sig: u32) -> Result<(), SignalError> {
        if !is_valid_signal(sig) {
            return Err(SignalError::InvalidSignal(sig));
        }
        let task = self.tasks.get_mut(pid).ok_or(SignalError::NoSuchTask(pid))?;
        if task.state == TaskState::Zombie {
            return Ok(());
        }
        if sig == SIGCONT {
            task.signals.pending &= !STOP_SIGNALS;
        } else if STOP_SIGNALS & sig_mask(sig) != 0 {
            task.signals.clear_pending(SIGCONT);
        }
        task.signals.set_pending(sig);
        if (sig == SIGCONT || sig == SIGKILL) && task.state == TaskState::Stopped {
            task.state = TaskState::Runnable;
            task.exit_code = 0;
            log::debug!("task {} continued by {}", pid, signal_name(sig));
        }
        log::trace!("{} raised on task {}", signal_name(sig), pid);
        Ok(())
    }

    /// Raise a fault signal that the task cannot block or ignore.
    pub(crate) fn force_signal(&mut self, pid: Pid, sig: u32) {
        if let Some(task) = self.tasks.get_mut(pid) {
            task.signals.unblock_signals(sig_mask(sig));
            if task.signals.get_handler(sig).is_ignore() {
                task.signals.set_handler(sig, SignalAction::default());
            }
            task.signals.set_pending(sig);
            log::debug!("forced {} on task {}", signal_name(sig), pid);
        }
    }

    /// Checkpoint on the way back to user mode: act on pending signals.
    ///
    /// Ignored signals are consumed silently. The root task never stops or
    /// terminates, so default stop and terminate actions are dropped for it. Returns the first signal that
    /// changed the task's course, or `None` when nothing was deliverable.
    pub fn return_to_user(&mut self, pid: Pid) -> Option<SignalOutcome> {
        loop {
            let slot = self.tasks.slot_of(pid)?;
            let task = self.tasks.task_mut(slot)?;
            if task.state == TaskState::Zombie {
                return None;
            }
            let sig = task.signals.next_deliverable_signal()?;
            task.signals.clear_pending(sig);
            let action = task.signals.get_handler(sig);

            if action.is_ignore() && is_catchable(sig) {
                continue;
            }
            if action.is_user_handler() && is_catchable(sig) {
                let frame = SignalFrame {
                    signal: sig,
                    handler: action.handler,
                    restorer: action.restorer,
                    saved_context: task.context,
                    saved_blocked: task.signals.blocked,
                };
                task.context.eip = action.handler;
                task.context.esp = task.context.esp.wrapping_sub(SIGNAL_FRAME_SIZE);
                if action.flags & SA_ONESHOT != 0 {
                    task.signals.set_handler(sig, SignalAction::default());
                }
                let mut mask = action.mask;
                if action.flags & SA_NOMASK == 0 {
                    mask |= sig_mask(sig);
                }
                task.signals.block_signals(mask);
                log::debug!("task {} enters handler {:#x} for {}", pid, action.handler, signal_name(sig));
                return Some(SignalOutcome::Handler(frame));
            }

            match default_action(sig) {
                SignalDefaultAction::Ignore | SignalDefaultAction::Continue => continue,
                _ if slot == IDLE_SLOT => {
                    log::warn!("root task ignores {}", signal_name(sig));
                    continue;
                }
                SignalDefaultAction::Stop => {
                    task.state = TaskState::Stopped;
                    task.exit_code = sig as i32;
                    let parent = task.parent;
                    log::info!("task {} stopped by {}", pid, signal_name(sig));
                    if let Some(parent) = parent {
                        self.notify_parent(parent);
                    }
                    if slot == self.tasks.current_slot() {
                        self.schedule();
                    }
                    return Some(SignalOutcome::Stopped(sig));
                }
                SignalDefaultAction::Terminate | SignalDefaultAction::CoreDump => {
                    let code = if default_action(sig) == SignalDefaultAction::CoreDump {
                        -((sig | 0x80) as i32)
                    } else {
                        -(sig as i32)
                    };
                    log::info!("task {} killed by {} (code {})", pid, signal_name(sig), code);
                    if self.exit(pid, code).is_err() {
                        return None;
                    }
                    return Some(SignalOutcome::Terminated { signal: sig, code });
                }
            }
        }
    }

    /// Return from a handler: restore the interrupted context and mask.
    pub fn sigreturn(&mut self, pid: Pid, frame: &SignalFrame) -> Result<(), SignalError> {
        let task = self.tasks.get_mut(pid).ok_or(SignalError::NoSuchTask(pid))?;
        task.context = frame.saved_context;
        task.signals.set_blocked(frame.saved_blocked);
        Ok(())
    }

    /// Install a handler; returns the previous one.
    pub fn sigaction(&mut self, pid: Pid, sig: u32, action: SignalAction) -> Result<SignalAction, SignalError> {
        if !is_valid_signal(sig) {
            return Err(SignalError::InvalidSignal(sig));
        }
        if !is_catchable(sig) {
            return Err(SignalError::Uncatchable(sig));
        }
        let task = self.tasks.get_mut(pid).ok_or(SignalError::NoSuchTask(pid))?;
        let old = task.signals.get_handler(sig);
        task.signals.set_handler(sig, action);
        if action.is_ignore() {
            task.signals.clear_pending(sig);
        }
        Ok(old)
    }

    /// Change the blocked mask; returns the previous mask.
    pub fn sigprocmask(&mut self, pid: Pid, how: i32, set: u32) -> Result<u32, SignalError> {
        let task = self.tasks.get_mut(pid).ok_or(SignalError::NoSuchTask(pid))?;
        let old = task.signals.blocked;
        match how {
            SIG_BLOCK => task.signals.block_signals(set),
            SIG_UNBLOCK => task.signals.unblock_signals(set),
            SIG_SETMASK => task.signals.set_blocked(set),
            _ => return Err(SignalError::InvalidArgument),
        }
        Ok(old)
    }

    /// SIGCHLD to the task in `parent_slot`, waking it if it waits for children.
    pub(crate) fn notify_parent(&mut self, parent_slot: usize) {
        if let Some(parent) = self.tasks.task_mut(parent_slot) {
            parent.signals.set_pending(SIGCHLD);
            if parent.wait_channel == Some(WaitChannel::ChildExit)
                && parent.state == TaskState::InterruptibleWait
            {
                parent.state = TaskState::Runnable;
                parent.wait_channel = None;
            }
        }
    }
}
