//! Per-task signal state and default actions

use super::constants::*;

/// What happens to a signal that reaches a task with no handler installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDefaultAction {
    Terminate,
    Ignore,
    /// Terminate, flagging a core dump in the exit code
    CoreDump,
    Stop,
    Continue,
}

pub fn default_action(sig: u32) -> SignalDefaultAction {
    let bit = sig_mask(sig);
    if sig == SIGCONT {
        SignalDefaultAction::Continue
    } else if STOP_SIGNALS & bit != 0 {
        SignalDefaultAction::Stop
    } else if CORE_SIGNALS & bit != 0 {
        SignalDefaultAction::CoreDump
    } else if DEFAULT_IGNORED_SIGNALS & bit != 0 {
        SignalDefaultAction::Ignore
    } else {
        SignalDefaultAction::Terminate
    }
}

/// Handler registration for one signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalAction {
    /// SIG_DFL, SIG_IGN, or a user address
    pub handler: u32,
    /// Extra signals blocked while the handler runs
    pub mask: u32,
    pub flags: u32,
    /// User address the handler returns through
    pub restorer: u32,
}

impl Default for SignalAction {
    fn default() -> Self {
        SignalAction {
            handler: SIG_DFL,
            mask: 0,
            flags: 0,
            restorer: 0,
        }
    }
}

impl SignalAction {
    pub const fn handler(handler: u32) -> Self {
        SignalAction {
            handler,
            mask: 0,
            flags: 0,
            restorer: 0,
        }
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        self.handler == SIG_DFL
    }

    #[inline]
    pub fn is_ignore(&self) -> bool {
        self.handler == SIG_IGN
    }

    #[inline]
    pub fn is_user_handler(&self) -> bool {
        self.handler > SIG_IGN
    }
}

/// Per-task signal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalState {
    /// Raised but not yet acted on
    pub pending: u32,
    pub blocked: u32,
    handlers: [SignalAction; NSIG as usize],
}

impl Default for SignalState {
    fn default() -> Self {
        SignalState {
            pending: 0,
            blocked: 0,
            handlers: [SignalAction::default(); NSIG as usize],
        }
    }
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn has_deliverable_signals(&self) -> bool {
        (self.pending & !self.blocked) != 0
    }

    /// Lowest-numbered pending, unblocked signal
    pub fn next_deliverable_signal(&self) -> Option<u32> {
        let deliverable = self.pending & !self.blocked;
        if deliverable == 0 {
            return None;
        }
        Some(deliverable.trailing_zeros() + 1)
    }

    #[inline]
    pub fn set_pending(&mut self, sig: u32) {
        self.pending |= sig_mask(sig);
    }

    #[inline]
    pub fn clear_pending(&mut self, sig: u32) {
        self.pending &= !sig_mask(sig);
    }

    #[inline]
    pub fn is_pending(&self, sig: u32) -> bool {
        (self.pending & sig_mask(sig)) != 0
    }

    #[inline]
    pub fn is_blocked(&self, sig: u32) -> bool {
        (self.blocked & sig_mask(sig)) != 0
    }

    /// Handler for `sig`; invalid numbers read as SIG_DFL
    pub fn get_handler(&self, sig: u32) -> SignalAction {
        if is_valid_signal(sig) {
            self.handlers[(sig - 1) as usize]
        } else {
            SignalAction::default()
        }
    }

    /// Does nothing for invalid signal numbers
    pub fn set_handler(&mut self, sig: u32, action: SignalAction) {
        if is_valid_signal(sig) {
            self.handlers[(sig - 1) as usize] = action;
        }
    }

    #[inline]
    pub fn block_signals(&mut self, mask: u32) {
        self.blocked |= mask & !UNCATCHABLE_SIGNALS;
    }

    #[inline]
    pub fn unblock_signals(&mut self, mask: u32) {
        self.blocked &= !mask;
    }

    #[inline]
    pub fn set_blocked(&mut self, mask: u32) {
        self.blocked = mask & !UNCATCHABLE_SIGNALS;
    }

    /// Child copy: handlers and mask are inherited, pending signals are not
    pub fn fork(&self) -> Self {
        SignalState {
            pending: 0,
            blocked: self.blocked,
            handlers: self.handlers,
        }
    }

    /// Caught signals revert to SIG_DFL on exec; ignored ones stay ignored
    pub fn exec_reset(&mut self) {
        for handler in self.handlers.iter_mut() {
            if handler.is_user_handler() {
                *handler = SignalAction::default();
            }
        }
    }
}
