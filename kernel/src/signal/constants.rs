//! Signal numbers, masks and sigaction flags
//!
//! Numbers follow the i386 Linux ABI so user programs built against it
//! keep working.

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGSTKFLT: u32 = 16;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;
pub const SIGURG: u32 = 23;
pub const SIGXCPU: u32 = 24;
pub const SIGXFSZ: u32 = 25;
pub const SIGVTALRM: u32 = 26;
pub const SIGPROF: u32 = 27;
pub const SIGWINCH: u32 = 28;
pub const SIGIO: u32 = 29;
pub const SIGPWR: u32 = 30;
pub const SIGSYS: u32 = 31;

/// Highest signal number; masks are one `u32` bit per signal
pub const NSIG: u32 = 32;

/// Default action for the signal
pub const SIG_DFL: u32 = 0;
/// Ignore the signal
pub const SIG_IGN: u32 = 1;

// sigprocmask "how" values
pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

/// Reset the handler to SIG_DFL once it has been delivered
pub const SA_ONESHOT: u32 = 0x8000_0000;
/// Don't block the signal while its handler runs
pub const SA_NOMASK: u32 = 0x4000_0000;

/// Bit for `sig` in a pending or blocked mask; 0 outside 1..=NSIG.
#[inline]
pub const fn sig_mask(sig: u32) -> u32 {
    match sig {
        1..=NSIG => 1 << (sig - 1),
        _ => 0,
    }
}

/// SIGKILL and SIGSTOP always take their default action
pub const UNCATCHABLE_SIGNALS: u32 = sig_mask(SIGKILL) | sig_mask(SIGSTOP);

/// Signals whose default action stops the task
pub const STOP_SIGNALS: u32 = sig_mask(SIGSTOP) | sig_mask(SIGTSTP) | sig_mask(SIGTTIN) | sig_mask(SIGTTOU);

/// Signals whose default action terminates with the core flag set
pub const CORE_SIGNALS: u32 = sig_mask(SIGQUIT)
    | sig_mask(SIGILL)
    | sig_mask(SIGTRAP)
    | sig_mask(SIGABRT)
    | sig_mask(SIGBUS)
    | sig_mask(SIGFPE)
    | sig_mask(SIGSEGV)
    | sig_mask(SIGXCPU)
    | sig_mask(SIGXFSZ)
    | sig_mask(SIGSYS);

/// Signals discarded when no handler is installed
pub const DEFAULT_IGNORED_SIGNALS: u32 = sig_mask(SIGCHLD) | sig_mask(SIGURG) | sig_mask(SIGWINCH);

#[inline]
pub const fn is_valid_signal(sig: u32) -> bool {
    sig_mask(sig) != 0
}

#[inline]
pub const fn is_catchable(sig: u32) -> bool {
    UNCATCHABLE_SIGNALS & sig_mask(sig) == 0
}

/// Printable names indexed by signal number; slot 0 is unused.
const NAMES: [&str; NSIG as usize + 1] = [
    "SIG0", "SIGHUP", "SIGINT", "SIGQUIT", "SIGILL", "SIGTRAP", "SIGABRT", "SIGBUS", "SIGFPE",
    "SIGKILL", "SIGUSR1", "SIGSEGV", "SIGUSR2", "SIGPIPE", "SIGALRM", "SIGTERM", "SIGSTKFLT",
    "SIGCHLD", "SIGCONT", "SIGSTOP", "SIGTSTP", "SIGTTIN", "SIGTTOU", "SIGURG", "SIGXCPU",
    "SIGXFSZ", "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGIO", "SIGPWR", "SIGSYS", "SIG32",
];

pub fn signal_name(sig: u32) -> &'static str {
    if is_valid_signal(sig) {
        NAMES[sig as usize]
    } else {
        "UNKNOWN"
    }
}
