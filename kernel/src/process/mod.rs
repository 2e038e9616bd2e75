//! Process lifecycle: fork, exec, exit and wait
//!
//! These are `impl Kernel` blocks; the task table itself lives in
//! [`crate::task`].

pub mod exec;
pub mod exit;
pub mod fork;

pub use exec::{ExecError, ProgramImage};
pub use exit::{WaitError, WaitOptions, WaitStatus};
pub use fork::ForkError;
