//! Signals: numbering, per-task state, and delivery at checkpoints
//!
//! Raising a signal only sets its pending bit. Nothing happens to the
//! target until a checkpoint: the scheduler's wake pass for interruptible
//! sleepers, and [`Kernel::return_to_user`](crate::Kernel::return_to_user).

pub mod constants;
pub mod delivery;
pub mod types;

pub use delivery::{SignalError, SignalFrame, SignalOutcome};
pub use types::{default_action, SignalAction, SignalDefaultAction, SignalState};
