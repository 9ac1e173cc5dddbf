//! Process termination for job subprocesses.
//!
//! Job scripts run in their own process group so that a kill reaches the
//! whole tree, not just the immediate shell:
//!
//! - `killer`: the platform capability delivering the soft and hard kill
//! - `wait`: the escalating kill-and-wait state machine

pub mod killer;
pub mod wait;

pub use killer::{new_process_killer, ProcessKiller};
pub use wait::{KillError, KillWaiter};
