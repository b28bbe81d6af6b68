//! Local Resource Scheduler daemon: device state machine,
//! scheduling policy, TLC client and the request dispatcher that ties them
//! together.

pub mod daemon;
pub mod scheduler;
pub mod state;
pub mod tlc_client;

pub use daemon::{LrsConfig, LrsState};
