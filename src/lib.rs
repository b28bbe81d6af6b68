//! Phobos tape object store: TLC library controller and LRS local resource
//! scheduler, sharing the `phobos-*` workspace crates for wire protocol,
//! catalog config, DSS locking and family adapters.

pub mod logging;
pub mod lrs;
pub mod tlc;

pub use lrs::{LrsConfig, LrsState};
pub use tlc::TlcState;
