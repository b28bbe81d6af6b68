use serde::{Deserialize, Serialize};

/// Request correlation id. Every response echoes the originating request's
/// id so clients can match responses without additional bookkeeping.
pub type RequestId = u64;

/// The closed set of request kinds the LRS accepts from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Read,
    Write,
    Format,
    Release,
    Notify,
    Monitor,
    Configure,
    Ping,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
