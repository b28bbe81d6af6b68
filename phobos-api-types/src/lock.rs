use serde::{Deserialize, Serialize};

use proxmox_schema::api;

/// DSS lock namespace. A lock is exclusive within `(type, id)`.
#[api]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Device,
    Media,
    MediaUpdate,
    Object,
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LockType::Device => "device",
            LockType::Media => "media",
            LockType::MediaUpdate => "media_update",
            LockType::Object => "object",
        };
        f.write_str(s)
    }
}

/// A single distributed lock record, as persisted by the DSS lock store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DssLock {
    pub lock_type: LockType,
    pub id: String,
    pub hostname: String,
    pub owner_pid: u32,
    /// Epoch seconds the lock was created or last refreshed.
    pub timestamp: i64,
}

impl DssLock {
    pub fn key(lock_type: LockType, id: &str) -> String {
        format!("{lock_type}:{id}")
    }
}
