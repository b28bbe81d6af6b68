//! Device/medium adapters: a small trait polymorphic over
//! [`ResourceFamily`], one implementation per family.
//!
//! Disk management (`api2::node::disks::*`-style code) shells out to
//! `mount`/`umount`/mkfs-style binaries via `proxmox_sys::command::run_command`
//! rather than linking a mount(2) wrapper -- the same idiom is used here for
//! the tape family's LTFS mount/format commands. `device_query` for tape
//! drives reuses the changer's raw SCSI INQUIRY bindings (phobos-scsi).

use std::time::Instant;

use anyhow::Error;
use serde::{Deserialize, Serialize};
use serde_json::json;

use phobos_api_types::ResourceFamily;

mod directory;
mod rados_pool;
mod tape;

pub use directory::DirectoryAdapter;
pub use rados_pool::RadosPoolAdapter;
pub use tape::TapeAdapter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy)]
pub struct FsUsage {
    pub bytes_used: u64,
    pub bytes_available: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("operation not supported for this family")]
    Unsupported,
    #[error("resource is busy")]
    Busy,
    #[error("not mounted")]
    NotMounted,
    #[error("bad label: {0}")]
    BadLabel(String),
}

impl From<Error> for AdapterError {
    fn from(err: Error) -> Self {
        AdapterError::Io(err.to_string())
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        AdapterError::Io(err.to_string())
    }
}

/// Family-polymorphic device/medium operations. `Send` so the LRS
/// can run adapter calls on a blocking-task pool (`tokio::task::spawn_blocking`)
/// without fighting the type system -- adapters shell out synchronously and
/// must never block the async reactor.
pub trait FamilyAdapter: Send {
    /// Identify the physical drive/pool behind `path`. Pool families accept
    /// the name as-is, without realpath resolution.
    fn device_query(&self, path: &str) -> Result<DeviceInfo, AdapterError>;
    fn fs_mount(&self, device_path: &str, label: &str) -> Result<String, AdapterError>;
    fn fs_umount(&self, device_path: &str, root_path: &str) -> Result<(), AdapterError>;
    fn fs_format(&self, device_path: &str, label: &str) -> Result<(), AdapterError>;
    fn fs_df(&self, root_path: &str) -> Result<FsUsage, AdapterError>;
    /// Flush without unmounting.
    fn fs_release(&self, root_path: &str) -> Result<(), AdapterError>;
}

pub fn adapter_for(family: ResourceFamily) -> Box<dyn FamilyAdapter> {
    match family {
        ResourceFamily::Tape => Box::new(TapeAdapter),
        ResourceFamily::Directory => Box::new(DirectoryAdapter),
        ResourceFamily::RadosPool => Box::new(RadosPoolAdapter),
    }
}

/// Every adapter call emits a JSON-structured log record to the catalog log
/// channel, tagged with operation type and timing.
pub(crate) fn log_op<T, E: std::fmt::Display>(family: ResourceFamily, op: &str, start: Instant, result: &Result<T, E>) {
    let record = json!({
        "channel": "catalog",
        "family": family.as_str(),
        "op": op,
        "elapsed_ms": start.elapsed().as_millis(),
        "ok": result.is_ok(),
        "error": result.as_ref().err().map(|e| e.to_string()),
    });
    log::info!("{}", record);
}
