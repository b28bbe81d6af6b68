use std::process::Command;
use std::time::Instant;

use anyhow::format_err;

use phobos_api_types::ResourceFamily;

use crate::{log_op, AdapterError, DeviceInfo, FamilyAdapter, FsUsage};

/// A Ceph RADOS pool. The pool name is used as-is, without realpath
/// resolution -- there is no device node, only a name the `rados` CLI
/// already understands. Mount/umount are no-ops: objects are written
/// straight into the pool, there is no local filesystem to attach.
pub struct RadosPoolAdapter;

const RADOS_BIN: &str = "rados";

impl FamilyAdapter for RadosPoolAdapter {
    fn device_query(&self, path: &str) -> Result<DeviceInfo, AdapterError> {
        let start = Instant::now();
        let result = (|| -> Result<DeviceInfo, AdapterError> {
            let mut command = Command::new(RADOS_BIN);
            command.args(["df", "--pool", path, "--format", "json"]);
            proxmox_sys::command::run_command(command, None).map_err(|err| AdapterError::Io(err.to_string()))?;
            Ok(DeviceInfo {
                serial: path.to_string(),
                model: "rados-pool".to_string(),
            })
        })();
        log_op(ResourceFamily::RadosPool, "device_query", start, &result);
        result
    }

    fn fs_mount(&self, device_path: &str, _label: &str) -> Result<String, AdapterError> {
        Ok(format!("rados://{device_path}"))
    }

    fn fs_umount(&self, _device_path: &str, _root_path: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    fn fs_format(&self, device_path: &str, label: &str) -> Result<(), AdapterError> {
        let start = Instant::now();
        let result = (|| -> Result<(), AdapterError> {
            if label.trim().is_empty() {
                return Err(AdapterError::BadLabel("label must not be empty".to_string()));
            }
            let mut command = Command::new(RADOS_BIN);
            command.args(["-p", device_path, "setxattr", "phobos-label", "label", label]);
            proxmox_sys::command::run_command(command, None).map_err(|err| AdapterError::Io(err.to_string()))?;
            Ok(())
        })();
        log_op(ResourceFamily::RadosPool, "fs_format", start, &result);
        result
    }

    fn fs_df(&self, root_path: &str) -> Result<FsUsage, AdapterError> {
        let start = Instant::now();
        let pool = root_path.strip_prefix("rados://").unwrap_or(root_path);
        let result = pool_df(pool).map_err(|err| AdapterError::Io(err.to_string()));
        log_op(ResourceFamily::RadosPool, "fs_df", start, &result);
        result
    }

    fn fs_release(&self, _root_path: &str) -> Result<(), AdapterError> {
        Ok(())
    }
}

fn pool_df(pool: &str) -> Result<FsUsage, anyhow::Error> {
    let mut command = Command::new(RADOS_BIN);
    command.args(["df", "--pool", pool, "--format", "json"]);
    let output = proxmox_sys::command::run_command(command, None).map_err(|err| format_err!("rados df failed: {err}"))?;

    let parsed: serde_json::Value = serde_json::from_str(&output).map_err(|err| format_err!("rados df produced invalid JSON: {err}"))?;
    let pool_stats = parsed["pools"]
        .as_array()
        .and_then(|pools| pools.iter().find(|entry| entry["name"] == pool))
        .ok_or_else(|| format_err!("pool '{pool}' not present in rados df output"))?;

    let bytes_used = pool_stats["size_bytes"].as_u64().unwrap_or(0);
    let bytes_available = parsed["stats"]["total_avail_bytes"].as_u64().unwrap_or(0);

    Ok(FsUsage { bytes_used, bytes_available })
}
