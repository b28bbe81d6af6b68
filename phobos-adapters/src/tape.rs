use std::fs::OpenOptions;
use std::process::Command;
use std::time::Instant;

use anyhow::format_err;

use phobos_scsi::{scsi_inquiry_unit_serial, sgutils::scsi_inquiry};

use crate::{log_op, AdapterError, DeviceInfo, FamilyAdapter, FsUsage};
use phobos_api_types::ResourceFamily;

/// LTFS-backed tape medium. Mount/format/umount shell out to the `ltfs`
/// tool family the same way disk management elsewhere shells out to
/// `mount`/`mkfs.*` rather than linking libmount.
pub struct TapeAdapter;

const LTFS_BIN: &str = "ltfs";
const MKLTFS_BIN: &str = "mkltfs";
const FUSERMOUNT_BIN: &str = "fusermount";

impl FamilyAdapter for TapeAdapter {
    fn device_query(&self, path: &str) -> Result<DeviceInfo, AdapterError> {
        let start = Instant::now();
        let result = (|| -> Result<DeviceInfo, AdapterError> {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            let inquiry = scsi_inquiry(&mut file).map_err(|err| AdapterError::Io(err.to_string()))?;
            let serial = scsi_inquiry_unit_serial(&mut file).map_err(|err| AdapterError::Io(err.to_string()))?;
            Ok(DeviceInfo {
                serial,
                model: format!("{} {}", inquiry.vendor, inquiry.product).trim().to_string(),
            })
        })();
        log_op(ResourceFamily::Tape, "device_query", start, &result);
        result
    }

    fn fs_mount(&self, device_path: &str, label: &str) -> Result<String, AdapterError> {
        let start = Instant::now();
        let root_path = format!("/mnt/phobos/{}", label);
        let result = (|| -> Result<String, AdapterError> {
            std::fs::create_dir_all(&root_path)?;

            let mut command = Command::new(LTFS_BIN);
            command.args(["-o", &format!("devname={device_path}"), &root_path]);
            proxmox_sys::command::run_command(command, None).map_err(|err| AdapterError::Io(err.to_string()))?;

            Ok(root_path.clone())
        })();
        log_op(ResourceFamily::Tape, "fs_mount", start, &result);
        result
    }

    fn fs_umount(&self, _device_path: &str, root_path: &str) -> Result<(), AdapterError> {
        let start = Instant::now();
        let result = (|| -> Result<(), AdapterError> {
            let mut command = Command::new(FUSERMOUNT_BIN);
            command.args(["-u", root_path]);
            proxmox_sys::command::run_command(command, None).map_err(|_| AdapterError::Busy)?;
            Ok(())
        })();
        log_op(ResourceFamily::Tape, "fs_umount", start, &result);
        result
    }

    fn fs_format(&self, device_path: &str, label: &str) -> Result<(), AdapterError> {
        let start = Instant::now();
        let result = (|| -> Result<(), AdapterError> {
            if label.trim().is_empty() {
                return Err(AdapterError::BadLabel("label must not be empty".to_string()));
            }
            let mut command = Command::new(MKLTFS_BIN);
            command.args(["-d", device_path, "-s", label, "-f"]);
            proxmox_sys::command::run_command(command, None).map_err(|err| AdapterError::Io(err.to_string()))?;
            Ok(())
        })();
        log_op(ResourceFamily::Tape, "fs_format", start, &result);
        result
    }

    fn fs_df(&self, root_path: &str) -> Result<FsUsage, AdapterError> {
        let start = Instant::now();
        let result = statvfs_usage(root_path).map_err(|err| AdapterError::Io(err.to_string()));
        log_op(ResourceFamily::Tape, "fs_df", start, &result);
        result
    }

    fn fs_release(&self, root_path: &str) -> Result<(), AdapterError> {
        let start = Instant::now();
        let result = (|| -> Result<(), AdapterError> {
            let dir = std::fs::File::open(root_path)?;
            nix::unistd::fsync(std::os::unix::io::AsRawFd::as_raw_fd(&dir)).map_err(|err| AdapterError::Io(err.to_string()))?;
            Ok(())
        })();
        log_op(ResourceFamily::Tape, "fs_release", start, &result);
        result
    }
}

pub(crate) fn statvfs_usage(path: &str) -> Result<FsUsage, anyhow::Error> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|err| format_err!("statvfs({path}) failed: {err}"))?;
    let block_size = stat.fragment_size().max(1);
    let bytes_available = stat.blocks_available() as u64 * block_size;
    let bytes_total = stat.blocks() as u64 * block_size;
    Ok(FsUsage {
        bytes_used: bytes_total.saturating_sub(bytes_available),
        bytes_available,
    })
}
