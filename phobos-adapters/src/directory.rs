use std::time::Instant;

use phobos_api_types::ResourceFamily;

use crate::tape::statvfs_usage;
use crate::{log_op, AdapterError, DeviceInfo, FamilyAdapter, FsUsage};

/// A plain directory on a local or network filesystem. There is no device
/// to query or filesystem to mount -- the path already is the root; format
/// and mount both degrade to writing/checking a small label marker.
pub struct DirectoryAdapter;

const LABEL_MARKER: &str = ".phobos-label";

impl FamilyAdapter for DirectoryAdapter {
    fn device_query(&self, path: &str) -> Result<DeviceInfo, AdapterError> {
        let start = Instant::now();
        let result = (|| -> Result<DeviceInfo, AdapterError> {
            let meta = std::fs::metadata(path)?;
            if !meta.is_dir() {
                return Err(AdapterError::Io(format!("'{path}' is not a directory")));
            }
            Ok(DeviceInfo {
                serial: path.to_string(),
                model: "directory".to_string(),
            })
        })();
        log_op(ResourceFamily::Directory, "device_query", start, &result);
        result
    }

    fn fs_mount(&self, device_path: &str, label: &str) -> Result<String, AdapterError> {
        let start = Instant::now();
        let result = (|| -> Result<String, AdapterError> {
            let marker = std::path::Path::new(device_path).join(LABEL_MARKER);
            let found = std::fs::read_to_string(&marker).map_err(|err| AdapterError::Io(err.to_string()))?;
            if found.trim() != label {
                return Err(AdapterError::BadLabel(format!("directory is labeled '{}', expected '{label}'", found.trim())));
            }
            Ok(device_path.to_string())
        })();
        log_op(ResourceFamily::Directory, "fs_mount", start, &result);
        result
    }

    fn fs_umount(&self, _device_path: &str, _root_path: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    fn fs_format(&self, device_path: &str, label: &str) -> Result<(), AdapterError> {
        let start = Instant::now();
        let result = (|| -> Result<(), AdapterError> {
            std::fs::create_dir_all(device_path)?;
            let marker = std::path::Path::new(device_path).join(LABEL_MARKER);
            std::fs::write(marker, label)?;
            Ok(())
        })();
        log_op(ResourceFamily::Directory, "fs_format", start, &result);
        result
    }

    fn fs_df(&self, root_path: &str) -> Result<FsUsage, AdapterError> {
        let start = Instant::now();
        let result = statvfs_usage(root_path).map_err(|err| AdapterError::Io(err.to_string()));
        log_op(ResourceFamily::Directory, "fs_df", start, &result);
        result
    }

    fn fs_release(&self, _root_path: &str) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("phobos-directory-adapter-test-{}-{}", std::process::id(), line!()))
    }

    #[test]
    fn format_then_mount_round_trips_the_label() {
        let dir = temp_dir();
        let path = dir.to_str().unwrap().to_string();
        let adapter = DirectoryAdapter;

        adapter.fs_format(&path, "VOL0001").unwrap();
        let root = adapter.fs_mount(&path, "VOL0001").unwrap();
        assert_eq!(root, path);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn mount_rejects_a_mismatched_label() {
        let dir = temp_dir();
        let path = dir.to_str().unwrap().to_string();
        let adapter = DirectoryAdapter;

        adapter.fs_format(&path, "VOL0001").unwrap();
        let err = adapter.fs_mount(&path, "VOL0002").unwrap_err();
        assert!(matches!(err, AdapterError::BadLabel(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn device_query_rejects_a_path_that_is_not_a_directory() {
        let file = temp_dir().with_extension("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let err = DirectoryAdapter.device_query(file.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, AdapterError::Io(_)));
        std::fs::remove_file(&file).ok();
    }
}
