use serde::{Deserialize, Serialize};

use proxmox_schema::api;

/// Administrative status, settable by an operator independent of actual usage.
#[api]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminStatus {
    Locked,
    Unlocked,
    Failed,
}

impl Default for AdminStatus {
    fn default() -> Self {
        AdminStatus::Unlocked
    }
}

/// Filesystem/content lifecycle status of a medium.
#[api]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsStatus {
    /// No filesystem written yet.
    Blank,
    /// Formatted, no objects stored.
    Empty,
    /// Currently being imported from foreign LTFS content.
    Importing,
    /// Holds data, still accepts writes.
    Used,
    /// Holds data, no more space for new extents.
    Full,
}

/// Filesystem type written onto a medium.
#[api]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsType {
    Ltfs,
    Posix,
    Rados,
}

/// Object addressing scheme used on a medium.
#[api]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingScheme {
    /// Plain path addressing (directory family).
    Path,
    /// `hash1` addressing scheme (tape family, LTFS).
    Hash1,
    /// Opaque handle managed by the family's own pool layer.
    Opaque,
}

/// Internal, LRS-local lifecycle state of a drive.
///
/// See the device state machine: transitions are driven only by
/// scheduler decisions, never directly by client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveState {
    Uninit,
    Empty,
    Loading,
    Loaded,
    Mounting,
    Mounted,
    Busy,
    Flushing,
    Unmounting,
    Unloading,
    Failed,
}

impl DriveState {
    /// Invariant: `current_medium.is_some()` iff the drive is in one of
    /// these states.
    pub fn implies_medium_present(self) -> bool {
        matches!(
            self,
            DriveState::Loaded
                | DriveState::Mounting
                | DriveState::Mounted
                | DriveState::Busy
                | DriveState::Flushing
                | DriveState::Unmounting
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implies_medium_present_excludes_loading_and_unloading() {
        let with_medium = [
            DriveState::Loaded,
            DriveState::Mounting,
            DriveState::Mounted,
            DriveState::Busy,
            DriveState::Flushing,
            DriveState::Unmounting,
        ];
        let without_medium = [DriveState::Uninit, DriveState::Empty, DriveState::Loading, DriveState::Unloading, DriveState::Failed];

        for state in with_medium {
            assert!(state.implies_medium_present(), "{state:?} should imply a medium is present");
        }
        for state in without_medium {
            assert!(!state.implies_medium_present(), "{state:?} should not imply a medium is present");
        }
    }
}
