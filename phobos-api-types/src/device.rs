use serde::{Deserialize, Serialize};

use proxmox_schema::{api, Schema, StringSchema};

use crate::family::{ResourceFamily, RESOURCE_FAMILY_SCHEMA};
use crate::medium::MediumId;
use crate::status::{AdminStatus, DriveState};

pub const DRIVE_SERIAL_SCHEMA: Schema = StringSchema::new("Drive serial number.").schema();

/// Identifies a drive uniquely across the whole fleet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub family: ResourceFamily,
    pub serial: String,
    pub library: Option<String>,
}

impl DeviceId {
    pub fn new(family: ResourceFamily, serial: impl Into<String>, library: Option<String>) -> Self {
        Self {
            family,
            serial: serial.into(),
            library,
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.family, self.serial)
    }
}

/// Catalog-resident record of one drive, plus the LRS-local runtime state
/// that is never persisted (current medium/root path/internal state).
#[api(
    properties: {
        family: {
            schema: RESOURCE_FAMILY_SCHEMA,
        },
        serial: {
            schema: DRIVE_SERIAL_SCHEMA,
        },
        adm_status: {
            type: AdminStatus,
        },
        host: {
            optional: true,
        },
        library: {
            optional: true,
        },
        changer_drivenum: {
            optional: true,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceConfig {
    pub family: ResourceFamily,
    pub serial: String,
    pub model: String,
    pub path: String,
    pub adm_status: AdminStatus,
    /// Host currently responsible for this drive's LRS ownership.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Library name, for families whose drives live inside a changer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    /// Drive number inside the changer (element address offset), if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changer_drivenum: Option<u64>,
}

impl DeviceConfig {
    pub fn id(&self) -> DeviceId {
        DeviceId::new(self.family, self.serial.clone(), self.library.clone())
    }
}

/// Runtime-only state tracked by the LRS device state machine, kept
/// in memory and never written to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRuntime {
    pub state: DriveState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_medium: Option<MediumId>,
    /// The medium a `loading`/`unloading` transition is in flight for.
    /// `current_medium` itself only becomes `Some` once the medium is
    /// actually `loaded`, and is cleared as soon as `unloading` begins --
    /// see [`DriveState::implies_medium_present`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_medium: Option<MediumId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_root_path: Option<String>,
    /// Number of clients currently holding the drive busy (write/read in flight).
    pub refcount: u32,
}

impl DeviceRuntime {
    pub fn new() -> Self {
        Self {
            state: DriveState::Uninit,
            current_medium: None,
            pending_medium: None,
            current_root_path: None,
            refcount: 0,
        }
    }

    /// Invariant: `current_medium.is_some() <=> state implies a medium present`.
    pub fn check_invariant(&self) -> bool {
        self.current_medium.is_some() == self.state.implies_medium_present()
    }
}

impl Default for DeviceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_runtime_satisfies_the_invariant() {
        assert!(DeviceRuntime::new().check_invariant());
    }

    #[test]
    fn mismatch_between_current_medium_and_state_violates_the_invariant() {
        let mut runtime = DeviceRuntime::new();
        runtime.state = DriveState::Mounted;
        assert!(!runtime.check_invariant());

        runtime.current_medium = Some(MediumId::new(ResourceFamily::Tape, "VOL0001", Some("lib1".to_string())));
        assert!(runtime.check_invariant());
    }
}
