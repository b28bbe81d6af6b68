use serde::{Deserialize, Serialize};

use proxmox_schema::{api, ArraySchema, Schema, StringSchema};

use crate::family::{ResourceFamily, RESOURCE_FAMILY_SCHEMA};
use crate::status::{AddressingScheme, AdminStatus, FsStatus, FsType};

pub const MEDIUM_LABEL_SCHEMA: Schema = StringSchema::new("Medium label/barcode.")
    .min_length(1)
    .max_length(64)
    .schema();

pub const TAG_ARRAY_SCHEMA: Schema = ArraySchema::new(
    "Tag list.",
    &StringSchema::new("A single tag.").schema(),
)
.schema();

/// Identifies a medium uniquely across the whole fleet.
///
/// Identity triple: `(family, label, library)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MediumId {
    pub family: ResourceFamily,
    pub label: String,
    /// `None` for families with no owning library (directory, rados_pool).
    pub library: Option<String>,
}

impl MediumId {
    pub fn new(family: ResourceFamily, label: impl Into<String>, library: Option<String>) -> Self {
        Self {
            family,
            label: label.into(),
            library,
        }
    }
}

impl std::fmt::Display for MediumId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.library {
            Some(lib) => write!(f, "{}:{}@{}", self.family, self.label, lib),
            None => write!(f, "{}:{}", self.family, self.label),
        }
    }
}

/// Running usage counters for a medium, updated on RELEASE.
#[api]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MediumStats {
    pub bytes_used: u64,
    pub bytes_free: u64,
    pub object_count: u64,
    pub load_count: u64,
    pub error_count: u64,
    /// Epoch timestamp of the most recent successful load, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_load: Option<i64>,
}

/// Full, catalog-resident record for a medium.
#[api(
    properties: {
        family: {
            schema: RESOURCE_FAMILY_SCHEMA,
        },
        label: {
            schema: MEDIUM_LABEL_SCHEMA,
        },
        adm_status: {
            type: AdminStatus,
        },
        fs_status: {
            type: FsStatus,
        },
        fs_type: {
            type: FsType,
        },
        addressing: {
            type: AddressingScheme,
        },
        stats: {
            type: MediumStats,
        },
        tags: {
            schema: TAG_ARRAY_SCHEMA,
            optional: true,
        },
        library: {
            optional: true,
        },
        host: {
            optional: true,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MediumConfig {
    pub family: ResourceFamily,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    pub adm_status: AdminStatus,
    pub fs_status: FsStatus,
    pub fs_type: FsType,
    pub addressing: AddressingScheme,
    pub stats: MediumStats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Owning host while locked for writing/reading, set by the LRS that
    /// currently holds the media DSS lock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl MediumConfig {
    pub fn id(&self) -> MediumId {
        MediumId::new(self.family, self.label.clone(), self.library.clone())
    }

    /// A write request's tag set must be a subset of the medium's tag set.
    pub fn accepts_tags(&self, requested: &[String]) -> bool {
        requested.iter().all(|t| self.tags.iter().any(|m| m == t))
    }
}
