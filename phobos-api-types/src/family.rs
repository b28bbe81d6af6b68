use serde::{Deserialize, Serialize};

use proxmox_schema::{api, Schema, StringSchema};

pub const RESOURCE_FAMILY_SCHEMA: Schema =
    StringSchema::new("Resource family (tape, dir or rados_pool).").schema();

/// The closed set of resource families a medium or device can belong to.
///
/// A family determines which [`crate::FsType`]/adapters apply and whether
/// placement is arbitrated by a tape library (only `Tape` is).
#[api]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFamily {
    /// Removable tape media, arbitrated by a TLC-owned library.
    Tape,
    /// A plain directory on a local or network filesystem.
    Directory,
    /// An object-pool backed family (e.g. a RADOS pool).
    RadosPool,
}

impl ResourceFamily {
    /// Whether this family is arbitrated by a tape library (TLC).
    pub fn has_library(self) -> bool {
        matches!(self, ResourceFamily::Tape)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceFamily::Tape => "tape",
            ResourceFamily::Directory => "directory",
            ResourceFamily::RadosPool => "rados_pool",
        }
    }
}

impl std::fmt::Display for ResourceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tape" => Ok(ResourceFamily::Tape),
            "directory" | "dir" => Ok(ResourceFamily::Directory),
            "rados_pool" => Ok(ResourceFamily::RadosPool),
            other => anyhow::bail!("unknown resource family '{other}'"),
        }
    }
}
