use serde::{Deserialize, Serialize};

use proxmox_schema::api;

/// The four kinds of elements a tape library reports.
#[api]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Arm,
    Slot,
    Impexp,
    Drive,
}

/// One element of the TLC's in-memory library model.
///
/// Addresses are unique within a library; `full` implies `volume_label` is
/// meaningful; a medium is represented by exactly one full element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryElement {
    pub kind: ElementKind,
    pub address: u16,
    pub full: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_label: Option<String>,
    /// Address this medium was last moved from (only ever set on slots/drives).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_address: Option<u16>,
    /// Drive serial, only meaningful for `kind == Drive`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default)]
    pub flags: u32,
}

impl LibraryElement {
    pub fn empty(kind: ElementKind, address: u16) -> Self {
        Self {
            kind,
            address,
            full: false,
            volume_label: None,
            source_address: None,
            drive_id: None,
            exception: None,
            flags: 0,
        }
    }
}
