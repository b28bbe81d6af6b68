//! LRS message kinds. One `LrsRequest` variant per verb a client can
//! issue against a local resource scheduler; `LrsResponse` mirrors it.

use serde::{Deserialize, Serialize};

use phobos_api_types::{AddressingScheme, FsType, ResourceFamily};

use crate::WireError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadOperation {
    Read,
    GetMd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaLocation {
    pub medium_id: String,
    pub root_path: String,
    pub fs_type: FsType,
    pub addr_type: AddressingScheme,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    pub medium_id: String,
    pub size_written: u64,
    pub n_extents: u32,
    pub to_sync: bool,
    pub rc: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOp {
    AddDevice,
    DeviceLock,
    DeviceUnlock,
    DeviceAdd,
    MediumUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigureOp {
    Get,
    Set,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrsRequest {
    Ping,
    Read {
        required_media: Vec<String>,
        operation: ReadOperation,
    },
    Write {
        size: u64,
        tags: Vec<String>,
        family: ResourceFamily,
        #[serde(skip_serializing_if = "Option::is_none")]
        copy_name: Option<String>,
    },
    Format {
        medium_id: String,
        fs_type: FsType,
        #[serde(skip_serializing_if = "Option::is_none")]
        unlock: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        force: Option<bool>,
    },
    Release {
        media: Vec<ReleaseEntry>,
    },
    Notify {
        op: NotifyOp,
        rsrc_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        wait: Option<bool>,
    },
    Monitor {
        family: ResourceFamily,
    },
    Configure {
        op: ConfigureOp,
        configuration: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrsResponse {
    PingResp,
    ReadResp {
        media: Vec<MediaLocation>,
    },
    WriteResp {
        drive: String,
        medium: String,
        root_path: String,
        fs_type: FsType,
        addr_type: AddressingScheme,
    },
    FormatResp {
        medium_id: String,
    },
    /// Every request gets a correlated response; RELEASE and NOTIFY
    /// are no exception even though they carry no response-specific
    /// fields of their own.
    ReleaseResp,
    NotifyResp,
    MonitorResp {
        status: serde_json::Value,
    },
    ConfigureResp {
        #[serde(skip_serializing_if = "Option::is_none")]
        configuration: Option<serde_json::Value>,
    },
    Error(WireError),
}
