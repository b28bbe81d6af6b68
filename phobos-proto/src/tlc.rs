//! TLC message kinds: PING, DRIVE_LOOKUP, LOAD, UNLOAD,
//! STATUS, REFRESH.

use serde::{Deserialize, Serialize};

use phobos_api_types::LibraryElement;

use crate::WireError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TlcRequest {
    Ping,
    DriveLookup {
        serial: String,
    },
    Load {
        drive_serial: String,
        tape_label: String,
    },
    Unload {
        drive_serial: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        expected_label: Option<String>,
    },
    Status {
        #[serde(default)]
        refresh: bool,
    },
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TlcResponse {
    PingResp {
        library_is_up: bool,
    },
    DriveLookupResp {
        drive_address: u16,
        first_drive_address: u16,
        loaded: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        loaded_medium_label: Option<String>,
    },
    LoadResp {
        drive_address: u16,
        slot_address: u16,
    },
    UnloadResp {
        label: String,
        destination_address: u16,
    },
    StatusResp {
        elements: Vec<LibraryElement>,
    },
    RefreshResp,
    Error(WireError),
}
