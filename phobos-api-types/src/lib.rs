//! Shared data model types for the Phobos tape object store.
//!
//! This crate only holds plain data: [`MediumConfig`], [`DeviceConfig`],
//! [`LibraryElement`], lock records and the shared error taxonomy. It has no
//! knowledge of SCSI, sockets or the catalog backend; those live in
//! `phobos-scsi`, `phobos-proto`, `phobos-dss` and `phobos-library`.

mod device;
mod element;
mod error;
mod family;
mod lock;
mod medium;
mod request;
mod status;

pub use device::{DeviceConfig, DeviceId, DeviceRuntime, DRIVE_SERIAL_SCHEMA};
pub use element::{ElementKind, LibraryElement};
pub use error::PhobosError;
pub use family::{ResourceFamily, RESOURCE_FAMILY_SCHEMA};
pub use lock::{DssLock, LockType};
pub use medium::{MediumConfig, MediumId, MediumStats, MEDIUM_LABEL_SCHEMA, TAG_ARRAY_SCHEMA};
pub use request::{RequestId, RequestKind};
pub use status::{AddressingScheme, AdminStatus, DriveState, FsStatus, FsType};

pub const PROXMOX_SAFE_ID_REGEX_STR: &str = r"(?:[A-Za-z0-9_][A-Za-z0-9._-]*)";
