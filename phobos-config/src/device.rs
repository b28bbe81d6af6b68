//! Device (drive) catalog: `/etc/phobos/device.cfg`.
//!
//! One [`proxmox_section_config`] section per drive, named by serial.

use anyhow::Error;
use lazy_static::lazy_static;

use proxmox_schema::*;
use proxmox_section_config::{SectionConfig, SectionConfigData, SectionConfigPlugin};

use phobos_api_types::DeviceConfig;

use crate::{open_phobos_lockfile, replace_phobos_config, PhobosLockGuard};

pub const DEVICE_CFG_FILENAME: &str = "/etc/phobos/device.cfg";
pub const DEVICE_CFG_LOCKFILE: &str = "/etc/phobos/.device.lck";

lazy_static! {
    pub static ref CONFIG: SectionConfig = init();
}

fn init() -> SectionConfig {
    let id_schema = &phobos_api_types::DRIVE_SERIAL_SCHEMA;
    let mut config = SectionConfig::new(id_schema);

    let obj_schema = match DeviceConfig::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin = SectionConfigPlugin::new("device".to_string(), Some("serial".to_string()), obj_schema);
    config.register_plugin(plugin);

    config
}

/// Acquire the exclusive catalog lock.
pub fn lock() -> Result<PhobosLockGuard, Error> {
    open_phobos_lockfile(DEVICE_CFG_LOCKFILE, None, true)
}

/// Read and parse the device catalog.
pub fn config() -> Result<SectionConfigData, Error> {
    let content = proxmox_sys::fs::file_read_optional_string(DEVICE_CFG_FILENAME)?.unwrap_or_default();
    CONFIG.parse(DEVICE_CFG_FILENAME, &content)
}

/// Save the device catalog. Caller must hold [`lock`].
pub fn save_config(config: &SectionConfigData) -> Result<(), Error> {
    let raw = CONFIG.write(DEVICE_CFG_FILENAME, config)?;
    replace_phobos_config(DEVICE_CFG_FILENAME, raw.as_bytes())
}

/// List every drive serial currently in the catalog.
pub fn list_serials(data: &SectionConfigData) -> Vec<String> {
    data.sections.keys().cloned().collect()
}
