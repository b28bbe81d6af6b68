//! Medium catalog: `/etc/phobos/medium.cfg`.
//!
//! One [`proxmox_section_config`] section per medium, named by label.

use anyhow::Error;
use lazy_static::lazy_static;

use proxmox_schema::*;
use proxmox_section_config::{SectionConfig, SectionConfigData, SectionConfigPlugin};

use phobos_api_types::MediumConfig;

use crate::{open_phobos_lockfile, replace_phobos_config, PhobosLockGuard};

pub const MEDIUM_CFG_FILENAME: &str = "/etc/phobos/medium.cfg";
pub const MEDIUM_CFG_LOCKFILE: &str = "/etc/phobos/.medium.lck";

lazy_static! {
    pub static ref CONFIG: SectionConfig = init();
}

fn init() -> SectionConfig {
    let id_schema = &phobos_api_types::MEDIUM_LABEL_SCHEMA;
    let mut config = SectionConfig::new(id_schema);

    let obj_schema = match MediumConfig::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin = SectionConfigPlugin::new("medium".to_string(), Some("label".to_string()), obj_schema);
    config.register_plugin(plugin);

    config
}

pub fn lock() -> Result<PhobosLockGuard, Error> {
    open_phobos_lockfile(MEDIUM_CFG_LOCKFILE, None, true)
}

pub fn config() -> Result<SectionConfigData, Error> {
    let content = proxmox_sys::fs::file_read_optional_string(MEDIUM_CFG_FILENAME)?.unwrap_or_default();
    CONFIG.parse(MEDIUM_CFG_FILENAME, &content)
}

pub fn save_config(config: &SectionConfigData) -> Result<(), Error> {
    let raw = CONFIG.write(MEDIUM_CFG_FILENAME, config)?;
    replace_phobos_config(MEDIUM_CFG_FILENAME, raw.as_bytes())
}

pub fn list_labels(data: &SectionConfigData) -> Vec<String> {
    data.sections.keys().cloned().collect()
}
