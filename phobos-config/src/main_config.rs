//! The main Phobos tuning file: INI-style sections
//! `{lrs, tlc, tlc_<library>, scsi, lib_scsi, store, dss}`.
//!
//! Unlike the device/medium catalog (see [`crate::device`]/[`crate::medium`])
//! this is free-form `key = value` configuration, read once at daemon
//! startup. Any key may be overridden by an environment variable named
//! `PHOBOS_<SECTION>_<KEY>` (uppercased).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, format_err, Error};

use phobos_buildcfg::{CFG_FILE_ENV, DEFAULT_CFG_FILE};

/// A parsed `phobos.conf`: section name -> (key -> value).
#[derive(Debug, Clone, Default)]
pub struct PhobosConfig {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl PhobosConfig {
    pub fn parse(content: &str) -> Result<Self, Error> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current = String::from("global");

        for (lineno, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                format_err!("phobos.conf:{}: expected 'key = value', got '{}'", lineno + 1, raw_line)
            })?;
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(PhobosConfig { sections })
    }

    /// Raw lookup, without environment override. Prefer [`PhobosConfig::get`].
    pub fn raw_get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(|s| s.as_str())
    }

    fn env_var_name(section: &str, key: &str) -> String {
        format!(
            "PHOBOS_{}_{}",
            section.to_uppercase().replace('-', "_"),
            key.to_uppercase().replace('-', "_")
        )
    }

    /// Look up a key, honoring a `PHOBOS_<SECTION>_<KEY>` environment override.
    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        if let Ok(val) = std::env::var(Self::env_var_name(section, key)) {
            return Some(val);
        }
        self.raw_get(section, key).map(|s| s.to_string())
    }

    pub fn get_or(&self, section: &str, key: &str, default: &str) -> String {
        self.get(section, key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_u64(&self, section: &str, key: &str, default: u64) -> Result<u64, Error> {
        match self.get(section, key) {
            Some(v) => v
                .parse()
                .map_err(|_| format_err!("[{section}] {key}: expected integer, got '{v}'")),
            None => Ok(default),
        }
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> Result<bool, Error> {
        match self.get(section, key) {
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => bail!("[{section}] {key}: expected boolean, got '{other}'"),
            },
            None => Ok(default),
        }
    }

    /// All key-value pairs of a section, e.g. for `tlc_<library>` namespacing.
    pub fn section(&self, section: &str) -> BTreeMap<String, String> {
        self.sections.get(section).cloned().unwrap_or_default()
    }

    /// Section name for a specific tape library's TLC tuning (`tlc_<library>`).
    pub fn library_section(library: &str) -> String {
        format!("tlc_{library}")
    }
}

/// Locate the config file: `PHOBOS_CFG_FILE` env var, else the compiled-in default.
pub fn config_path() -> std::path::PathBuf {
    std::env::var(CFG_FILE_ENV)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from(DEFAULT_CFG_FILE))
}

/// Load and parse the main configuration file. A missing file is treated as
/// empty (every key then falls back to its compiled-in default).
pub fn load() -> Result<PhobosConfig, Error> {
    load_from(&config_path())
}

pub fn load_from(path: &Path) -> Result<PhobosConfig, Error> {
    let content = proxmox_sys::fs::file_read_optional_string(path)?.unwrap_or_default();
    PhobosConfig::parse(&content)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_sections_and_keys() {
        let cfg = PhobosConfig::parse(
            "[lrs]\nserver_socket = /run/phobos/lrs.sock\nretry_count = 5\n\n[tlc_lib1]\nlib_device = /dev/sg2\n",
        )
        .unwrap();
        assert_eq!(cfg.raw_get("lrs", "server_socket"), Some("/run/phobos/lrs.sock"));
        assert_eq!(cfg.get_u64("lrs", "retry_count", 0).unwrap(), 5);
        assert_eq!(cfg.raw_get("tlc_lib1", "lib_device"), Some("/dev/sg2"));
    }

    #[test]
    fn env_override_wins() {
        std::env::set_var("PHOBOS_LRS_RETRY_COUNT", "9");
        let cfg = PhobosConfig::parse("[lrs]\nretry_count = 5\n").unwrap();
        assert_eq!(cfg.get_u64("lrs", "retry_count", 0).unwrap(), 9);
        std::env::remove_var("PHOBOS_LRS_RETRY_COUNT");
    }

    #[test]
    fn missing_key_uses_default() {
        let cfg = PhobosConfig::parse("[lrs]\n").unwrap();
        assert_eq!(cfg.get_bool("lrs", "degraded_ok", true).unwrap(), true);
    }
}
