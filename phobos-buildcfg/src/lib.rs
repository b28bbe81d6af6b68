//! Compile time configuration data shared by all Phobos daemons and tools.

/// Phobos package version (`CARGO_PKG_VERSION`).
pub const PHOBOS_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The configured configuration directory.
pub const CONFIGDIR: &str = "/etc/phobos";

/// Unix system user used by the phobos daemons.
pub const PHOBOS_USER_NAME: &str = "phobos";
/// Unix system group used by the phobos daemons.
pub const PHOBOS_GROUP_NAME: &str = "phobos";

#[macro_export]
macro_rules! PHOBOS_RUN_DIR_M {
    () => {
        "/run/phobos"
    };
}

#[macro_export]
macro_rules! PHOBOS_STATE_DIR_M {
    () => {
        "/var/lib/phobos"
    };
}

#[macro_export]
macro_rules! PHOBOS_LOG_DIR_M {
    () => {
        "/var/log/phobos"
    };
}

/// Default path of the LRS client-facing UNIX socket.
pub const LRS_SOCKET_PATH: &str = concat!(PHOBOS_RUN_DIR_M!(), "/lrs.sock");

/// Default path of the LRS lock file (one running LRS per host).
pub const LRS_LOCK_FILE: &str = concat!(PHOBOS_RUN_DIR_M!(), "/lrs.lock");

/// Directory holding per-drive lock files used by the LRS device state machine.
pub const DRIVE_LOCK_DIR: &str = concat!(PHOBOS_RUN_DIR_M!(), "/drive-lock");

/// Default environment variable naming the configuration file.
pub const CFG_FILE_ENV: &str = "PHOBOS_CFG_FILE";

/// Default configuration file location, used when `PHOBOS_CFG_FILE` is unset.
pub const DEFAULT_CFG_FILE: &str = concat!("/etc/phobos", "/phobos.conf");
