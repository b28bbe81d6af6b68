//! Configuration loading and file locking for the Phobos daemons.
//!
//! Two kinds of persisted configuration exist:
//!
//! - the main INI-style tuning file (`phobos.conf`, see [`main_config`]),
//!   sections `{lrs, tlc, tlc_<library>, scsi, lib_scsi, store, dss}`, any
//!   key overridable by `PHOBOS_<SECTION>_<KEY>`;
//! - the device/medium catalog, modeled with [`proxmox_section_config`],
//!   one section per device or medium.

pub mod device;
pub mod main_config;
pub mod medium;

use anyhow::Error;
use nix::unistd::{Gid, Group, Uid, User};

pub use phobos_buildcfg::{PHOBOS_GROUP_NAME, PHOBOS_USER_NAME};

/// Return user info for the "phobos" daemon user.
pub fn phobos_user() -> Result<nix::unistd::User, Error> {
    if cfg!(test) {
        Ok(User::from_uid(Uid::current())?.expect("current user does not exist"))
    } else {
        User::from_name(PHOBOS_USER_NAME)?
            .ok_or_else(|| anyhow::format_err!("unable to lookup '{}' user", PHOBOS_USER_NAME))
    }
}

/// Return group info for the "phobos" daemon group.
pub fn phobos_group() -> Result<nix::unistd::Group, Error> {
    if cfg!(test) {
        Ok(Group::from_gid(Gid::current())?.expect("current group does not exist"))
    } else {
        Group::from_name(PHOBOS_GROUP_NAME)?
            .ok_or_else(|| anyhow::format_err!("unable to lookup '{}' group", PHOBOS_GROUP_NAME))
    }
}

pub struct PhobosLockGuard(#[allow(dead_code)] Option<std::fs::File>);

#[doc(hidden)]
/// Note: do not use for production code, only intended for tests.
pub unsafe fn create_mocked_lock() -> PhobosLockGuard {
    PhobosLockGuard(None)
}

/// Open or create a lock file owned by the phobos user and lock it.
///
/// A process-wide advisory flock guarding read-modify-write cycles on a
/// config or catalog file.
pub fn open_phobos_lockfile<P: AsRef<std::path::Path>>(
    path: P,
    timeout: Option<std::time::Duration>,
    exclusive: bool,
) -> Result<PhobosLockGuard, Error> {
    let user = phobos_user()?;
    let options = proxmox_sys::fs::CreateOptions::new()
        .perm(nix::sys::stat::Mode::from_bits_truncate(0o660))
        .owner(user.uid)
        .group(user.gid);

    let timeout = timeout.unwrap_or(std::time::Duration::new(10, 0));

    let file = proxmox_sys::fs::open_file_locked(&path, timeout, exclusive, options)?;
    Ok(PhobosLockGuard(Some(file)))
}

/// Atomically write data to a config file owned by `phobos:phobos`.
pub fn replace_phobos_config<P: AsRef<std::path::Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let user = phobos_user()?;
    let mode = nix::sys::stat::Mode::from_bits_truncate(0o0640);
    let options = proxmox_sys::fs::CreateOptions::new()
        .perm(mode)
        .owner(user.uid)
        .group(user.gid);

    proxmox_sys::fs::replace_file(path, data, options, true)?;

    Ok(())
}
