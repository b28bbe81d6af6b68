use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy shared by the SCSI driver, adapters, scheduler, LRS and
/// TLC. Every failure either transitions state or is returned as one
/// of these variants -- none are logged and silently swallowed.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum PhobosError {
    /// Transient SCSI/adapter condition; the SCSI driver already retried
    /// internally up to `retry_count` before this was raised.
    #[error("transient error: {0}")]
    Transient(String),

    /// Another host holds the DSS lock this request needed.
    #[error("resource busy, locked by host '{holder}'")]
    LockConflict { holder: String },

    /// Requested drive is already busy serving another client locally.
    #[error("drive in use")]
    DriveInUse,

    /// Medium is mounted/owned by another LRS host.
    #[error("medium in use on host '{0}'")]
    MediumOnHost(String),

    #[error("medium '{0}' unknown to library")]
    MediaLabelUnknown(String),

    #[error("drive serial '{0}' unknown")]
    DriveSerialUnknown(String),

    #[error("no free slot")]
    NoFreeSlot,

    #[error("no compatible medium available")]
    NoCompatibleMedium,

    #[error("unsupported family '{0}'")]
    UnsupportedFamily(String),

    #[error("bad port {0}")]
    BadPort(u16),

    #[error("unknown library '{0}'")]
    UnknownLibrary(String),

    /// Protocol errors are fatal for the connection they occurred on.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("drive '{0}' marked failed")]
    DeviceFailed(String),

    #[error("expected tape '{expected}', drive holds '{loaded}'")]
    UnexpectedTape { expected: String, loaded: String },

    #[error("drive does not contain '{0}'")]
    EmptyDriveDoesNotContain(String),

    #[error("no space left on medium")]
    NoSpace,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PhobosError {
    /// Negated-POSIX-errno style return code used on the wire and by the
    /// admin CLI: non-zero is the negated POSIX errno of the first failure,
    /// capped to 125.
    pub fn rc(&self) -> i32 {
        let errno = match self {
            PhobosError::Transient(_) => libc::EAGAIN,
            PhobosError::LockConflict { .. } | PhobosError::DriveInUse => libc::EBUSY,
            PhobosError::MediumOnHost(_) => libc::EBUSY,
            PhobosError::MediaLabelUnknown(_)
            | PhobosError::DriveSerialUnknown(_)
            | PhobosError::NoCompatibleMedium => libc::ENODEV,
            PhobosError::NoFreeSlot | PhobosError::NoSpace => libc::ENOSPC,
            PhobosError::UnsupportedFamily(_)
            | PhobosError::BadPort(_)
            | PhobosError::UnknownLibrary(_) => libc::EINVAL,
            PhobosError::Protocol(_) => libc::EPROTO,
            PhobosError::DeviceFailed(_) => libc::EIO,
            PhobosError::UnexpectedTape { .. } | PhobosError::EmptyDriveDoesNotContain(_) => {
                libc::ENOENT
            }
            PhobosError::Internal(_) => libc::EIO,
        };
        errno.min(125)
    }

    /// Short machine-readable code, used as the wire `rc` field and in CLI
    /// diagnostic JSON blobs.
    pub fn code(&self) -> &'static str {
        match self {
            PhobosError::Transient(_) => "transient",
            PhobosError::LockConflict { .. } => "lock_conflict",
            PhobosError::DriveInUse => "drive_in_use",
            PhobosError::MediumOnHost(_) => "medium_on_host",
            PhobosError::MediaLabelUnknown(_) => "media_label_unknown",
            PhobosError::DriveSerialUnknown(_) => "drive_serial_unknown",
            PhobosError::NoFreeSlot => "no_free_slot",
            PhobosError::NoCompatibleMedium => "no_compatible_medium",
            PhobosError::UnsupportedFamily(_) => "unsupported_family",
            PhobosError::BadPort(_) => "bad_port",
            PhobosError::UnknownLibrary(_) => "unknown_library",
            PhobosError::Protocol(_) => "protocol",
            PhobosError::DeviceFailed(_) => "device_failed",
            PhobosError::UnexpectedTape { .. } => "unexpected_tape",
            PhobosError::EmptyDriveDoesNotContain(_) => "empty_drive_does_not_contain",
            PhobosError::NoSpace => "no_space",
            PhobosError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_is_never_zero_and_always_capped_at_125() {
        let errors = [
            PhobosError::Transient("x".to_string()),
            PhobosError::DriveInUse,
            PhobosError::MediumOnHost("h2".to_string()),
            PhobosError::MediaLabelUnknown("VOL0001".to_string()),
            PhobosError::NoFreeSlot,
            PhobosError::UnsupportedFamily("rados_pool".to_string()),
            PhobosError::Protocol("bad frame".to_string()),
            PhobosError::DeviceFailed("HU0001".to_string()),
            PhobosError::Internal("oops".to_string()),
        ];
        for err in errors {
            assert!(err.rc() > 0);
            assert!(err.rc() <= 125);
        }
    }

    #[test]
    fn code_is_stable_and_matches_the_variant() {
        assert_eq!(PhobosError::DriveSerialUnknown("BOGUS".to_string()).code(), "drive_serial_unknown");
        assert_eq!(PhobosError::NoCompatibleMedium.code(), "no_compatible_medium");
        assert_eq!(PhobosError::NoSpace.rc(), libc::ENOSPC);
    }
}
