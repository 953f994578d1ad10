use thiserror::Error;

use crate::PermissionLevel;

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Tagged error kinds shared by every layer of the sandbox core. The
/// filesystem adapter maps [`SandboxError::Denied`] onto the POSIX errno the
/// spec requires (`ENOENT` for invisibility, `EACCES` for a shortfall);
/// every other caller sees these variants directly.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: in {current:?}, attempted {attempted}")]
    InvalidState {
        current: crate::SandboxStatus,
        attempted: &'static str,
    },

    #[error("denied: {path} requested {requested:?}, effective {effective:?}")]
    Denied {
        path: String,
        requested: PermissionLevel,
        effective: PermissionLevel,
    },

    #[error("timed out")]
    Timeout,

    #[error("mount failed: {reason}")]
    MountFailed { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl SandboxError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SandboxError::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// Maps this error onto the errno a host process should observe, per the
    /// filesystem surface's error table. Returns `None` for error kinds that
    /// have no meaningful POSIX mapping (those never reach the FS adapter).
    pub fn to_errno(&self) -> Option<libc_errno::Errno> {
        match self {
            SandboxError::Denied {
                effective,
                requested,
                ..
            } => {
                if *effective == PermissionLevel::None {
                    Some(libc_errno::Errno::ENOENT)
                } else {
                    debug_assert!(requested > effective);
                    Some(libc_errno::Errno::EACCES)
                }
            }
            SandboxError::NotFound(_) => Some(libc_errno::Errno::ENOENT),
            SandboxError::Io(err) => err.raw_os_error().map(libc_errno::Errno::from_raw),
            _ => None,
        }
    }
}

/// A tiny stand-in for the handful of errno constants this crate maps onto,
/// so callers outside the `fs` crate don't need a `libc` dependency just to
/// read an error kind.
pub mod libc_errno {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Errno(pub i32);

    impl Errno {
        pub const ENOENT: Errno = Errno(2);
        pub const EACCES: Errno = Errno(13);
        pub const ENOTEMPTY: Errno = Errno(39);

        pub fn from_raw(raw: i32) -> Self {
            Errno(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn denied_with_effective_none_maps_to_enoent() {
        let err = SandboxError::Denied {
            path: "/secrets/k".into(),
            requested: PermissionLevel::Read,
            effective: PermissionLevel::None,
        };
        assert_eq!(err.to_errno(), Some(libc_errno::Errno::ENOENT));
    }

    #[test]
    fn denied_with_partial_effective_maps_to_eacces() {
        let err = SandboxError::Denied {
            path: "/meta/schema.json".into(),
            requested: PermissionLevel::Read,
            effective: PermissionLevel::View,
        };
        assert_eq!(err.to_errno(), Some(libc_errno::Errno::EACCES));
    }
}
