/// Core types and error taxonomy for the aabridge library
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Custom error types for aabridge
///
/// Every variant that originates from a failing syscall keeps the original
/// OS error so callers can make platform specific decisions with
/// [`ArmorError::raw_os_error`].
#[derive(Error, Debug)]
pub enum ArmorError {
    #[error("AppArmor is not present on this system")]
    NotPresent,

    #[error("AppArmor is disabled at boot")]
    DisabledAtBoot,

    #[error("AppArmor is enabled but its securityfs interface is not mounted")]
    NotMounted,

    #[error("Access denied to {path}: {source}")]
    NoAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Name too long: {len} bytes exceeds the {max} byte limit")]
    NameTooLong { len: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Subject label is unknown to the kernel")]
    SubjectUnknown,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Policy cache {0} exists with a different feature set")]
    AlreadyExists(PathBuf),

    #[error("Filesystem error on {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse error classes callers branch on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Module missing, disabled or unmounted; continue unconfined
    #[serde(rename = "environment_absent")]
    EnvironmentAbsent,
    /// Reply size or shape mismatch; library and kernel disagree
    #[serde(rename = "protocol")]
    Protocol,
    /// DAC or policy blocked the interface
    #[serde(rename = "permission_denied")]
    PermissionDenied,
    #[serde(rename = "out_of_memory")]
    OutOfMemory,
    /// The label named in an access query does not exist
    #[serde(rename = "subject_unknown")]
    SubjectUnknown,
    #[serde(rename = "not_supported")]
    NotSupported,
    #[serde(rename = "already_exists")]
    AlreadyExists,
    #[serde(rename = "invalid_argument")]
    InvalidArgument,
    /// Any other OS level failure
    #[serde(rename = "os")]
    Os,
}

impl ArmorError {
    /// Wrap an io error observed on `path`, classifying permission failures.
    pub fn at_path(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => ArmorError::NoAccess { path, source },
            _ => ArmorError::Filesystem { path, source },
        }
    }

    /// Map this error onto the caller-facing taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ArmorError::NotPresent | ArmorError::DisabledAtBoot | ArmorError::NotMounted => {
                ErrorClass::EnvironmentAbsent
            }
            ArmorError::NoAccess { .. } => ErrorClass::PermissionDenied,
            ArmorError::InvalidArgument(_) | ArmorError::NameTooLong { .. } => {
                ErrorClass::InvalidArgument
            }
            ArmorError::Protocol(_) => ErrorClass::Protocol,
            ArmorError::SubjectUnknown => ErrorClass::SubjectUnknown,
            ArmorError::OutOfMemory => ErrorClass::OutOfMemory,
            ArmorError::NotSupported(_) => ErrorClass::NotSupported,
            ArmorError::AlreadyExists(_) => ErrorClass::AlreadyExists,
            ArmorError::Filesystem { source, .. } | ArmorError::Io(source) => {
                match source.raw_os_error() {
                    Some(libc::EACCES) | Some(libc::EPERM) => ErrorClass::PermissionDenied,
                    Some(libc::ENOMEM) => ErrorClass::OutOfMemory,
                    _ => ErrorClass::Os,
                }
            }
            ArmorError::Config(_) => ErrorClass::InvalidArgument,
        }
    }

    /// The errno a C caller would have observed for this failure.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ArmorError::NotPresent => Some(libc::ENOSYS),
            ArmorError::DisabledAtBoot => Some(libc::ECANCELED),
            ArmorError::NotMounted => Some(libc::ENOENT),
            ArmorError::NoAccess { source, .. } | ArmorError::Filesystem { source, .. } => {
                source.raw_os_error()
            }
            ArmorError::Io(source) => source.raw_os_error(),
            ArmorError::InvalidArgument(_) | ArmorError::Config(_) => Some(libc::EINVAL),
            ArmorError::NameTooLong { .. } => Some(libc::EPROTO),
            ArmorError::Protocol(_) => Some(libc::EPROTO),
            ArmorError::SubjectUnknown => Some(libc::ENOENT),
            ArmorError::OutOfMemory => Some(libc::ENOMEM),
            ArmorError::NotSupported(_) => Some(libc::ENOTSUP),
            ArmorError::AlreadyExists(_) => Some(libc::EEXIST),
        }
    }

    /// True when the error means "AppArmor is not usable here".
    pub fn is_environment_absent(&self) -> bool {
        self.class() == ErrorClass::EnvironmentAbsent
    }

    /// True when the underlying OS error is ENOENT.
    pub fn is_not_found(&self) -> bool {
        match self {
            ArmorError::Filesystem { source, .. } | ArmorError::Io(source) => {
                source.kind() == io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

impl From<nix::errno::Errno> for ArmorError {
    fn from(err: nix::errno::Errno) -> Self {
        ArmorError::Io(io::Error::from_raw_os_error(err as i32))
    }
}

impl From<std::collections::TryReserveError> for ArmorError {
    fn from(_: std::collections::TryReserveError) -> Self {
        ArmorError::OutOfMemory
    }
}

/// Result type alias for aabridge operations
pub type Result<T> = std::result::Result<T, ArmorError>;

/// Task whose confinement is read or changed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfinementTarget {
    /// The calling thread
    #[serde(rename = "self")]
    Current,
    /// A specific thread id
    #[serde(rename = "tid")]
    Tid(i32),
}

/// Outcome of an access query
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDecision {
    /// The full requested mask is permitted
    pub allowed: bool,
    /// The access would generate an audit record
    pub audited: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_errors_classify_as_absent() {
        assert!(ArmorError::NotPresent.is_environment_absent());
        assert!(ArmorError::DisabledAtBoot.is_environment_absent());
        assert!(ArmorError::NotMounted.is_environment_absent());
        assert!(!ArmorError::SubjectUnknown.is_environment_absent());
    }

    #[test]
    fn test_os_error_is_preserved() {
        let err = ArmorError::at_path(
            "/proc/1/attr/current",
            io::Error::from_raw_os_error(libc::EACCES),
        );
        assert_eq!(err.class(), ErrorClass::PermissionDenied);
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));

        let err = ArmorError::at_path("/nope", io::Error::from_raw_os_error(libc::ENOENT));
        assert!(err.is_not_found());
        assert_eq!(err.class(), ErrorClass::Os);
    }

    #[test]
    fn test_errno_conversion() {
        let err: ArmorError = nix::errno::Errno::EPROTO.into();
        assert_eq!(err.raw_os_error(), Some(libc::EPROTO));
    }

    #[test]
    fn test_cache_errors_map_to_c_errno() {
        assert_eq!(
            ArmorError::NotSupported("max_caches".into()).raw_os_error(),
            Some(libc::ENOTSUP)
        );
        assert_eq!(
            ArmorError::AlreadyExists(PathBuf::from("/c")).raw_os_error(),
            Some(libc::EEXIST)
        );
    }
}
