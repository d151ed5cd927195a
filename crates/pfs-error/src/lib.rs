#![forbid(unsafe_code)]
//! Error types for PocketFS.
//!
//! Defines `PfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for the userspace filesystem adapter.

use pfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all PocketFS operations.
#[derive(Debug, Error)]
pub enum PfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("file exists")]
    Exists,
}

impl PfsError {
    /// Convert this error into a POSIX errno for adapter replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Invalid(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
        }
    }
}

impl From<ParseError> for PfsError {
    fn from(err: ParseError) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(PfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(PfsError::NotFound("/x".into()).to_errno(), libc::ENOENT);
        assert_eq!(PfsError::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(PfsError::Exists.to_errno(), libc::EEXIST);
        assert_eq!(
            PfsError::Corruption {
                block: 0,
                detail: "bad magic".into()
            }
            .to_errno(),
            libc::EIO
        );
    }

    #[test]
    fn parse_error_converts_to_invalid() {
        let parse = ParseError::InvalidMagic {
            expected: 1,
            actual: 2,
        };
        let err: PfsError = parse.into();
        assert_eq!(err.to_errno(), libc::EINVAL);
    }
}
