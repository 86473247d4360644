#![forbid(unsafe_code)]
//! Error types for the dnx extN engine.
//!
//! # Error Taxonomy
//!
//! Two layers:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `dnx-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `DnxError` | `dnx-error` (this crate) | Errors returned by the engine and the VFS adapter |
//!
//! `dnx-error` does not depend on `dnx-types`. Parse failures are converted
//! where both are visible (`dnx-inode` for live metadata, `dnx-core` for
//! mount arguments):
//!
//! | ParseError Variant | DnxError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `Corruption { block, detail }` |
//! | `InvalidMagic` | `Format(detail)` |
//! | `InvalidField` | `Format` / `UnsupportedFeature` / `InvalidGeometry` |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`DnxError::to_errno`].
//! The match has no wildcard arm.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` / `Parse` / `InvalidGeometry` / `InvalidArgument` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `NotSupported` | `ENOTSUP` |
//! | `NotFound` | `ENOENT` |
//! | `NotPermitted` | `EPERM` |
//! | `NoSpace` | `ENOSPC` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Exists` | `EEXIST` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `FileTooLarge` | `EFBIG` |
//! | `Busy` | `EBUSY` |
//! | `Reentrant` | `EDEADLK` |

use thiserror::Error;

/// Unified runtime error for all dnx operations.
#[derive(Debug, Error)]
pub enum DnxError {
    /// Block I/O provider failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata read from a live volume failed validation.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image is not an ext2 volume this engine understands.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Superblock geometry out of range or inconsistent with the device.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Caller passed a zero size, bad offset or otherwise unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The volume uses an on-disk feature this build does not implement.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// The operation is well formed but refused (non-empty directory
    /// unlink, cache/superblock block size mismatch).
    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Wrong open mode for the requested I/O direction.
    #[error("operation not permitted")]
    NotPermitted,

    #[error("no space left on device")]
    NoSpace,

    #[error("name too long")]
    NameTooLong,

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    /// Logical block index beyond what the block map can address.
    #[error("file too large")]
    FileTooLarge,

    /// The inode is already held by another reference.
    #[error("inode {0} is busy")]
    Busy(u32),

    /// A public entry point was entered while the same thread held the
    /// volume lock.
    #[error("volume lock re-entered")]
    Reentrant,
}

impl DnxError {
    /// Convert this error into a POSIX errno for the VFS layer.
    ///
    /// On Linux `ENOTSUP` and `EOPNOTSUPP` share a value; they are kept as
    /// separate variants because other targets distinguish them.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_) => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::NotSupported(_) => libc::ENOTSUP,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotPermitted => libc::EPERM,
            Self::NoSpace => libc::ENOSPC,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::FileTooLarge => libc::EFBIG,
            Self::Busy(_) => libc::EBUSY,
            Self::Reentrant => libc::EDEADLK,
        }
    }
}

/// Result alias using `DnxError`.
pub type Result<T> = std::result::Result<T, DnxError>;
