//! Error model — one stable kind per failure class.
//!
//! Every public operation returns [`WimError`]. Each variant maps to exactly
//! one [`ErrorKind`]; the numeric kind values are frozen and double as the
//! CLI exit codes. Context (path, offset, operation) is attached at the
//! layer that has it; lower layers never guess.
//!
//! Policy:
//! - Codec and hash failures are fatal for the affected blob and for the
//!   caller. No partial decompressed output is ever surfaced.
//! - Out-of-memory during best-effort property harvesting is recorded and
//!   reported at the end (`xmldata`); everywhere else it propagates.
//! - Capture continues past per-file errors only when the caller sets the
//!   continue-on-errors flag; structural errors are always fatal.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Stable error classification. The numeric values are part of the external
/// contract (CLI exit codes) and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    Read = 1,
    Write = 2,
    Open = 3,
    Seek = 4,
    DecompressionFailed = 5,
    InvalidResourceHash = 6,
    InvalidReparseData = 7,
    InvalidMetadata = 8,
    InvalidHeader = 9,
    InvalidSecurityData = 10,
    Unsupported = 11,
    ImageNameCollision = 12,
    NoImage = 13,
    NotADirectory = 14,
    ImageCountMismatch = 15,
    OutOfMemory = 16,
    Cancelled = 17,
    NtfsVolume = 18,
}

impl ErrorKind {
    /// Stable nonzero process exit code for this kind.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Error, Debug)]
pub enum WimError {
    #[error("read of {len} bytes at offset {offset} in {path:?} failed: {source}")]
    Read {
        path: PathBuf,
        offset: u64,
        len: usize,
        source: io::Error,
    },

    #[error("write at offset {offset} in {path:?} failed: {source}")]
    Write {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },

    #[error("cannot open {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("seek to offset {offset} in {path:?} failed: {source}")]
    Seek {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },

    #[error("chunk {chunk} of resource at offset {resource_offset} failed to decompress: {detail}")]
    DecompressionFailed {
        resource_offset: u64,
        chunk: u64,
        detail: String,
    },

    #[error("blob {hash} hashed to {actual} after read — archive is corrupt")]
    InvalidResourceHash { hash: String, actual: String },

    #[error("invalid reparse data: {detail}")]
    InvalidReparseData { detail: String },

    #[error("invalid image metadata at offset {offset}: {detail}")]
    InvalidMetadata { offset: u64, detail: String },

    #[error("invalid archive header: {detail}")]
    InvalidHeader { detail: String },

    #[error("invalid security descriptor data: {detail}")]
    InvalidSecurityData { detail: String },

    #[error("unsupported: {detail}")]
    Unsupported { detail: String },

    #[error("an image named \"{name}\" already exists in this archive")]
    ImageNameCollision { name: String },

    #[error("no image matches \"{selector}\" (archive holds {count} image(s))")]
    NoImage { selector: String, count: u32 },

    #[error("{path:?} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("header declares {declared} image(s) but {found} metadata resource(s) are present")]
    ImageCountMismatch { declared: u32, found: u32 },

    #[error("out of memory while {operation}")]
    OutOfMemory { operation: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{path:?} is an NTFS volume; the generic back-end cannot be used on it")]
    NtfsVolume { path: PathBuf },
}

impl WimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WimError::Read { .. } => ErrorKind::Read,
            WimError::Write { .. } => ErrorKind::Write,
            WimError::Open { .. } => ErrorKind::Open,
            WimError::Seek { .. } => ErrorKind::Seek,
            WimError::DecompressionFailed { .. } => ErrorKind::DecompressionFailed,
            WimError::InvalidResourceHash { .. } => ErrorKind::InvalidResourceHash,
            WimError::InvalidReparseData { .. } => ErrorKind::InvalidReparseData,
            WimError::InvalidMetadata { .. } => ErrorKind::InvalidMetadata,
            WimError::InvalidHeader { .. } => ErrorKind::InvalidHeader,
            WimError::InvalidSecurityData { .. } => ErrorKind::InvalidSecurityData,
            WimError::Unsupported { .. } => ErrorKind::Unsupported,
            WimError::ImageNameCollision { .. } => ErrorKind::ImageNameCollision,
            WimError::NoImage { .. } => ErrorKind::NoImage,
            WimError::NotADirectory { .. } => ErrorKind::NotADirectory,
            WimError::ImageCountMismatch { .. } => ErrorKind::ImageCountMismatch,
            WimError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            WimError::Cancelled => ErrorKind::Cancelled,
            WimError::NtfsVolume { .. } => ErrorKind::NtfsVolume,
        }
    }

    /// Attach metadata context to a bare detail string.
    pub(crate) fn metadata(offset: u64, detail: impl Into<String>) -> Self {
        WimError::InvalidMetadata {
            offset,
            detail: detail.into(),
        }
    }

    pub(crate) fn header(detail: impl Into<String>) -> Self {
        WimError::InvalidHeader {
            detail: detail.into(),
        }
    }

    pub(crate) fn unsupported(detail: impl Into<String>) -> Self {
        WimError::Unsupported {
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WimError>;
