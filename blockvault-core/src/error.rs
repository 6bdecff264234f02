//! Error types for blockvault operations.
//!
//! Errors local to a single partition (`Capture`, `Restore`) are only raised
//! after the one automatic downgrade to the generic method has been tried.
//! Everything else aborts the whole run.

use std::path::PathBuf;
use thiserror::Error;

use crate::exec::ToolError;

/// Result type alias for blockvault operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{} is not a usable block device{}", .path.display(), .hint.as_deref().map(|h| format!(" ({h})")).unwrap_or_default())]
    NotABlockDevice { path: PathBuf, hint: Option<String> },

    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    #[error("no non-removable disk found")]
    NoDiskFound,

    #[error("required tool is not available: {0}")]
    MissingRequiredTool(String),

    #[error("this operation requires root privileges")]
    NotPrivileged,

    #[error("{} is mounted at {} (pass --allow-mounted to override)", .partition.display(), .mount_point.display())]
    MountedSource {
        partition: PathBuf,
        mount_point: PathBuf,
    },

    #[error("capture of {partition} failed: {reason}")]
    Capture { partition: String, reason: String },

    #[error("restore of {partition} failed: {reason}")]
    Restore { partition: String, reason: String },

    #[error("post-backup audit failed: {0}")]
    Audit(VerifyFailure),

    #[error("verification failed: {0}")]
    Verification(VerifyFailure),

    #[error("confirmation declined")]
    ConfirmationDeclined,

    #[error("operation cancelled by user")]
    Cancelled,

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("invalid backup set {}: {reason}", .path.display())]
    InvalidBackupSet { path: PathBuf, reason: String },

    #[error("backup destination {} already exists and is not empty", .0.display())]
    BackupSetExists(PathBuf),

    #[error("target device {} is too small: need {needed} bytes, have {available} bytes", .device.display())]
    TargetTooSmall {
        device: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl Error {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a backup set failed its audit or a verify run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("image file missing: {0}")]
    MissingImage(String),

    #[error("image file is empty: {0}")]
    EmptyImage(String),

    #[error("checksum ledger does not match manifest: {0}")]
    LedgerMismatch(String),

    #[error("integrity check failed for {file}: {reason}")]
    Integrity { file: String, reason: String },

    #[error("no partition table source (neither table dump nor raw head/tail) in backup set")]
    MissingTableSource,

    #[error("partition count mismatch: backup has {expected}, device has {found}")]
    PartitionCountMismatch { expected: usize, found: usize },

    #[error("partition {partition}: filesystem type mismatch (backup {expected}, device {found})")]
    FsTypeMismatch {
        partition: u32,
        expected: String,
        found: String,
    },

    #[error("manifest is incomplete: {0}")]
    IncompleteManifest(String),
}
