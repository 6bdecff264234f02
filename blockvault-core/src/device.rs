use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Filesystem type recorded when enumeration could not identify one.
pub const UNKNOWN_FS: &str = "unknown";

/// Represents a whole disk discovered on the system.
///
/// This struct is populated by [`crate::platform::Host::list_disks`] and is
/// what the device resolver auto-detects from and what the front-end shows
/// in its device picker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda` or `/dev/nvme0n1`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// The total size of the device in bytes.
    pub size_bytes: u64,
    /// Whether the kernel flags the device as removable.
    pub removable: bool,
    /// Model string, if the kernel reports one.
    pub model: String,
}

impl Device {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.removable {
            "[Removable]"
        } else {
            "[Fixed]"
        };

        write!(
            f,
            "{:<15} {:>8.1} GB {:<12} {}",
            self.path.display(),
            self.size_gb(),
            kind,
            self.model
        )
    }
}

/// One partition of a device, as captured before any operation begins.
///
/// Descriptors are immutable snapshots; an empty filesystem type from the
/// enumeration service is normalized to [`UNKNOWN_FS`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub number: u32,
    pub path: PathBuf,
    pub fs_type: String,
    pub size_bytes: u64,
    pub part_uuid: String,
    pub fs_uuid: String,
}

/// Lowercases a filesystem type and maps empty input to [`UNKNOWN_FS`].
pub fn normalize_fs_type(raw: &str) -> String {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        UNKNOWN_FS.to_string()
    } else {
        trimmed
    }
}

/// Whether a backup set holds one image per partition or one image of the
/// whole device. Fixed when the set is created and recorded in its metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupMode {
    Partitioned,
    WholeDisk,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Partitioned => "partitioned",
            BackupMode::WholeDisk => "whole-disk",
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partitioned" => Ok(BackupMode::Partitioned),
            "whole-disk" => Ok(BackupMode::WholeDisk),
            other => Err(format!("unknown backup mode '{other}'")),
        }
    }
}
