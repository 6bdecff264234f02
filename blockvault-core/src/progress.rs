//! Progress reporting for front-ends.
use std::fmt;

/// Steps of a backup or restore run, in the order they happen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Preflight,
    MountGuard,
    DirectoryPrep,
    MetadataCapture,
    InventoryCapture,
    Capture,
    ManifestFinalize,
    Audit,
    Validate,
    Confirmation,
    Unmount,
    Wipe,
    TableRestore,
    Settle,
    PartitionRestore,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preflight => "Preflight checks",
            Stage::MountGuard => "Checking mounts",
            Stage::DirectoryPrep => "Preparing backup directory",
            Stage::MetadataCapture => "Saving partition table",
            Stage::InventoryCapture => "Saving partition inventory",
            Stage::Capture => "Capturing images",
            Stage::ManifestFinalize => "Finalizing manifest",
            Stage::Audit => "Auditing backup",
            Stage::Validate => "Validating backup set",
            Stage::Confirmation => "Awaiting confirmation",
            Stage::Unmount => "Unmounting target",
            Stage::Wipe => "Wiping target",
            Stage::TableRestore => "Restoring partition table",
            Stage::Settle => "Waiting for devices to settle",
            Stage::PartitionRestore => "Restoring images",
            Stage::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Receives progress updates from the engines.
///
/// Methods take `&self` so a reporter can be handed to several callbacks at
/// once; implementations use interior mutability (indicatif bars already do).
pub trait Progress {
    fn stage(&self, _stage: Stage) {}

    /// A byte transfer for `label` (e.g. "part 2 (ext4)") is starting.
    fn transfer_start(&self, _label: &str, _total_bytes: u64) {}

    fn transfer_progress(&self, _bytes: u64) {}

    /// The transfer finished; `method` is what was actually used.
    fn transfer_done(&self, _label: &str, _method: &str) {}
}

/// Discards all updates.
pub struct NoProgress;

impl Progress for NoProgress {}
