//! The restore engine.
//!
//! Restore replays a backup set onto a device, which may be a different
//! physical disk from the one that was backed up. Nothing on the target is
//! touched until the set has passed verification, the target has passed its
//! own preflight, and the user has typed the confirmation phrase.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backup_set::{self, BackupSet, ImageTarget, ManifestEntry};
use crate::backup::TABLE_TOOL;
use crate::capability::{self, Capability, ImageFormat};
use crate::config::Config;
use crate::device::{BackupMode, PartitionDescriptor};
use crate::error::{Error, Result};
use crate::exec::ToolCommand;
use crate::inventory;
use crate::platform::Host;
use crate::progress::{NoProgress, Progress, Stage};
use crate::raw;
use crate::verify::Verifier;

/// What the user must type to let a restore proceed.
pub const CONFIRMATION_PHRASE: &str = "ERASE";

const WIPE_TOOL: &str = "wipefs";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Asks the user for the confirmation phrase.
pub trait Confirmer {
    /// Shows `prompt` and returns the text the user entered.
    fn ask(&self, prompt: &str) -> Result<String>;
}

impl<F> Confirmer for F
where
    F: Fn(&str) -> Result<String>,
{
    fn ask(&self, prompt: &str) -> Result<String> {
        self(prompt)
    }
}

/// One image written back to the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoredImage {
    pub target: ImageTarget,
    pub device: PathBuf,
    /// The method that actually wrote the data.
    pub method: Capability,
}

#[derive(Clone, Debug)]
pub struct RestoreSummary {
    pub device: PathBuf,
    pub mode: BackupMode,
    pub restored: Vec<RestoredImage>,
}

pub struct RestoreEngine<'a> {
    config: &'a Config,
    host: &'a dyn Host,
    confirmer: &'a dyn Confirmer,
    progress: &'a dyn Progress,
    running: &'a AtomicBool,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(config: &'a Config, host: &'a dyn Host, confirmer: &'a dyn Confirmer) -> Self {
        Self {
            config,
            host,
            confirmer,
            progress: &NoProgress,
            running: &raw::ALWAYS_RUNNING,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_running(mut self, running: &'a AtomicBool) -> Self {
        self.running = running;
        self
    }

    /// Restores the backup set at `backup` onto `device`.
    pub fn run(&self, backup: &Path, device: &Path) -> Result<RestoreSummary> {
        info!(backup = %backup.display(), device = %device.display(), "Starting restore");

        self.progress.stage(Stage::Validate);
        let set = self.validate(backup)?;

        self.progress.stage(Stage::Preflight);
        self.preflight(&set, device)?;

        self.progress.stage(Stage::Confirmation);
        self.confirm(device)?;

        self.progress.stage(Stage::Unmount);
        self.unmount_all(device);

        self.progress.stage(Stage::Wipe);
        self.wipe(&set, device)?;

        let restored = match set.mode() {
            BackupMode::WholeDisk => self.restore_whole_disk(&set, device)?,
            BackupMode::Partitioned => {
                self.progress.stage(Stage::TableRestore);
                self.restore_table(&set, device)?;

                self.progress.stage(Stage::Settle);
                let nodes = self.settle_partitions(&set, device)?;

                self.progress.stage(Stage::PartitionRestore);
                let mut entries: Vec<&ManifestEntry> = set.manifest.iter().collect();
                entries.sort_by_key(|e| e.target);
                let mut restored = Vec::with_capacity(entries.len());
                for entry in entries {
                    self.check_running()?;
                    let ImageTarget::Partition(number) = entry.target else {
                        continue;
                    };
                    let node = nodes.get(&number).ok_or_else(|| Error::Restore {
                        partition: format!("{} partition {number}", device.display()),
                        reason: "partition node not found after table restore".to_string(),
                    })?;
                    let method = self.restore_partition(&set, entry, node)?;
                    restored.push(RestoredImage {
                        target: entry.target,
                        device: node.clone(),
                        method,
                    });
                }
                restored
            }
        };

        self.progress.stage(Stage::Settle);
        self.reread(device);
        self.host.settle(self.config.settle_timeout());

        self.progress.stage(Stage::Done);
        info!(device = %device.display(), images = restored.len(), "Restore complete");
        Ok(RestoreSummary {
            device: device.to_path_buf(),
            mode: set.mode(),
            restored,
        })
    }

    fn check_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    fn validate(&self, backup: &Path) -> Result<BackupSet> {
        let set = BackupSet::open(backup)?;
        if !backup_set::audit_passed(backup) {
            return Err(Error::InvalidBackupSet {
                path: backup.to_path_buf(),
                reason: format!("{} is missing or did not pass", backup_set::AUDIT_FILE),
            });
        }
        Verifier::new(self.host).verify(&set, None)?;
        Ok(set)
    }

    fn preflight(&self, set: &BackupSet, device: &Path) -> Result<()> {
        if self.config.require_root && !self.host.is_privileged() {
            return Err(Error::NotPrivileged);
        }
        let available = raw::device_size(device)?;
        let needed = set.metadata.source_size_bytes;
        if available < needed {
            return Err(Error::TargetTooSmall {
                device: device.to_path_buf(),
                needed,
                available,
            });
        }
        debug!(device = %device.display(), available, needed, "Target size ok");
        Ok(())
    }

    fn confirm(&self, device: &Path) -> Result<()> {
        if self.config.assume_yes {
            warn!(device = %device.display(), "Confirmation skipped (assume_yes)");
            return Ok(());
        }
        let prompt = format!(
            "All data on {} will be destroyed. Type {CONFIRMATION_PHRASE} to continue",
            device.display()
        );
        let answer = self.confirmer.ask(&prompt)?;
        if answer.trim() == CONFIRMATION_PHRASE {
            Ok(())
        } else {
            info!("Restore declined at confirmation");
            Err(Error::ConfirmationDeclined)
        }
    }

    /// Best effort: failures are logged and the restore continues. Covers the
    /// disk itself, which may carry a filesystem with no partition table.
    fn unmount_all(&self, device: &Path) {
        let mut paths = vec![device.to_path_buf()];
        match inventory::enumerate(self.host, device) {
            Ok(partitions) => paths.extend(partitions.into_iter().map(|p| p.path)),
            Err(e) => debug!(device = %device.display(), error = %e, "No partitions to unmount"),
        }
        for path in paths {
            let Some(mount_point) = self.host.mount_point(&path) else {
                continue;
            };
            match self.host.unmount(&path) {
                Ok(()) => info!(
                    partition = %path.display(),
                    mount_point = %mount_point.display(),
                    "Unmounted"
                ),
                Err(e) => warn!(
                    partition = %path.display(),
                    error = %e,
                    "Unmount failed, continuing"
                ),
            }
        }
    }

    fn wipe(&self, set: &BackupSet, device: &Path) -> Result<()> {
        if self.host.has_tool(WIPE_TOOL) {
            let command = ToolCommand::new(WIPE_TOOL).arg("--all").path_arg(device);
            match self.host.run(&command) {
                Ok(_) => return Ok(()),
                Err(e) => warn!(error = %e, "wipefs failed, zeroing device edges instead"),
            }
        }
        raw::zero_edges(device, set.metadata.edge_bytes)
    }

    /// Replays the sfdisk dump, or the raw edges when that is not possible.
    fn restore_table(&self, set: &BackupSet, device: &Path) -> Result<()> {
        if let Some(dump) = set.table_dump() {
            if self.host.has_tool(TABLE_TOOL) {
                let command = ToolCommand::new(TABLE_TOOL).path_arg(device).stdin_file(dump);
                match self.host.run(&command) {
                    Ok(_) => {
                        info!(device = %device.display(), "Partition table restored from dump");
                        return Ok(());
                    }
                    Err(e) => error!(error = %e, "Table dump replay failed, trying raw edges"),
                }
            } else {
                info!("{TABLE_TOOL} not installed, restoring raw edges");
            }
        }

        let (head, tail) = set.edges().ok_or_else(|| Error::Restore {
            partition: device.display().to_string(),
            reason: "no usable partition table source".to_string(),
        })?;
        raw::restore_edges(&head, &tail, device)?;
        info!(device = %device.display(), "Partition table restored from raw edges");
        Ok(())
    }

    fn reread(&self, device: &Path) {
        if let Err(e) = self.host.reread_partition_table(device) {
            warn!(device = %device.display(), error = %e, "Partition table re-read failed");
        }
    }

    /// Re-reads the table and waits until every partition the manifest names
    /// has a node. Returns partition number -> node.
    fn settle_partitions(&self, set: &BackupSet, device: &Path) -> Result<BTreeMap<u32, PathBuf>> {
        self.reread(device);
        let timeout = self.config.settle_timeout();
        self.host.settle(timeout);

        let expected: Vec<u32> = set
            .manifest
            .iter()
            .filter_map(|e| match e.target {
                ImageTarget::Partition(n) => Some(n),
                ImageTarget::WholeDisk => None,
            })
            .collect();

        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(partitions) = self.host.list_partitions(device) {
                if let Some(nodes) = nodes_for(&partitions, &expected) {
                    debug!(device = %device.display(), count = nodes.len(), "Partition nodes present");
                    return Ok(nodes);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Restore {
                    partition: device.display().to_string(),
                    reason: format!(
                        "partition nodes did not appear within {}s",
                        timeout.as_secs()
                    ),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Restores one partition. A specialized image falls back to the generic
    /// method only when it is stored as gzip.
    fn restore_partition(&self, set: &BackupSet, entry: &ManifestEntry, node: &Path) -> Result<Capability> {
        let image = set.path_of(&entry.image);
        let label = entry.label();

        if let Capability::Specialized(program) = entry.method {
            let failure = if self.host.has_tool(program) {
                self.progress.transfer_start(&label, 0);
                let command = ToolCommand::new(program)
                    .arg("-r")
                    .arg("-s")
                    .path_arg(&image)
                    .arg("-o")
                    .path_arg(node);
                match self.host.run(&command) {
                    Ok(_) => {
                        info!(image = %entry.image, node = %node.display(), method = program, "Restored");
                        self.progress.transfer_done(&label, program);
                        return Ok(entry.method);
                    }
                    Err(e) => e.to_string(),
                }
            } else {
                format!("{program} is not installed")
            };

            if entry.format != ImageFormat::Gzip {
                return Err(Error::Restore {
                    partition: node.display().to_string(),
                    reason: format!("{failure}; {} image has no generic fallback", entry.format),
                });
            }
            warn!(image = %entry.image, reason = %failure, "Falling back to {}", capability::GENERIC_METHOD);
        }

        self.restore_generic(&image, node, &label)?;
        info!(image = %entry.image, node = %node.display(), method = capability::GENERIC_METHOD, "Restored");
        Ok(Capability::Generic)
    }

    fn restore_generic(&self, image: &Path, target: &Path, label: &str) -> Result<()> {
        raw::restore(
            image,
            target,
            self.running,
            |total| self.progress.transfer_start(label, total),
            |bytes| self.progress.transfer_progress(bytes),
        )
        .map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            other => Error::Restore {
                partition: target.display().to_string(),
                reason: other.to_string(),
            },
        })?;
        self.progress.transfer_done(label, capability::GENERIC_METHOD);
        Ok(())
    }

    fn restore_whole_disk(&self, set: &BackupSet, device: &Path) -> Result<Vec<RestoredImage>> {
        let mut restored = Vec::new();
        self.progress.stage(Stage::PartitionRestore);
        for entry in &set.manifest {
            self.restore_generic(&set.path_of(&entry.image), device, "whole disk")?;
            restored.push(RestoredImage {
                target: entry.target,
                device: device.to_path_buf(),
                method: Capability::Generic,
            });
        }
        Ok(restored)
    }
}

fn nodes_for(partitions: &[PartitionDescriptor], expected: &[u32]) -> Option<BTreeMap<u32, PathBuf>> {
    expected
        .iter()
        .map(|n| {
            partitions
                .iter()
                .find(|p| p.number == *n && p.path.exists())
                .map(|p| (*n, p.path.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(number: u32, path: &Path) -> PartitionDescriptor {
        PartitionDescriptor {
            number,
            path: path.to_path_buf(),
            fs_type: "ext4".to_string(),
            size_bytes: 0,
            part_uuid: String::new(),
            fs_uuid: String::new(),
        }
    }

    #[test]
    fn nodes_require_every_expected_partition() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("p1");
        let p2 = dir.path().join("p2");
        std::fs::write(&p1, b"").unwrap();

        let parts = vec![part(1, &p1), part(2, &p2)];
        assert!(nodes_for(&parts, &[1, 2]).is_none());

        std::fs::write(&p2, b"").unwrap();
        let nodes = nodes_for(&parts, &[1, 2]).unwrap();
        assert_eq!(nodes[&2], p2);
    }

    #[test]
    fn closure_confirmer() {
        let confirmer = |prompt: &str| -> Result<String> {
            assert!(prompt.contains(CONFIRMATION_PHRASE));
            Ok(" ERASE \n".to_string())
        };
        assert_eq!(confirmer.ask("Type ERASE").unwrap().trim(), CONFIRMATION_PHRASE);
    }
}
