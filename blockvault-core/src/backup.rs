//! The backup engine.
//!
//! A run moves through [`Stage`]s strictly in order: preflight, mount guard,
//! directory preparation, metadata capture, inventory capture, one capture per
//! partition (or a single whole-disk capture), manifest finalization, and
//! the mandatory audit. Any error aborts the run; images already written stay
//! on disk together with a manifest and ledger describing exactly those
//! images.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::backup_set::{
    self, BackupSet, ImageTarget, LedgerWriter, ManifestEntry, Metadata, TABLE_DUMP_FILE,
    TableMethod, WHOLE_DISK_IMAGE,
};
use crate::capability::{self, Capability};
use crate::config::Config;
use crate::device::{BackupMode, PartitionDescriptor};
use crate::error::{Error, Result};
use crate::exec::ToolCommand;
use crate::inventory;
use crate::platform::Host;
use crate::progress::{NoProgress, Progress, Stage};
use crate::raw;
use crate::verify::{AuditReport, Verifier};

/// Tools every backup needs regardless of filesystem types.
pub const REQUIRED_TOOLS: &[&str] = &["lsblk", "blkid"];

/// Partition table dump/apply tool.
pub const TABLE_TOOL: &str = "sfdisk";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolStatus {
    pub name: String,
    pub present: bool,
}

/// What preflight intends to do with one partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedCapture {
    pub partition: PartitionDescriptor,
    pub capability: Capability,
    pub available: bool,
}

impl PlannedCapture {
    /// The method capture will start with.
    pub fn intended(&self) -> Capability {
        if self.available {
            self.capability
        } else {
            Capability::Generic
        }
    }
}

/// Result of a side-effect-free preflight.
#[derive(Clone, Debug)]
pub struct PreflightReport {
    pub device: PathBuf,
    pub mode: BackupMode,
    pub privileged: bool,
    pub required_tools: Vec<ToolStatus>,
    /// Whether the in-process gzip codec passed its self-test.
    pub codec_ok: bool,
    pub table_tool: bool,
    pub plan: Vec<PlannedCapture>,
}

impl PreflightReport {
    /// Fails unless a backup can start: privileges (when required), every
    /// required tool, and a working generic codec.
    pub fn ensure_ready(&self, require_root: bool) -> Result<()> {
        if require_root && !self.privileged {
            return Err(Error::NotPrivileged);
        }
        if let Some(missing) = self.required_tools.iter().find(|t| !t.present) {
            return Err(Error::MissingRequiredTool(missing.name.clone()));
        }
        if !self.codec_ok {
            return Err(Error::MissingRequiredTool(format!(
                "{} codec",
                capability::GENERIC_METHOD
            )));
        }
        Ok(())
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionDescriptor> {
        self.plan.iter().map(|p| &p.partition)
    }
}

#[derive(Debug)]
pub struct BackupSummary {
    pub dir: PathBuf,
    pub mode: BackupMode,
    pub entries: Vec<ManifestEntry>,
    pub audit: AuditReport,
}

pub struct BackupEngine<'a> {
    config: &'a Config,
    host: &'a dyn Host,
    progress: &'a dyn Progress,
    running: &'a AtomicBool,
}

impl<'a> BackupEngine<'a> {
    pub fn new(config: &'a Config, host: &'a dyn Host) -> Self {
        Self {
            config,
            host,
            progress: &NoProgress,
            running: &raw::ALWAYS_RUNNING,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Checked between partitions and between buffers of a raw capture.
    pub fn with_running(mut self, running: &'a AtomicBool) -> Self {
        self.running = running;
        self
    }

    /// Reports what a backup of `device` would do, without doing any of it.
    pub fn preflight(&self, device: &Path, mode: BackupMode) -> Result<PreflightReport> {
        let required_tools = REQUIRED_TOOLS
            .iter()
            .map(|name| ToolStatus {
                name: name.to_string(),
                present: self.host.has_tool(name),
            })
            .collect();

        let plan = inventory::enumerate(self.host, device)?
            .into_iter()
            .map(|partition| {
                let capability = capability::capability_for(&partition.fs_type);
                PlannedCapture {
                    available: capability::is_available(self.host, capability),
                    capability,
                    partition,
                }
            })
            .collect();

        Ok(PreflightReport {
            device: device.to_path_buf(),
            mode,
            privileged: self.host.is_privileged(),
            required_tools,
            codec_ok: raw::codec_self_test(),
            table_tool: self.host.has_tool(TABLE_TOOL),
            plan,
        })
    }

    /// Backs `device` up into `dest`, which must not exist or be empty.
    pub fn run(&self, device: &Path, dest: &Path, mode: BackupMode) -> Result<BackupSummary> {
        info!(device = %device.display(), dest = %dest.display(), %mode, "Starting backup");

        self.progress.stage(Stage::Preflight);
        let report = self.preflight(device, mode)?;
        report.ensure_ready(self.config.require_root)?;
        if mode == BackupMode::Partitioned && report.plan.is_empty() {
            return Err(Error::Enumeration(format!(
                "{} has no partitions; use whole-disk mode",
                device.display()
            )));
        }
        for planned in &report.plan {
            debug!(
                partition = planned.partition.number,
                fs_type = %planned.partition.fs_type,
                method = %planned.intended(),
                "Planned capture"
            );
        }

        self.progress.stage(Stage::MountGuard);
        self.guard_mounts(device, &report)?;

        self.progress.stage(Stage::DirectoryPrep);
        prepare_destination(dest)?;

        self.progress.stage(Stage::MetadataCapture);
        self.capture_metadata(device, dest, mode)?;

        self.progress.stage(Stage::InventoryCapture);
        let partitions: Vec<PartitionDescriptor> = report.partitions().cloned().collect();
        backup_set::write_inventory(dest, &partitions)?;

        self.progress.stage(Stage::Capture);
        let mut ledger = LedgerWriter::create(dest)?;
        match mode {
            BackupMode::Partitioned => {
                for partition in &partitions {
                    self.check_running()?;
                    let entry = self.capture_partition(dest, partition)?;
                    self.record(&mut ledger, dest, &entry)?;
                }
            }
            BackupMode::WholeDisk => {
                let entry = self.capture_whole_disk(device, dest)?;
                self.record(&mut ledger, dest, &entry)?;
            }
        }
        drop(ledger);

        self.progress.stage(Stage::ManifestFinalize);
        let set = BackupSet::open(dest)?;
        info!(images = set.manifest.len(), "Manifest finalized");

        self.progress.stage(Stage::Audit);
        let audit = Verifier::new(self.host).audit(&set)?;
        backup_set::write_audit_report(
            dest,
            mode,
            audit.inventory_count,
            &audit.images,
            audit.failure.as_ref().map(|f| f.to_string()).as_deref(),
        )?;
        if let Some(failure) = audit.failure.clone() {
            error!(dest = %dest.display(), %failure, "Backup is not valid");
            return Err(Error::Audit(failure));
        }

        self.progress.stage(Stage::Done);
        info!(dest = %dest.display(), "Backup complete");
        Ok(BackupSummary {
            dir: dest.to_path_buf(),
            mode,
            entries: set.manifest,
            audit,
        })
    }

    fn check_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    /// Refuses the disk itself or any of its partitions while mounted.
    fn guard_mounts(&self, device: &Path, report: &PreflightReport) -> Result<()> {
        let paths = std::iter::once(device).chain(report.partitions().map(|p| p.path.as_path()));
        for path in paths {
            let Some(mount_point) = self.host.mount_point(path) else {
                continue;
            };
            if self.config.allow_mounted {
                warn!(
                    partition = %path.display(),
                    mount_point = %mount_point.display(),
                    "Imaging a mounted filesystem; the image may be inconsistent"
                );
            } else {
                return Err(Error::MountedSource {
                    partition: path.to_path_buf(),
                    mount_point,
                });
            }
        }
        Ok(())
    }

    /// Saves the table dump (when the tool works), the raw edges, and
    /// `metadata.txt`.
    fn capture_metadata(&self, device: &Path, dest: &Path, mode: BackupMode) -> Result<()> {
        let table_method = match self.dump_table(device, dest) {
            Ok(()) => TableMethod::Sfdisk,
            Err(e) => {
                warn!(device = %device.display(), error = %e, "Partition table dump unavailable, relying on raw edges");
                TableMethod::RawEdges
            }
        };

        let (head, tail) = backup_set::edge_file_names(self.config.edge_bytes);
        raw::save_edges(
            device,
            &dest.join(head),
            &dest.join(tail),
            self.config.edge_bytes,
            self.config.compression_level,
        )?;

        Metadata {
            source_device: device.to_path_buf(),
            source_size_bytes: raw::device_size(device)?,
            backup_time: Utc::now(),
            hostname: self.host.host_name(),
            kernel: self.host.kernel_version(),
            table_method,
            mode,
            edge_bytes: self.config.edge_bytes,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
        .write(dest)
    }

    fn dump_table(&self, device: &Path, dest: &Path) -> Result<()> {
        if !self.host.has_tool(TABLE_TOOL) {
            return Err(Error::MissingRequiredTool(TABLE_TOOL.to_string()));
        }
        let output = self
            .host
            .run(&ToolCommand::new(TABLE_TOOL).arg("--dump").path_arg(device))?;
        let path = dest.join(TABLE_DUMP_FILE);
        fs::write(&path, output.stdout).map_err(|e| Error::io(path, e))
    }

    /// Captures one partition: the specialized tool first when it is
    /// installed, then the generic method once if that fails.
    fn capture_partition(&self, dest: &Path, partition: &PartitionDescriptor) -> Result<ManifestEntry> {
        let label = format!("partition {} ({})", partition.number, partition.fs_type);
        let capability = capability::capability_for(&partition.fs_type);

        if let Capability::Specialized(program) = capability {
            if self.host.has_tool(program) {
                let entry = entry_for(partition, capability);
                let image = dest.join(&entry.image);
                self.progress.transfer_start(&label, partition.size_bytes);
                match self.capture_specialized(program, partition, &image) {
                    Ok(()) => {
                        info!(partition = partition.number, method = program, "Captured");
                        self.progress.transfer_done(&label, program);
                        return Ok(entry);
                    }
                    Err(e) => {
                        warn!(
                            partition = partition.number,
                            method = program,
                            error = %e,
                            "Specialized capture failed, retrying with {}",
                            capability::GENERIC_METHOD
                        );
                        remove_partial(&image);
                    }
                }
            } else {
                info!(
                    partition = partition.number,
                    "{program} not installed, using {}",
                    capability::GENERIC_METHOD
                );
            }
        }

        let entry = entry_for(partition, Capability::Generic);
        let image = dest.join(&entry.image);
        self.capture_generic(&partition.path, &image, &label)
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                other => Error::Capture {
                    partition: partition.path.display().to_string(),
                    reason: other.to_string(),
                },
            })?;
        info!(partition = partition.number, method = capability::GENERIC_METHOD, "Captured");
        Ok(entry)
    }

    fn capture_specialized(&self, program: &str, partition: &PartitionDescriptor, image: &Path) -> Result<()> {
        let command = ToolCommand::new(program)
            .arg("-c")
            .arg("-s")
            .path_arg(&partition.path)
            .arg("-o")
            .path_arg(image);
        self.host.run(&command)?;
        Ok(())
    }

    fn capture_generic(&self, source: &Path, image: &Path, label: &str) -> Result<()> {
        raw::capture(
            source,
            image,
            self.config.compression_level,
            self.running,
            |total| self.progress.transfer_start(label, total),
            |bytes| self.progress.transfer_progress(bytes),
        )?;
        self.progress.transfer_done(label, capability::GENERIC_METHOD);
        Ok(())
    }

    fn capture_whole_disk(&self, device: &Path, dest: &Path) -> Result<ManifestEntry> {
        let image = dest.join(WHOLE_DISK_IMAGE);
        self.capture_generic(device, &image, "whole disk")
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                other => Error::Capture {
                    partition: device.display().to_string(),
                    reason: other.to_string(),
                },
            })?;
        info!(device = %device.display(), "Captured whole disk");
        Ok(ManifestEntry::whole_disk())
    }

    fn record(&self, ledger: &mut LedgerWriter, dest: &Path, entry: &ManifestEntry) -> Result<()> {
        let path = dest.join(&entry.image);
        let digest = raw::sha256_file(&path).map_err(|e| Error::io(&path, e))?;
        debug!(image = %entry.image, %digest, "Checksum recorded");
        ledger.append(entry, &digest)
    }
}

fn entry_for(partition: &PartitionDescriptor, method: Capability) -> ManifestEntry {
    let format = method.image_format();
    ManifestEntry {
        target: ImageTarget::Partition(partition.number),
        fs_type: partition.fs_type.clone(),
        method,
        image: backup_set::partition_image_name(partition.number, &partition.fs_type, format),
        format,
    }
}

fn remove_partial(image: &Path) {
    match fs::remove_file(image) {
        Ok(()) => debug!(image = %image.display(), "Removed partial image"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(image = %image.display(), error = %e, "Could not remove partial image"),
    }
}

/// Creates `dest`, or accepts it if it is an empty directory.
fn prepare_destination(dest: &Path) -> Result<()> {
    if dest.exists() {
        let mut entries = fs::read_dir(dest).map_err(|e| Error::io(dest, e))?;
        if entries.next().is_some() {
            return Err(Error::BackupSetExists(dest.to_path_buf()));
        }
        return Ok(());
    }
    fs::create_dir_all(dest).map_err(|e| Error::io(dest, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::simulated::SimulatedHost;
    use tempfile::tempdir;

    fn ready_report() -> PreflightReport {
        PreflightReport {
            device: PathBuf::from("/dev/sda"),
            mode: BackupMode::Partitioned,
            privileged: true,
            required_tools: vec![ToolStatus {
                name: "lsblk".to_string(),
                present: true,
            }],
            codec_ok: true,
            table_tool: true,
            plan: Vec::new(),
        }
    }

    #[test]
    fn unprivileged_preflight_fails_only_when_root_required() {
        let report = PreflightReport {
            privileged: false,
            ..ready_report()
        };
        assert!(matches!(report.ensure_ready(true), Err(Error::NotPrivileged)));
        assert!(report.ensure_ready(false).is_ok());
    }

    #[test]
    fn missing_required_tool_is_named() {
        let mut report = ready_report();
        report.required_tools[0].present = false;
        match report.ensure_ready(false).unwrap_err() {
            Error::MissingRequiredTool(name) => assert_eq!(name, "lsblk"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn planned_method_degrades_when_tool_missing() {
        let host = SimulatedHost::new();
        host.set_partitions(
            Path::new("/dev/sdy"),
            vec![PartitionDescriptor {
                number: 1,
                path: PathBuf::from("/dev/sdy1"),
                fs_type: "xfs".to_string(),
                size_bytes: 1,
                part_uuid: String::new(),
                fs_uuid: String::new(),
            }],
        );
        let config = Config::default();
        let engine = BackupEngine::new(&config, &host);

        let report = engine.preflight(Path::new("/dev/sdy"), BackupMode::Partitioned).unwrap();
        assert_eq!(report.plan[0].intended(), Capability::Generic);
        assert!(!report.table_tool);

        host.install_tool("partclone.xfs");
        let report = engine.preflight(Path::new("/dev/sdy"), BackupMode::Partitioned).unwrap();
        assert_eq!(report.plan[0].intended(), Capability::Specialized("partclone.xfs"));
        assert!(host.commands().is_empty());
    }

    #[test]
    fn destination_must_be_new_or_empty() {
        let dir = tempdir().unwrap();
        let fresh = dir.path().join("set");
        prepare_destination(&fresh).unwrap();
        prepare_destination(&fresh).unwrap();

        fs::write(fresh.join("metadata.txt"), "x").unwrap();
        assert!(matches!(
            prepare_destination(&fresh),
            Err(Error::BackupSetExists(_))
        ));
    }
}
