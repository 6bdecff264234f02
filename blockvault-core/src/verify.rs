//! Backup set verification and the post-backup audit.
//!
//! [`Verifier::verify`] is what `verify` and the restore engine run:
//! ledger against manifest, every digest, every image present, a table
//! source for partitioned sets, an integrity check for whole-disk sets, and
//! optionally a comparison against a live device.
//!
//! [`Verifier::audit`] is the stricter check the backup engine runs once the
//! last image is written. On top of the above it requires inventory and
//! manifest to agree on the partition count, every image to be non-empty, and
//! every image to pass its format's integrity check.
use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::backup_set::{AuditedImage, BackupSet, ImageTarget, ManifestEntry};
use crate::capability::{CHKIMG_TOOL, ImageFormat};
use crate::device::{BackupMode, UNKNOWN_FS};
use crate::error::{Error, Result, VerifyFailure};
use crate::exec::ToolCommand;
use crate::inventory;
use crate::platform::Host;
use crate::raw;

/// Why a check stopped: the set is bad, or we could not look at it.
enum Fault {
    Failed(VerifyFailure),
    Error(Error),
}

impl From<VerifyFailure> for Fault {
    fn from(f: VerifyFailure) -> Self {
        Fault::Failed(f)
    }
}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        Fault::Error(e)
    }
}

type Check<T> = std::result::Result<T, Fault>;

/// Outcome of an audit. `failure` is `None` when the set is valid.
#[derive(Debug, Default)]
pub struct AuditReport {
    pub inventory_count: usize,
    /// Images that passed every check, in manifest order.
    pub images: Vec<AuditedImage>,
    pub failure: Option<VerifyFailure>,
}

impl AuditReport {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct Verifier<'a> {
    host: &'a dyn Host,
}

impl<'a> Verifier<'a> {
    pub fn new(host: &'a dyn Host) -> Self {
        Self { host }
    }

    /// Re-validates `set`, and compares it against `compare_device` when one
    /// is given. The comparison only applies to partitioned sets.
    pub fn verify(&self, set: &BackupSet, compare_device: Option<&Path>) -> Result<()> {
        info!(backup = %set.dir.display(), mode = %set.mode(), "Verifying backup set");
        match self.verify_inner(set, compare_device) {
            Ok(()) => {
                info!(backup = %set.dir.display(), "Backup set verified");
                Ok(())
            }
            Err(Fault::Failed(f)) => Err(Error::Verification(f)),
            Err(Fault::Error(e)) => Err(e),
        }
    }

    fn verify_inner(&self, set: &BackupSet, compare_device: Option<&Path>) -> Check<()> {
        check_manifest_shape(set)?;
        check_ledger(set)?;
        for entry in &set.manifest {
            check_image(set, entry)?;
        }

        match set.mode() {
            BackupMode::WholeDisk => {
                for entry in &set.manifest {
                    self.integrity(set, entry)?;
                }
            }
            BackupMode::Partitioned => {
                if set.table_dump().is_none() && set.edges().is_none() {
                    return Err(VerifyFailure::MissingTableSource.into());
                }
            }
        }

        if let Some(device) = compare_device {
            self.compare(set, device)?;
        }
        Ok(())
    }

    /// Runs the post-backup audit. Only I/O and enumeration problems are
    /// returned as errors; a bad set is reported through
    /// [`AuditReport::failure`].
    pub fn audit(&self, set: &BackupSet) -> Result<AuditReport> {
        let mut report = AuditReport::default();
        match self.audit_inner(set, &mut report) {
            Ok(()) => Ok(report),
            Err(Fault::Failed(f)) => {
                warn!(backup = %set.dir.display(), failure = %f, "Audit failed");
                report.failure = Some(f);
                Ok(report)
            }
            Err(Fault::Error(e)) => Err(e),
        }
    }

    fn audit_inner(&self, set: &BackupSet, report: &mut AuditReport) -> Check<()> {
        let inventory = set.inventory()?;
        report.inventory_count = inventory.len();

        check_manifest_shape(set)?;
        if set.mode() == BackupMode::Partitioned && inventory.len() != set.manifest.len() {
            return Err(VerifyFailure::IncompleteManifest(format!(
                "inventory lists {} partitions but manifest has {} images",
                inventory.len(),
                set.manifest.len()
            ))
            .into());
        }
        check_ledger(set)?;

        for entry in &set.manifest {
            let bytes = check_image(set, entry)?;
            if bytes == 0 {
                return Err(VerifyFailure::EmptyImage(entry.image.clone()).into());
            }
            let integrity = self.integrity(set, entry)?;
            report.images.push(AuditedImage {
                image: entry.image.clone(),
                method: entry.method.to_string(),
                format: entry.format,
                bytes,
                integrity: integrity.to_string(),
            });
        }

        if set.mode() == BackupMode::Partitioned
            && set.table_dump().is_none()
            && set.edges().is_none()
        {
            return Err(VerifyFailure::MissingTableSource.into());
        }
        Ok(())
    }

    /// Format-specific structural check. Returns `"ok"`, or `"skipped"` when
    /// no checker exists on this host for the image's format.
    fn integrity(&self, set: &BackupSet, entry: &ManifestEntry) -> Check<&'static str> {
        let path = set.path_of(&entry.image);
        match entry.format {
            ImageFormat::Gzip => match raw::gzip_self_test(&path) {
                Ok(bytes) => {
                    debug!(image = %entry.image, bytes, "gzip self-test passed");
                    Ok("ok")
                }
                Err(e) => Err(VerifyFailure::Integrity {
                    file: entry.image.clone(),
                    reason: e.to_string(),
                }
                .into()),
            },
            ImageFormat::Partclone => {
                if !self.host.has_tool(CHKIMG_TOOL) {
                    debug!(image = %entry.image, "{CHKIMG_TOOL} not available, structural check skipped");
                    return Ok("skipped");
                }
                let command = ToolCommand::new(CHKIMG_TOOL).arg("-s").path_arg(&path);
                match self.host.run(&command) {
                    Ok(_) => Ok("ok"),
                    Err(e) => Err(VerifyFailure::Integrity {
                        file: entry.image.clone(),
                        reason: e.to_string(),
                    }
                    .into()),
                }
            }
        }
    }

    fn compare(&self, set: &BackupSet, device: &Path) -> Check<()> {
        if set.mode() == BackupMode::WholeDisk {
            info!(
                device = %device.display(),
                "Whole-disk backup; skipping partition comparison"
            );
            return Ok(());
        }

        let live = inventory::enumerate(self.host, device)?;
        if live.len() != set.manifest.len() {
            return Err(VerifyFailure::PartitionCountMismatch {
                expected: set.manifest.len(),
                found: live.len(),
            }
            .into());
        }

        for entry in &set.manifest {
            let ImageTarget::Partition(number) = entry.target else {
                continue;
            };
            if entry.fs_type == UNKNOWN_FS {
                continue;
            }
            let found = live
                .iter()
                .find(|p| p.number == number)
                .map(|p| p.fs_type.clone())
                .unwrap_or_else(|| "missing".to_string());
            if found != entry.fs_type {
                return Err(VerifyFailure::FsTypeMismatch {
                    partition: number,
                    expected: entry.fs_type.clone(),
                    found,
                }
                .into());
            }
        }
        debug!(device = %device.display(), "Live device matches backup layout");
        Ok(())
    }
}

fn check_manifest_shape(set: &BackupSet) -> Check<()> {
    match (set.mode(), set.manifest.len()) {
        (_, 0) => Err(VerifyFailure::IncompleteManifest("no images listed".to_string()).into()),
        (BackupMode::WholeDisk, 1) | (BackupMode::Partitioned, _) => Ok(()),
        (BackupMode::WholeDisk, n) => Err(VerifyFailure::IncompleteManifest(format!(
            "whole-disk set lists {n} images"
        ))
        .into()),
    }
}

/// The ledger must name exactly the manifest's images, each once.
fn check_ledger(set: &BackupSet) -> Check<()> {
    let mut manifest = BTreeSet::new();
    for entry in &set.manifest {
        if !manifest.insert(entry.image.as_str()) {
            return Err(VerifyFailure::LedgerMismatch(format!(
                "{} appears twice in the manifest",
                entry.image
            ))
            .into());
        }
    }

    let mut ledger = BTreeSet::new();
    for entry in &set.checksums {
        if !ledger.insert(entry.image.as_str()) {
            return Err(VerifyFailure::LedgerMismatch(format!(
                "{} has more than one checksum",
                entry.image
            ))
            .into());
        }
    }

    if let Some(missing) = manifest.difference(&ledger).next() {
        return Err(VerifyFailure::LedgerMismatch(format!("no checksum for {missing}")).into());
    }
    if let Some(extra) = ledger.difference(&manifest).next() {
        return Err(
            VerifyFailure::LedgerMismatch(format!("{extra} is not in the manifest")).into(),
        );
    }
    Ok(())
}

/// Checks that the image exists and matches its ledger digest. Returns its
/// size on disk.
fn check_image(set: &BackupSet, entry: &ManifestEntry) -> Check<u64> {
    let path = set.path_of(&entry.image);
    let size = match std::fs::metadata(&path) {
        Ok(m) if m.is_file() => m.len(),
        Ok(_) => return Err(VerifyFailure::MissingImage(entry.image.clone()).into()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VerifyFailure::MissingImage(entry.image.clone()).into());
        }
        Err(e) => return Err(Error::io(path, e).into()),
    };

    let expected = set
        .checksums
        .iter()
        .find(|c| c.image == entry.image)
        .map(|c| c.digest.as_str())
        .ok_or_else(|| VerifyFailure::LedgerMismatch(format!("no checksum for {}", entry.image)))?;
    let actual = raw::sha256_file(&path).map_err(|e| Error::io(&path, e))?;
    if actual != expected {
        return Err(VerifyFailure::ChecksumMismatch(entry.image.clone()).into());
    }
    Ok(size)
}
