//! The on-disk layout of a backup set.
//!
//! A backup set is a directory:
//!
//! | File                     | Contents                                        |
//! |--------------------------|-------------------------------------------------|
//! | `metadata.txt`           | `key=value` facts about the source and the run  |
//! | `inventory.tsv`          | partition snapshot taken before capture         |
//! | `manifest.tsv`           | one row per image, in capture order             |
//! | `checksums.txt`          | `sha256sum`-compatible ledger of the images     |
//! | `audit_report.txt`       | post-backup audit, last line `result=ok`        |
//! | `partition_table.sfdisk` | `sfdisk --dump` output, when it was available   |
//! | `disk-head-*.bin.gz`     | raw head of the device (table fallback)         |
//! | `disk-tail-*.bin.gz`     | raw tail of the device (table fallback)         |
//! | `part-<n>-<fs>.img[.gz]` | partition images, or `disk.img.gz` for a whole  |
//! |                          | device                                          |
//!
//! The manifest and the checksum ledger only ever grow by complete rows, one
//! pair per finished image, so an interrupted backup leaves a consistent
//! prefix behind. The checksum row is written first and the manifest row
//! commits the pair: until the audit report seals the set, [`BackupSet::open`]
//! ignores a torn final line and a trailing checksum row whose manifest row
//! never landed.
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::capability::{Capability, ImageFormat};
use crate::config::DEFAULT_EDGE_BYTES;
use crate::device::{BackupMode, PartitionDescriptor};
use crate::error::{Error, Result};

pub const METADATA_FILE: &str = "metadata.txt";
pub const INVENTORY_FILE: &str = "inventory.tsv";
pub const MANIFEST_FILE: &str = "manifest.tsv";
pub const CHECKSUMS_FILE: &str = "checksums.txt";
pub const AUDIT_FILE: &str = "audit_report.txt";
pub const TABLE_DUMP_FILE: &str = "partition_table.sfdisk";
pub const WHOLE_DISK_IMAGE: &str = "disk.img.gz";

/// Manifest keyword for the whole-device image row.
const WHOLE_DISK_KEY: &str = "disk";
/// Filesystem column of the whole-device image row.
const WHOLE_DISK_FS: &str = "raw";

const INVENTORY_HEADER: &str = "# number\tdevice\tfstype\tsize_bytes\tpartuuid\tfsuuid";
const MANIFEST_HEADER: &str = "# partition\tfstype\tmethod\timage\tformat";

fn size_label(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes % MIB == 0 {
        format!("{}MiB", bytes / MIB)
    } else if bytes % KIB == 0 {
        format!("{}KiB", bytes / KIB)
    } else {
        format!("{bytes}B")
    }
}

/// File names of the raw head and tail ranges, e.g. `disk-head-2MiB.bin.gz`.
pub fn edge_file_names(edge_bytes: u64) -> (String, String) {
    let label = size_label(edge_bytes);
    (
        format!("disk-head-{label}.bin.gz"),
        format!("disk-tail-{label}.bin.gz"),
    )
}

/// Image file name for one partition, e.g. `part-2-ext4.img.gz`.
pub fn partition_image_name(number: u32, fs_type: &str, format: ImageFormat) -> String {
    format!("part-{number}-{fs_type}.{}", format.extension())
}

fn invalid(dir: &Path, reason: impl Into<String>) -> Error {
    Error::InvalidBackupSet {
        path: dir.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_text(dir: &Path, name: &str) -> Result<String> {
    let path = dir.join(name);
    fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            invalid(dir, format!("{name} is missing"))
        } else {
            Error::io(path, e)
        }
    })
}

fn write_synced(path: &Path, contents: &str) -> Result<()> {
    let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
    file.write_all(contents.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| Error::io(path, e))
}

/// Data lines of a text file: no blanks, no `#` comments.
fn data_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

/// The text up to and including its last newline. Rows are written whole,
/// so anything after that is a write that never finished.
fn committed(text: &str) -> &str {
    match text.rfind('\n') {
        Some(end) => &text[..=end],
        None => "",
    }
}

fn parse_kv(text: &str) -> BTreeMap<String, String> {
    data_lines(text)
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// How the partition table was preserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableMethod {
    /// An `sfdisk --dump` script, plus the raw edges.
    Sfdisk,
    /// Only the raw head and tail ranges.
    RawEdges,
}

impl TableMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableMethod::Sfdisk => "sfdisk",
            TableMethod::RawEdges => "raw-edges",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub source_device: PathBuf,
    pub source_size_bytes: u64,
    pub backup_time: DateTime<Utc>,
    pub hostname: String,
    pub kernel: String,
    pub table_method: TableMethod,
    pub mode: BackupMode,
    pub edge_bytes: u64,
    pub tool_version: String,
}

impl Metadata {
    pub fn to_text(&self) -> String {
        format!(
            "source_device={}\n\
             source_size_bytes={}\n\
             backup_time_utc={}\n\
             hostname={}\n\
             kernel={}\n\
             table_method={}\n\
             mode={}\n\
             edge_bytes={}\n\
             tool_version={}\n",
            self.source_device.display(),
            self.source_size_bytes,
            self.backup_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.hostname,
            self.kernel,
            self.table_method.as_str(),
            self.mode,
            self.edge_bytes,
            self.tool_version,
        )
    }

    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let kv = parse_kv(text);
        let get = |key: &str| {
            kv.get(key)
                .cloned()
                .ok_or_else(|| format!("{METADATA_FILE} has no '{key}'"))
        };

        let table_method = match get("table_method")?.as_str() {
            "sfdisk" => TableMethod::Sfdisk,
            "raw-edges" => TableMethod::RawEdges,
            other => return Err(format!("unknown table_method '{other}'")),
        };
        let backup_time = DateTime::parse_from_rfc3339(&get("backup_time_utc")?)
            .map_err(|e| format!("bad backup_time_utc: {e}"))?
            .with_timezone(&Utc);

        Ok(Self {
            source_device: PathBuf::from(get("source_device")?),
            source_size_bytes: get("source_size_bytes")?
                .parse()
                .map_err(|e| format!("bad source_size_bytes: {e}"))?,
            backup_time,
            hostname: kv.get("hostname").cloned().unwrap_or_default(),
            kernel: kv.get("kernel").cloned().unwrap_or_default(),
            table_method,
            mode: get("mode")?.parse()?,
            edge_bytes: match kv.get("edge_bytes") {
                Some(v) => v.parse().map_err(|e| format!("bad edge_bytes: {e}"))?,
                None => DEFAULT_EDGE_BYTES,
            },
            tool_version: kv.get("tool_version").cloned().unwrap_or_default(),
        })
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        write_synced(&dir.join(METADATA_FILE), &self.to_text())
    }

    pub fn read(dir: &Path) -> Result<Self> {
        Self::parse(&read_text(dir, METADATA_FILE)?).map_err(|reason| invalid(dir, reason))
    }
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() { "-" } else { s }
}

fn from_dash(s: &str) -> String {
    if s == "-" { String::new() } else { s.to_string() }
}

pub fn write_inventory(dir: &Path, partitions: &[PartitionDescriptor]) -> Result<()> {
    let mut text = String::from(INVENTORY_HEADER);
    text.push('\n');
    for p in partitions {
        text.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            p.number,
            p.path.display(),
            p.fs_type,
            p.size_bytes,
            or_dash(&p.part_uuid),
            or_dash(&p.fs_uuid),
        ));
    }
    write_synced(&dir.join(INVENTORY_FILE), &text)
}

pub fn read_inventory(dir: &Path) -> Result<Vec<PartitionDescriptor>> {
    let text = read_text(dir, INVENTORY_FILE)?;
    data_lines(&text)
        .map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() != 6 {
                return Err(invalid(dir, format!("bad inventory row: {line}")));
            }
            Ok(PartitionDescriptor {
                number: cols[0]
                    .parse()
                    .map_err(|_| invalid(dir, format!("bad partition number: {}", cols[0])))?,
                path: PathBuf::from(cols[1]),
                fs_type: cols[2].to_string(),
                size_bytes: cols[3]
                    .parse()
                    .map_err(|_| invalid(dir, format!("bad size: {}", cols[3])))?,
                part_uuid: from_dash(cols[4]),
                fs_uuid: from_dash(cols[5]),
            })
        })
        .collect()
}

/// What a manifest row images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageTarget {
    Partition(u32),
    WholeDisk,
}

impl fmt::Display for ImageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageTarget::Partition(n) => write!(f, "{n}"),
            ImageTarget::WholeDisk => f.write_str(WHOLE_DISK_KEY),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub target: ImageTarget,
    pub fs_type: String,
    /// The method that actually produced the image.
    pub method: Capability,
    /// Image path relative to the backup set directory.
    pub image: String,
    pub format: ImageFormat,
}

impl ManifestEntry {
    pub fn whole_disk() -> Self {
        Self {
            target: ImageTarget::WholeDisk,
            fs_type: WHOLE_DISK_FS.to_string(),
            method: Capability::Generic,
            image: WHOLE_DISK_IMAGE.to_string(),
            format: ImageFormat::Gzip,
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            self.target, self.fs_type, self.method, self.image, self.format
        )
    }

    /// Parses a manifest row. Four-column rows (no format column) get their
    /// format from the image name.
    pub fn parse_line(line: &str) -> std::result::Result<Self, String> {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 4 && cols.len() != 5 {
            return Err(format!("expected 4 or 5 columns: {line}"));
        }

        let target = if cols[0] == WHOLE_DISK_KEY {
            ImageTarget::WholeDisk
        } else {
            ImageTarget::Partition(
                cols[0]
                    .parse()
                    .map_err(|_| format!("bad partition number '{}'", cols[0]))?,
            )
        };
        let image = cols[3].to_string();
        if image.is_empty() || image.contains('/') {
            return Err(format!("image path must be a plain file name: '{image}'"));
        }
        let format = match cols.get(4) {
            Some(f) => f.parse()?,
            None => ImageFormat::infer_from_name(&image),
        };

        Ok(Self {
            target,
            fs_type: cols[1].to_string(),
            method: cols[2].parse()?,
            image,
            format,
        })
    }

    /// Label used in logs and progress output.
    pub fn label(&self) -> String {
        match self.target {
            ImageTarget::Partition(n) => format!("partition {n} ({})", self.fs_type),
            ImageTarget::WholeDisk => "whole disk".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub digest: String,
    pub image: String,
}

impl ChecksumEntry {
    pub fn to_line(&self) -> String {
        format!("{}  {}", self.digest, self.image)
    }

    pub fn parse_line(line: &str) -> std::result::Result<Self, String> {
        let (digest, image) = line
            .split_once("  ")
            .ok_or_else(|| format!("bad checksum line: {line}"))?;
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("bad sha256 digest: {digest}"));
        }
        Ok(Self {
            digest: digest.to_ascii_lowercase(),
            image: image.to_string(),
        })
    }
}

/// Appends manifest rows and their checksums to a new backup set.
pub struct LedgerWriter {
    manifest: File,
    checksums: File,
    dir: PathBuf,
}

impl LedgerWriter {
    /// Creates empty `manifest.tsv` and `checksums.txt` in `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        let open = |name: &str| {
            let path = dir.join(name);
            OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path)
                .map_err(|e| Error::io(path, e))
        };
        let mut manifest = open(MANIFEST_FILE)?;
        let checksums = open(CHECKSUMS_FILE)?;
        writeln!(manifest, "{MANIFEST_HEADER}").map_err(|e| Error::io(dir.join(MANIFEST_FILE), e))?;
        Ok(Self {
            manifest,
            checksums,
            dir: dir.to_path_buf(),
        })
    }

    /// Records one finished image. The checksum row is made durable first,
    /// then the manifest row, each as a single write. The manifest row is
    /// the commit point for the pair.
    pub fn append(&mut self, entry: &ManifestEntry, digest: &str) -> Result<()> {
        let checksum = ChecksumEntry {
            digest: digest.to_string(),
            image: entry.image.clone(),
        };
        let checksums_path = self.dir.join(CHECKSUMS_FILE);
        self.checksums
            .write_all(format!("{}\n", checksum.to_line()).as_bytes())
            .and_then(|_| self.checksums.sync_data())
            .map_err(|e| Error::io(checksums_path, e))?;

        let manifest_path = self.dir.join(MANIFEST_FILE);
        self.manifest
            .write_all(format!("{}\n", entry.to_line()).as_bytes())
            .and_then(|_| self.manifest.sync_data())
            .map_err(|e| Error::io(manifest_path, e))
    }
}

/// A backup set opened for reading.
#[derive(Clone, Debug)]
pub struct BackupSet {
    pub dir: PathBuf,
    pub metadata: Metadata,
    pub manifest: Vec<ManifestEntry>,
    pub checksums: Vec<ChecksumEntry>,
}

impl BackupSet {
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(invalid(dir, "not a directory"));
        }
        let metadata = Metadata::read(dir)?;
        let sealed = dir.join(AUDIT_FILE).exists();

        let manifest_text = read_text(dir, MANIFEST_FILE)?;
        let checksums_text = read_text(dir, CHECKSUMS_FILE)?;
        let (manifest_text, checksums_text) = if sealed {
            (manifest_text.as_str(), checksums_text.as_str())
        } else {
            (committed(&manifest_text), committed(&checksums_text))
        };

        let manifest = data_lines(manifest_text)
            .map(|l| ManifestEntry::parse_line(l).map_err(|r| invalid(dir, r)))
            .collect::<Result<Vec<_>>>()?;

        let mut checksums = data_lines(checksums_text)
            .map(|l| ChecksumEntry::parse_line(l).map_err(|r| invalid(dir, r)))
            .collect::<Result<Vec<_>>>()?;

        if !sealed && checksums.len() == manifest.len() + 1 {
            let orphan = checksums
                .last()
                .is_some_and(|c| !manifest.iter().any(|e| e.image == c.image));
            if orphan {
                if let Some(row) = checksums.pop() {
                    warn!(dir = %dir.display(), image = %row.image, "Ignoring checksum row with no manifest row");
                }
            }
        }

        let whole_disk_rows = manifest
            .iter()
            .filter(|e| e.target == ImageTarget::WholeDisk)
            .count();
        let consistent = match metadata.mode {
            BackupMode::WholeDisk => whole_disk_rows == manifest.len() && manifest.len() <= 1,
            BackupMode::Partitioned => whole_disk_rows == 0,
        };
        if !consistent {
            return Err(invalid(
                dir,
                format!("manifest rows do not match mode={}", metadata.mode),
            ));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            metadata,
            manifest,
            checksums,
        })
    }

    pub fn mode(&self) -> BackupMode {
        self.metadata.mode
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn inventory(&self) -> Result<Vec<PartitionDescriptor>> {
        read_inventory(&self.dir)
    }

    pub fn table_dump(&self) -> Option<PathBuf> {
        let path = self.dir.join(TABLE_DUMP_FILE);
        path.is_file().then_some(path)
    }

    /// The raw head and tail files, if both are present.
    pub fn edges(&self) -> Option<(PathBuf, PathBuf)> {
        let (head, tail) = edge_file_names(self.metadata.edge_bytes);
        let (head, tail) = (self.dir.join(head), self.dir.join(tail));
        (head.is_file() && tail.is_file()).then_some((head, tail))
    }
}

/// One image's line in the audit report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditedImage {
    pub image: String,
    pub method: String,
    pub format: ImageFormat,
    pub bytes: u64,
    /// `ok`, or `skipped` when no structural checker was available.
    pub integrity: String,
}

/// Writes `audit_report.txt`. The last line is `result=ok` exactly when
/// `failure` is `None`.
pub fn write_audit_report(
    dir: &Path,
    mode: BackupMode,
    inventory_count: usize,
    images: &[AuditedImage],
    failure: Option<&str>,
) -> Result<()> {
    let mut text = format!(
        "audited_at={}\nmode={}\ninventory_partitions={}\nmanifest_entries={}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        mode,
        inventory_count,
        images.len(),
    );
    for image in images {
        text.push_str(&format!(
            "image={} method={} format={} bytes={} checksum=ok integrity={}\n",
            image.image, image.method, image.format, image.bytes, image.integrity
        ));
    }
    match failure {
        None => text.push_str("result=ok\n"),
        Some(reason) => text.push_str(&format!("error={reason}\nresult=fail\n")),
    }
    write_synced(&dir.join(AUDIT_FILE), &text)
}

/// Whether `audit_report.txt` exists and ends with `result=ok`.
pub fn audit_passed(dir: &Path) -> bool {
    fs::read_to_string(dir.join(AUDIT_FILE))
        .map(|t| t.lines().rev().find(|l| !l.trim().is_empty()) == Some("result=ok"))
        .unwrap_or(false)
}
