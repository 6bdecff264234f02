//! Shared fixture: a source and a target "disk" made of regular files, wired
//! into a `SimulatedHost`.
#![allow(dead_code)]

use blockvault_core::Result;
use blockvault_core::backup::{BackupEngine, BackupSummary};
use blockvault_core::config::Config;
use blockvault_core::device::{BackupMode, Device, PartitionDescriptor};
use blockvault_core::platform::simulated::SimulatedHost;
use blockvault_core::restore::{RestoreEngine, RestoreSummary};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const DISK_SIZE: usize = 256 * 1024;
pub const PART_SIZE: usize = 64 * 1024;

/// partclone program per filesystem used in the tests.
pub fn partclone_for(fs_type: &str) -> &'static str {
    match fs_type {
        "ntfs" => "partclone.ntfs",
        "ext4" => "partclone.extfs",
        "vfat" => "partclone.fat",
        "xfs" => "partclone.xfs",
        other => panic!("no partclone tool mapped for {other}"),
    }
}

pub fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 7 + seed as usize) % 251) as u8)
        .collect()
}

pub struct Fixture {
    pub dir: TempDir,
    pub host: SimulatedHost,
    pub config: Config,
    pub source: PathBuf,
    pub target: PathBuf,
    pub layout: Vec<(u32, String)>,
}

fn disk(path: &Path) -> Device {
    Device {
        path: path.to_path_buf(),
        name: path.file_name().unwrap().to_string_lossy().into_owned(),
        size_bytes: DISK_SIZE as u64,
        removable: false,
        model: "SIMULATED".to_string(),
    }
}

fn partitions(dir: &Path, prefix: &str, layout: &[(u32, String)]) -> Vec<PartitionDescriptor> {
    layout
        .iter()
        .map(|(number, fs_type)| PartitionDescriptor {
            number: *number,
            path: dir.join(format!("{prefix}{number}")),
            fs_type: fs_type.clone(),
            size_bytes: PART_SIZE as u64,
            part_uuid: format!("{prefix}-puuid-{number}"),
            fs_uuid: format!("{prefix}-fsuuid-{number}"),
        })
        .collect()
}

impl Fixture {
    /// `layout` is (partition number, filesystem type); an empty type means
    /// enumeration could not identify it.
    pub fn new(layout: &[(u32, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout: Vec<(u32, String)> = layout
            .iter()
            .map(|(n, fs)| (*n, fs.to_string()))
            .collect();

        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::write(&source, patterned(DISK_SIZE, 1)).unwrap();
        fs::write(&target, vec![0u8; DISK_SIZE]).unwrap();

        let source_parts = partitions(dir.path(), "source", &layout);
        let target_parts = partitions(dir.path(), "target", &layout);
        for p in &source_parts {
            fs::write(&p.path, patterned(PART_SIZE, p.number as u8 + 10)).unwrap();
        }
        for p in &target_parts {
            fs::write(&p.path, vec![0u8; PART_SIZE]).unwrap();
        }

        let host = SimulatedHost::new();
        host.add_disk(disk(&source), source_parts);
        host.add_disk(disk(&target), target_parts);

        let config = Config {
            require_root: false,
            compression_level: 1,
            edge_bytes: 4096,
            settle_timeout_secs: 1,
            ..Default::default()
        };

        Self {
            dir,
            host,
            config,
            source,
            target,
            layout,
        }
    }

    pub fn install_partclone(&self) {
        for (_, fs_type) in &self.layout {
            if !fs_type.is_empty() {
                self.host.install_tool(partclone_for(fs_type));
            }
        }
    }

    pub fn set_dir(&self) -> PathBuf {
        self.dir.path().join("set")
    }

    pub fn source_partition(&self, number: u32) -> PathBuf {
        self.dir.path().join(format!("source{number}"))
    }

    pub fn target_partition(&self, number: u32) -> PathBuf {
        self.dir.path().join(format!("target{number}"))
    }

    pub fn backup(&self, mode: BackupMode) -> Result<BackupSummary> {
        BackupEngine::new(&self.config, &self.host).run(&self.source, &self.set_dir(), mode)
    }

    /// Restores the set onto the target disk, answering the confirmation
    /// prompt with `answer`.
    pub fn restore(&self, answer: &str) -> Result<RestoreSummary> {
        let answer = answer.to_string();
        let confirmer = move |_: &str| -> Result<String> { Ok(answer.clone()) };
        RestoreEngine::new(&self.config, &self.host, &confirmer).run(&self.set_dir(), &self.target)
    }
}
