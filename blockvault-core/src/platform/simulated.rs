//! An in-memory [`Host`] for tests.
//!
//! Disks and partitions are regular files. The partclone family and
//! `sfdisk --dump` are emulated on those files; every other program simply
//! succeeds if it is registered as installed. Each command that is run is
//! appended to a log that tests can inspect.
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::device::{Device, PartitionDescriptor};
use crate::error::{Error, Result};
use crate::exec::{ToolCommand, ToolError, ToolErrorKind, ToolOutput};
use crate::platform::Host;

/// Leading bytes of every emulated partclone image.
pub const PARTCLONE_MAGIC: &[u8] = b"SIMULATED-PARTCLONE\n";

/// Tools present on a freshly constructed host.
const BASE_TOOLS: &[&str] = &["lsblk", "blkid", "udevadm"];

#[derive(Default)]
struct State {
    privileged: bool,
    tools: BTreeSet<String>,
    failing: BTreeSet<String>,
    disks: Vec<Device>,
    partitions: BTreeMap<PathBuf, Vec<PartitionDescriptor>>,
    probed: BTreeMap<PathBuf, String>,
    mounts: BTreeMap<PathBuf, PathBuf>,
    block_devices: BTreeSet<PathBuf>,
    commands: Vec<String>,
    rereads: Vec<PathBuf>,
}

pub struct SimulatedHost {
    state: Mutex<State>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    /// A privileged host with only the base enumeration tools installed.
    pub fn new() -> Self {
        let state = State {
            privileged: true,
            tools: BASE_TOOLS.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not poison the host for the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_privileged(&self, privileged: bool) {
        self.state().privileged = privileged;
    }

    pub fn install_tool(&self, program: &str) {
        self.state().tools.insert(program.to_string());
    }

    pub fn remove_tool(&self, program: &str) {
        self.state().tools.remove(program);
    }

    /// Keeps `program` installed but makes every invocation exit with status 1.
    pub fn fail_tool(&self, program: &str) {
        self.state().failing.insert(program.to_string());
    }

    /// Registers a disk and its partitions, replacing any previous layout.
    pub fn add_disk(&self, device: Device, partitions: Vec<PartitionDescriptor>) {
        let mut state = self.state();
        state.block_devices.insert(device.path.clone());
        state.partitions.insert(device.path.clone(), partitions);
        state.disks.retain(|d| d.path != device.path);
        state.disks.push(device);
    }

    pub fn set_partitions(&self, device: &Path, partitions: Vec<PartitionDescriptor>) {
        self.state()
            .partitions
            .insert(device.to_path_buf(), partitions);
    }

    /// Answer for the secondary filesystem lookup of `partition`.
    pub fn set_probed_fs(&self, partition: &Path, fs_type: &str) {
        self.state()
            .probed
            .insert(partition.to_path_buf(), fs_type.to_string());
    }

    pub fn mount(&self, partition: &Path, mount_point: &Path) {
        self.state()
            .mounts
            .insert(partition.to_path_buf(), mount_point.to_path_buf());
    }

    pub fn add_block_device(&self, path: &Path) {
        self.state().block_devices.insert(path.to_path_buf());
    }

    /// Every command run so far, rendered as shell-like strings.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn rereads(&self) -> Vec<PathBuf> {
        self.state().rereads.clone()
    }

    pub fn is_mounted(&self, partition: &Path) -> bool {
        self.state().mounts.contains_key(partition)
    }
}

/// Value following `flag` in an argument list.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn io_failure(command: &ToolCommand, e: std::io::Error) -> ToolError {
    command.failed(Some(1), &e.to_string())
}

fn emulate_partclone(command: &ToolCommand) -> std::result::Result<ToolOutput, ToolError> {
    let args = &command.args;
    let (Some(source), Some(output)) = (flag_value(args, "-s"), flag_value(args, "-o")) else {
        if command.program == "partclone.chkimg" {
            let source = flag_value(args, "-s").ok_or_else(|| command.failed(Some(1), "missing -s"))?;
            let data = fs::read(source).map_err(|e| io_failure(command, e))?;
            if !data.starts_with(PARTCLONE_MAGIC) {
                return Err(command.failed(Some(1), "bad image header"));
            }
            return Ok(ToolOutput::default());
        }
        return Err(command.failed(Some(1), "missing -s or -o"));
    };

    if args.iter().any(|a| a == "-c") {
        let mut data = PARTCLONE_MAGIC.to_vec();
        data.extend(fs::read(source).map_err(|e| io_failure(command, e))?);
        fs::write(output, data).map_err(|e| io_failure(command, e))?;
    } else if args.iter().any(|a| a == "-r") {
        let data = fs::read(source).map_err(|e| io_failure(command, e))?;
        let Some(payload) = data.strip_prefix(PARTCLONE_MAGIC) else {
            return Err(command.failed(Some(1), "bad image header"));
        };
        fs::write(output, payload).map_err(|e| io_failure(command, e))?;
    } else {
        return Err(command.failed(Some(1), "neither -c nor -r given"));
    }
    Ok(ToolOutput::default())
}

impl Host for SimulatedHost {
    fn is_privileged(&self) -> bool {
        self.state().privileged
    }

    fn has_tool(&self, program: &str) -> bool {
        self.state().tools.contains(program)
    }

    fn run(&self, command: &ToolCommand) -> std::result::Result<ToolOutput, ToolError> {
        let (installed, failing, partitions) = {
            let mut state = self.state();
            state.commands.push(command.to_string());
            let device = command.args.last().map(PathBuf::from).unwrap_or_default();
            (
                state.tools.contains(&command.program),
                state.failing.contains(&command.program),
                state.partitions.get(&device).cloned().unwrap_or_default(),
            )
        };

        if !installed {
            return Err(ToolError {
                command: command.to_string(),
                kind: ToolErrorKind::NotFound,
                stderr: String::new(),
            });
        }
        if failing {
            return Err(command.failed(Some(1), "simulated failure"));
        }

        match command.program.as_str() {
            p if p.starts_with("partclone.") => emulate_partclone(command),
            "sfdisk" if command.args.iter().any(|a| a == "--dump") => {
                let mut dump = String::from("label: gpt\n\n");
                for p in &partitions {
                    dump.push_str(&format!(
                        "{} : size={}, uuid={}\n",
                        p.path.display(),
                        p.size_bytes / 512,
                        p.part_uuid
                    ));
                }
                Ok(ToolOutput {
                    stdout: dump,
                    stderr: String::new(),
                })
            }
            _ => Ok(ToolOutput::default()),
        }
    }

    fn list_disks(&self) -> Result<Vec<Device>> {
        Ok(self.state().disks.clone())
    }

    fn list_partitions(&self, device: &Path) -> Result<Vec<PartitionDescriptor>> {
        self.state()
            .partitions
            .get(device)
            .cloned()
            .ok_or_else(|| Error::Enumeration(format!("unknown device {}", device.display())))
    }

    fn probe_fs_type(&self, partition: &Path) -> Option<String> {
        self.state().probed.get(partition).cloned()
    }

    fn mount_point(&self, partition: &Path) -> Option<PathBuf> {
        self.state().mounts.get(partition).cloned()
    }

    fn unmount(&self, partition: &Path) -> Result<()> {
        self.state().mounts.remove(partition);
        Ok(())
    }

    fn is_block_device(&self, path: &Path) -> bool {
        self.state().block_devices.contains(path)
    }

    fn reread_partition_table(&self, device: &Path) -> Result<()> {
        self.state().rereads.push(device.to_path_buf());
        Ok(())
    }

    fn settle(&self, _timeout: Duration) {}

    fn host_name(&self) -> String {
        "simulated".to_string()
    }

    fn kernel_version(&self) -> String {
        "0.0.0-simulated".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partclone_emulation_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let part = dir.path().join("part");
        let image = dir.path().join("image");
        let restored = dir.path().join("restored");
        fs::write(&part, b"filesystem bytes").unwrap();

        let host = SimulatedHost::new();
        host.install_tool("partclone.extfs");
        host.install_tool("partclone.chkimg");

        let clone = ToolCommand::new("partclone.extfs")
            .arg("-c")
            .arg("-s")
            .path_arg(&part)
            .arg("-o")
            .path_arg(&image);
        host.run(&clone).unwrap();
        host.run(&ToolCommand::new("partclone.chkimg").arg("-s").path_arg(&image))
            .unwrap();

        let restore = ToolCommand::new("partclone.extfs")
            .arg("-r")
            .arg("-s")
            .path_arg(&image)
            .arg("-o")
            .path_arg(&restored);
        host.run(&restore).unwrap();

        assert_eq!(fs::read(&restored).unwrap(), b"filesystem bytes");
        assert_eq!(host.commands().len(), 3);
    }

    #[test]
    fn missing_and_failing_tools() {
        let host = SimulatedHost::new();
        let err = host.run(&ToolCommand::new("sfdisk")).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::NotFound);

        host.install_tool("wipefs");
        host.fail_tool("wipefs");
        let err = host.run(&ToolCommand::new("wipefs")).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Exit(Some(1)));
    }
}
