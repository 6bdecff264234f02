use crate::device::{Device, PartitionDescriptor, normalize_fs_type};
use crate::error::{Error, Result};
use crate::exec::{ToolCommand, ToolError, ToolOutput};
use crate::platform::Host;
use nix::ioctl_none;
use serde_json::Value;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, warn};

ioctl_none!(blkrrpart, 0x12, 95);

/// The host as seen through `lsblk`, `blkid`, sysfs and the mount table.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxHost;

/// Helper to read a specific attribute from the /sys/class/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/class/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Partition number for a kernel device name, e.g. "nvme0n1p3" -> 3.
///
/// sysfs is authoritative; the trailing digits of the name are the fallback.
fn partition_number(name: &str) -> Option<u32> {
    if let Ok(n) = read_sys_file(name, "partition") {
        if let Ok(n) = n.parse() {
            return Some(n);
        }
    }
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

/// lsblk reports some columns as strings or numbers depending on its version.
fn json_u64(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn json_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s == "1",
        Value::Number(n) => n.as_u64() == Some(1),
        _ => false,
    }
}

fn json_str(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

impl LinuxHost {
    fn lsblk(&self, args: &[&str]) -> Result<Value> {
        let mut command = ToolCommand::new("lsblk").arg("--json").arg("--bytes");
        for arg in args {
            command = command.arg(*arg);
        }
        let output = self.run(&command)?;
        serde_json::from_str(&output.stdout).map_err(|e| Error::Enumeration(format!("unparseable lsblk output: {e}")))
    }
}

impl Host for LinuxHost {
    fn is_privileged(&self) -> bool {
        nix::unistd::Uid::effective().is_root()
    }

    fn has_tool(&self, program: &str) -> bool {
        let Some(paths) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&paths).any(|dir| {
            fs::metadata(dir.join(program))
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
    }

    fn run(&self, command: &ToolCommand) -> std::result::Result<ToolOutput, ToolError> {
        match command.run_local() {
            Ok(output) => {
                debug!(command = %command, "Command succeeded");
                Ok(output)
            }
            Err(e) => {
                error!(command = %command, error = %e, "Command failed");
                Err(e)
            }
        }
    }

    /// Lists whole disks, skipping loop, ram and zero-sized devices.
    fn list_disks(&self) -> Result<Vec<Device>> {
        let json = self.lsblk(&["--nodeps", "-o", "NAME,PATH,TYPE,RM,SIZE,MODEL"])?;
        let mut devices = Vec::new();

        for entry in json["blockdevices"].as_array().into_iter().flatten() {
            let name = json_str(&entry["name"]);
            if json_str(&entry["type"]) != "disk" || name.starts_with("loop") || name.starts_with("ram") {
                continue;
            }

            let size_bytes = json_u64(&entry["size"]);
            if size_bytes == 0 {
                continue;
            }

            let path = match entry["path"].as_str() {
                Some(p) => PathBuf::from(p),
                None => PathBuf::from("/dev/").join(&name),
            };

            devices.push(Device {
                path,
                name,
                size_bytes,
                removable: json_bool(&entry["rm"]),
                model: json_str(&entry["model"]).trim().to_string(),
            });
        }

        Ok(devices)
    }

    fn list_partitions(&self, device: &Path) -> Result<Vec<PartitionDescriptor>> {
        let json = self.lsblk(&[
            "-o",
            "NAME,PATH,TYPE,SIZE,FSTYPE,PARTUUID,UUID",
            &device.to_string_lossy(),
        ])?;
        let mut partitions = Vec::new();

        for disk in json["blockdevices"].as_array().into_iter().flatten() {
            for child in disk["children"].as_array().into_iter().flatten() {
                if json_str(&child["type"]) != "part" {
                    continue;
                }
                let name = json_str(&child["name"]);
                let Some(number) = partition_number(&name) else {
                    warn!(partition = %name, "Could not determine partition number, skipping");
                    continue;
                };
                let path = match child["path"].as_str() {
                    Some(p) => PathBuf::from(p),
                    None => PathBuf::from("/dev/").join(&name),
                };
                partitions.push(PartitionDescriptor {
                    number,
                    path,
                    fs_type: normalize_fs_type(&json_str(&child["fstype"])),
                    size_bytes: json_u64(&child["size"]),
                    part_uuid: json_str(&child["partuuid"]),
                    fs_uuid: json_str(&child["uuid"]),
                });
            }
        }

        Ok(partitions)
    }

    fn probe_fs_type(&self, partition: &Path) -> Option<String> {
        let command = ToolCommand::new("blkid")
            .arg("-o")
            .arg("value")
            .arg("-s")
            .arg("TYPE")
            .path_arg(partition);
        // blkid exits 2 when it finds nothing, which is an answer, not a failure.
        let output = command.run_local().ok()?;
        let fs_type = output.stdout.trim();
        (!fs_type.is_empty()).then(|| fs_type.to_string())
    }

    /// Looks the partition up in the mount table via `sysinfo`.
    fn mount_point(&self, partition: &Path) -> Option<PathBuf> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let canonical = fs::canonicalize(partition).unwrap_or_else(|_| partition.to_path_buf());
        disks
            .iter()
            .find(|disk| {
                let name = PathBuf::from("/dev/").join(disk.name());
                name == partition || name == canonical
            })
            .map(|disk| disk.mount_point().to_path_buf())
    }

    fn unmount(&self, partition: &Path) -> Result<()> {
        let Some(mount_point) = self.mount_point(partition) else {
            return Ok(());
        };
        nix::mount::umount(&mount_point).map_err(|e| Error::io(&mount_point, io::Error::from(e)))
    }

    fn is_block_device(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn reread_partition_table(&self, device: &Path) -> Result<()> {
        let file = fs::File::open(device).map_err(|e| Error::io(device, e))?;
        let ioctl_result = unsafe { blkrrpart(file.as_raw_fd()) };
        drop(file);

        match ioctl_result {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(device = %device.display(), error = %e, "BLKRRPART failed, trying partprobe");
                if !self.has_tool("partprobe") {
                    return Err(Error::io(device, io::Error::from(e)));
                }
                self.run(&ToolCommand::new("partprobe").path_arg(device))?;
                Ok(())
            }
        }
    }

    fn settle(&self, timeout: Duration) {
        if self.has_tool("udevadm") {
            let command = ToolCommand::new("udevadm")
                .arg("settle")
                .arg(format!("--timeout={}", timeout.as_secs().max(1)));
            if self.run(&command).is_ok() {
                return;
            }
        }
        std::thread::sleep(Duration::from_secs(1).min(timeout));
    }

    fn host_name(&self) -> String {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    fn kernel_version(&self) -> String {
        nix::sys::utsname::uname()
            .map(|u| u.release().to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_number_from_name_suffix() {
        // Names that do not exist in sysfs fall back to the trailing digits.
        assert_eq!(partition_number("blockvault-test-sdz3"), Some(3));
        assert_eq!(partition_number("blockvault-test-nvme9n1p12"), Some(12));
        assert_eq!(partition_number("blockvault-test-sdz"), None);
    }

    #[test]
    fn lsblk_values_accept_both_encodings() {
        assert_eq!(json_u64(&serde_json::json!(512)), 512);
        assert_eq!(json_u64(&serde_json::json!("1024")), 1024);
        assert!(json_bool(&serde_json::json!("1")));
        assert!(json_bool(&serde_json::json!(true)));
        assert!(!json_bool(&serde_json::json!("0")));
        assert!(!json_bool(&Value::Null));
    }
}
