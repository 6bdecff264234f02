//! Provides the host environment the engines run against.
//!
//! Everything blockvault needs from the operating system (device
//! enumeration, tool presence checks, external command execution, mount
//! table lookups, partition table re-reads) goes through the [`Host`]
//! trait. The engines never talk to the OS directly, apart from streaming
//! image bytes to and from the paths a `Host` hands them.
//!
//! - [`LinuxHost`] is the real implementation (`lsblk`, `blkid`, sysfs,
//!   ioctls).
//! - [`simulated::SimulatedHost`] is a test double: it answers every query
//!   from in-memory state and emulates the partclone and sfdisk families on
//!   regular files. It must never be wired into a production code path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::{Device, PartitionDescriptor};
use crate::error::Result;
use crate::exec::{ToolCommand, ToolError, ToolOutput};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::LinuxHost;

pub mod simulated;

pub trait Host {
    /// Whether the current process may open block devices for writing.
    fn is_privileged(&self) -> bool;

    /// Presence check for an external program. Side-effect free and cheap.
    fn has_tool(&self, program: &str) -> bool;

    /// Runs an external program to completion, capturing its output.
    fn run(&self, command: &ToolCommand) -> std::result::Result<ToolOutput, ToolError>;

    /// Whole disks known to the system, in enumeration order.
    fn list_disks(&self) -> Result<Vec<Device>>;

    /// Partitions of `device` as reported by the enumeration service. Order
    /// is unspecified and filesystem types may be empty.
    fn list_partitions(&self, device: &Path) -> Result<Vec<PartitionDescriptor>>;

    /// Secondary filesystem type lookup for partitions enumeration could not
    /// identify.
    fn probe_fs_type(&self, partition: &Path) -> Option<String>;

    fn mount_point(&self, partition: &Path) -> Option<PathBuf>;

    fn unmount(&self, partition: &Path) -> Result<()>;

    fn is_block_device(&self, path: &Path) -> bool;

    /// Asks the kernel to re-read the partition table of `device`.
    fn reread_partition_table(&self, device: &Path) -> Result<()>;

    /// Waits for pending device events to be processed.
    fn settle(&self, timeout: Duration);

    fn host_name(&self) -> String;

    fn kernel_version(&self) -> String;
}
