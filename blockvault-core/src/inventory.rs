//! Partition enumeration.
use std::path::Path;

use tracing::debug;

use crate::device::{PartitionDescriptor, UNKNOWN_FS, normalize_fs_type};
use crate::error::Result;
use crate::platform::Host;

/// Lists the partitions of `device` in ascending partition-number order.
///
/// Every call queries the host afresh. Partitions the enumeration service
/// could not identify get a second opinion from [`Host::probe_fs_type`];
/// if that also comes back empty the type stays [`UNKNOWN_FS`].
pub fn enumerate(host: &dyn Host, device: &Path) -> Result<Vec<PartitionDescriptor>> {
    let mut partitions = host.list_partitions(device)?;

    for partition in &mut partitions {
        partition.fs_type = normalize_fs_type(&partition.fs_type);
        if partition.fs_type == UNKNOWN_FS {
            if let Some(probed) = host.probe_fs_type(&partition.path) {
                debug!(
                    partition = %partition.path.display(),
                    fs_type = %probed,
                    "Filesystem type identified by probe"
                );
                partition.fs_type = normalize_fs_type(&probed);
            }
        }
    }

    partitions.sort_by_key(|p| p.number);
    Ok(partitions)
}
