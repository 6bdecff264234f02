//! Turns what the user typed into a disk node.
use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};
use crate::platform::Host;

pub trait Resolve {
    /// Resolves `identifier` to an addressable disk node. Resolving an
    /// already-resolved path returns it unchanged.
    fn resolve(&self, identifier: &str) -> Result<PathBuf>;

    /// Picks the first non-removable disk on the system.
    fn auto_detect(&self) -> Result<PathBuf>;

    /// [`Resolve::resolve`] if an identifier was given, else
    /// [`Resolve::auto_detect`].
    fn resolve_or_detect(&self, identifier: Option<&str>) -> Result<PathBuf> {
        match identifier {
            Some(id) => self.resolve(id),
            None => self.auto_detect(),
        }
    }
}

/// Resolution against a real [`Host`].
pub struct DeviceResolver<'a> {
    host: &'a dyn Host,
}

impl<'a> DeviceResolver<'a> {
    pub fn new(host: &'a dyn Host) -> Self {
        Self { host }
    }
}

/// `/dev/nvme0` (the controller character device) -> `/dev/nvme0n1`.
fn controller_first_disk(path: &str) -> Option<PathBuf> {
    let index = path.strip_prefix("/dev/nvme")?;
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(PathBuf::from(format!("/dev/nvme{index}n1")))
}

/// `base/rel` with `.` and `..` folded away, as `/dev/disk/by-id` links are
/// relative (`../../sda`).
fn lexical_join(base: &Path, rel: &Path) -> PathBuf {
    let mut out = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Whether `path` is named like a whole-disk node.
fn looks_like_disk_node(path: &str) -> bool {
    let Some(name) = path.strip_prefix("/dev/") else {
        return false;
    };

    for prefix in ["sd", "vd", "xvd", "hd"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            return !rest.is_empty() && rest.chars().all(|c| c.is_ascii_lowercase());
        }
    }

    if let Some(rest) = name.strip_prefix("nvme") {
        let mut parts = rest.splitn(2, 'n');
        let controller = parts.next().unwrap_or_default();
        let namespace = parts.next().unwrap_or_default();
        return !controller.is_empty()
            && !namespace.is_empty()
            && controller.chars().all(|c| c.is_ascii_digit())
            && namespace.chars().all(|c| c.is_ascii_digit());
    }

    if let Some(rest) = name.strip_prefix("mmcblk") {
        return !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit());
    }

    false
}

impl Resolve for DeviceResolver<'_> {
    fn resolve(&self, identifier: &str) -> Result<PathBuf> {
        let path = PathBuf::from(identifier);

        // One hop first: the block-device test follows links, so a
        // /dev/disk/by-* name would otherwise pass through unresolved.
        if let Ok(target) = std::fs::read_link(&path) {
            let target = match path.parent() {
                Some(parent) if target.is_relative() => lexical_join(parent, &target),
                _ => target,
            };
            if self.host.is_block_device(&target) {
                return Ok(target);
            }
        }

        if self.host.is_block_device(&path) {
            return Ok(path);
        }

        if let Some(disk) = controller_first_disk(identifier) {
            if self.host.is_block_device(&disk) {
                warn!(
                    given = %identifier,
                    using = %disk.display(),
                    "{identifier} is an NVMe controller, not a disk; using its first namespace"
                );
                return Ok(disk);
            }
        }

        let hint = if looks_like_disk_node(identifier) {
            if Path::new(identifier).exists() {
                Some(
                    "the node exists but is not usable as a block device; \
                     this usually means a container or sandbox without device access"
                        .to_string(),
                )
            } else {
                Some(
                    "no such device node; if the disk is attached, the environment \
                     may not expose /dev (container or sandbox)"
                        .to_string(),
                )
            }
        } else {
            None
        };

        Err(Error::NotABlockDevice { path, hint })
    }

    fn auto_detect(&self) -> Result<PathBuf> {
        self.host
            .list_disks()?
            .into_iter()
            .find(|d| !d.removable)
            .map(|d| d.path)
            .ok_or(Error::NoDiskFound)
    }
}

/// Test double that accepts any identifier as-is.
///
/// Lets integration tests drive the engines with regular files standing in
/// for disks. It performs no checks at all and must not be used outside
/// tests.
pub struct PassthroughResolver;

impl Resolve for PassthroughResolver {
    fn resolve(&self, identifier: &str) -> Result<PathBuf> {
        Ok(PathBuf::from(identifier))
    }

    fn auto_detect(&self) -> Result<PathBuf> {
        Err(Error::NoDiskFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::platform::simulated::SimulatedHost;

    fn disk(path: &str, removable: bool) -> Device {
        Device {
            path: PathBuf::from(path),
            name: path.trim_start_matches("/dev/").to_string(),
            size_bytes: 1 << 30,
            removable,
            model: String::new(),
        }
    }

    #[test]
    fn block_device_resolves_to_itself() {
        let host = SimulatedHost::new();
        host.add_block_device(Path::new("/dev/sdb"));
        let resolver = DeviceResolver::new(&host);

        let first = resolver.resolve("/dev/sdb").unwrap();
        let second = resolver.resolve(&first.to_string_lossy()).unwrap();
        assert_eq!(first, PathBuf::from("/dev/sdb"));
        assert_eq!(first, second);
    }

    #[test]
    fn nvme_controller_is_redirected_to_first_namespace() {
        let host = SimulatedHost::new();
        host.add_block_device(Path::new("/dev/nvme0n1"));
        let resolver = DeviceResolver::new(&host);

        assert_eq!(
            resolver.resolve("/dev/nvme0").unwrap(),
            PathBuf::from("/dev/nvme0n1")
        );
    }

    #[test]
    fn symlink_is_followed_once() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("disk");
        std::fs::write(&target, b"").unwrap();
        let link = dir.path().join("by-id-link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let host = SimulatedHost::new();
        host.add_block_device(&target);
        let resolver = DeviceResolver::new(&host);

        assert_eq!(resolver.resolve(&link.to_string_lossy()).unwrap(), target);
    }

    #[test]
    fn relative_link_resolves_to_disk_node() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sdb");
        std::fs::write(&target, b"").unwrap();
        let by_id = dir.path().join("disk").join("by-id");
        std::fs::create_dir_all(&by_id).unwrap();
        let link = by_id.join("ata-SIMULATED_1234");
        std::os::unix::fs::symlink("../../sdb", &link).unwrap();

        // A real host answers yes for the link too, since it follows it.
        let host = SimulatedHost::new();
        host.add_block_device(&target);
        host.add_block_device(&link);
        let resolver = DeviceResolver::new(&host);

        let resolved = resolver.resolve(&link.to_string_lossy()).unwrap();
        assert_eq!(resolved, target);
        assert_eq!(resolver.resolve(&resolved.to_string_lossy()).unwrap(), target);
    }

    #[test]
    fn disk_node_failure_carries_hint() {
        let host = SimulatedHost::new();
        let resolver = DeviceResolver::new(&host);

        match resolver.resolve("/dev/sdq").unwrap_err() {
            Error::NotABlockDevice { path, hint } => {
                assert_eq!(path, PathBuf::from("/dev/sdq"));
                assert!(hint.unwrap().contains("container"));
            }
            other => panic!("unexpected error: {other}"),
        }

        match resolver.resolve("/tmp/not-a-disk").unwrap_err() {
            Error::NotABlockDevice { hint, .. } => assert!(hint.is_none()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn auto_detect_skips_removable_disks() {
        let host = SimulatedHost::new();
        host.add_disk(disk("/dev/sdc", true), vec![]);
        host.add_disk(disk("/dev/nvme0n1", false), vec![]);
        let resolver = DeviceResolver::new(&host);

        assert_eq!(resolver.auto_detect().unwrap(), PathBuf::from("/dev/nvme0n1"));
    }

    #[test]
    fn auto_detect_without_fixed_disk_fails() {
        let host = SimulatedHost::new();
        host.add_disk(disk("/dev/sdc", true), vec![]);
        let resolver = DeviceResolver::new(&host);

        assert!(matches!(resolver.auto_detect(), Err(Error::NoDiskFound)));
    }

    #[test]
    fn disk_node_patterns() {
        assert!(looks_like_disk_node("/dev/sda"));
        assert!(looks_like_disk_node("/dev/nvme1n2"));
        assert!(looks_like_disk_node("/dev/mmcblk0"));
        assert!(!looks_like_disk_node("/dev/sda1"));
        assert!(!looks_like_disk_node("/dev/nvme0n1p1"));
        assert!(!looks_like_disk_node("/dev/nvme0"));
        assert!(!looks_like_disk_node("disk.img"));
    }
}
