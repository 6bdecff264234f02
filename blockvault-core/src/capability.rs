//! Per-filesystem capture capabilities and their availability.
//!
//! Every filesystem family with a partclone tool maps to a
//! [`Capability::Specialized`]; anything else, including partitions whose
//! type could not be identified, maps to [`Capability::Generic`]. A missing
//! specialized tool is never an error: callers degrade to the generic
//! raw-copy-plus-gzip method instead.
use std::fmt;
use std::str::FromStr;

use crate::platform::Host;

/// Manifest name of the generic raw-copy-plus-gzip method.
pub const GENERIC_METHOD: &str = "raw-gzip";

/// partclone's image checker.
pub const CHKIMG_TOOL: &str = "partclone.chkimg";

/// (filesystem types, specialized program) per family.
const FAMILIES: &[(&[&str], &str)] = &[
    (&["ext2", "ext3", "ext4"], "partclone.extfs"),
    (&["xfs"], "partclone.xfs"),
    (&["btrfs"], "partclone.btrfs"),
    (&["ntfs"], "partclone.ntfs"),
    (&["vfat", "fat", "fat12", "fat16", "fat32", "msdos"], "partclone.fat"),
    (&["exfat"], "partclone.exfat"),
    (&["swap"], "partclone.swap"),
    (&["reiserfs"], "partclone.reiserfs"),
    (&["hfsplus", "hfs+"], "partclone.hfsp"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// A filesystem-aware imaging program, named by its executable.
    Specialized(&'static str),
    Generic,
}

impl Capability {
    pub fn method_name(&self) -> &'static str {
        match self {
            Capability::Specialized(program) => *program,
            Capability::Generic => GENERIC_METHOD,
        }
    }

    /// Container format of the images this capability produces.
    pub fn image_format(&self) -> ImageFormat {
        match self {
            Capability::Specialized(_) => ImageFormat::Partclone,
            Capability::Generic => ImageFormat::Gzip,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == GENERIC_METHOD {
            return Ok(Capability::Generic);
        }
        FAMILIES
            .iter()
            .find(|(_, program)| *program == s)
            .map(|(_, program)| Capability::Specialized(*program))
            .ok_or_else(|| format!("unknown capture method '{s}'"))
    }
}

/// Maps a normalized filesystem type to its capability.
pub fn capability_for(fs_type: &str) -> Capability {
    let fs_type = fs_type.trim().to_ascii_lowercase();
    FAMILIES
        .iter()
        .find(|(types, _)| types.contains(&fs_type.as_str()))
        .map(|(_, program)| Capability::Specialized(*program))
        .unwrap_or(Capability::Generic)
}

/// Whether `capability` can be used on this host right now.
///
/// The generic method runs in-process and is always available.
pub fn is_available(host: &dyn Host, capability: Capability) -> bool {
    match capability {
        Capability::Specialized(program) => host.has_tool(program),
        Capability::Generic => true,
    }
}

/// How an image file's bytes are encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// Raw device bytes, gzip-compressed. Restorable without any
    /// filesystem-specific tool.
    Gzip,
    /// partclone's own image format.
    Partclone,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Gzip => "gzip",
            ImageFormat::Partclone => "partclone",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Gzip => "img.gz",
            ImageFormat::Partclone => "img",
        }
    }

    /// Format implied by an image file name, for manifests that predate the
    /// explicit format column.
    pub fn infer_from_name(name: &str) -> Self {
        if name.ends_with(".gz") {
            ImageFormat::Gzip
        } else {
            ImageFormat::Partclone
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(ImageFormat::Gzip),
            "partclone" => Ok(ImageFormat::Partclone),
            other => Err(format!("unknown image format '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::UNKNOWN_FS;
    use crate::platform::simulated::SimulatedHost;

    #[test]
    fn families_map_to_their_tools() {
        assert_eq!(capability_for("ext4"), Capability::Specialized("partclone.extfs"));
        assert_eq!(capability_for("ext2"), Capability::Specialized("partclone.extfs"));
        assert_eq!(capability_for("NTFS"), Capability::Specialized("partclone.ntfs"));
        assert_eq!(capability_for("vfat"), Capability::Specialized("partclone.fat"));
        assert_eq!(capability_for("hfsplus"), Capability::Specialized("partclone.hfsp"));
    }

    #[test]
    fn unknown_types_fall_back_to_generic() {
        assert_eq!(capability_for(UNKNOWN_FS), Capability::Generic);
        assert_eq!(capability_for(""), Capability::Generic);
        assert_eq!(capability_for("zfs_member"), Capability::Generic);
    }

    #[test]
    fn method_names_parse_back() {
        for (_, program) in FAMILIES {
            let cap = Capability::Specialized(*program);
            assert_eq!(cap.method_name().parse::<Capability>(), Ok(cap));
        }
        assert_eq!(GENERIC_METHOD.parse::<Capability>(), Ok(Capability::Generic));
        assert!("dd".parse::<Capability>().is_err());
    }

    #[test]
    fn availability_follows_host_tools() {
        let host = SimulatedHost::new();
        let ext = capability_for("ext4");
        assert!(!is_available(&host, ext));
        host.install_tool("partclone.extfs");
        assert!(is_available(&host, ext));
        assert!(is_available(&host, Capability::Generic));
    }

    #[test]
    fn format_inferred_from_suffix() {
        assert_eq!(ImageFormat::infer_from_name("part-2-ext4.img.gz"), ImageFormat::Gzip);
        assert_eq!(ImageFormat::infer_from_name("part-2-ext4.img"), ImageFormat::Partclone);
    }
}
