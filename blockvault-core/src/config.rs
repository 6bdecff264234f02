//! Process-wide configuration.
//!
//! A [`Config`] is built once at start-up from, in increasing priority:
//! built-in defaults, an optional TOML file, `BLOCKVAULT_*` environment
//! variables, and command-line overrides. The engines only ever borrow it.
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Settings file consulted when no `--config` path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/blockvault.toml";

/// Size of the raw head and tail ranges saved as a partition table fallback.
pub const DEFAULT_EDGE_BYTES: u64 = 2 * 1024 * 1024;

/// Safety switches (`require_root`, `assume_yes`) are never read from the
/// settings file or the environment. `assume_yes` comes only from
/// [`Overrides`]; `require_root` is cleared only by constructing the struct.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Refuse to run backup/restore without root. Only tests turn this off.
    #[serde(skip, default = "enabled")]
    pub require_root: bool,
    /// Image partitions even when they are mounted.
    pub allow_mounted: bool,
    /// Skip the typed confirmation before a destructive restore.
    #[serde(skip)]
    pub assume_yes: bool,
    /// gzip level for generic images (0-9).
    pub compression_level: u32,
    /// Bytes saved from each end of the device as the raw table fallback.
    pub edge_bytes: u64,
    /// How long to wait for partition nodes to appear after a table change.
    pub settle_timeout_secs: u64,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
}

fn enabled() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            require_root: true,
            allow_mounted: false,
            assume_yes: false,
            compression_level: 6,
            edge_bytes: DEFAULT_EDGE_BYTES,
            settle_timeout_secs: 30,
            log_file: None,
            verbose: false,
        }
    }
}

/// Command-line values that take precedence over every other source.
/// `None` means "not given on the command line".
#[derive(Clone, Debug, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_mounted: Option<bool>,
    /// Applied after extraction; the only way to set [`Config::assume_yes`].
    #[serde(skip)]
    pub assume_yes: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
}

impl Config {
    /// Loads the configuration. A missing settings file is not an error.
    pub fn load(file: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let path = file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BLOCKVAULT_"))
            .merge(Serialized::defaults(overrides))
            .extract()
            .map_err(|e| Error::Config(Box::new(e)))?;
        config.assume_yes = overrides.assume_yes.unwrap_or(false);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(Error::Config(Box::new(figment::Error::from(format!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            )))));
        }
        if self.edge_bytes == 0 || self.edge_bytes % 512 != 0 {
            return Err(Error::Config(Box::new(figment::Error::from(format!(
                "edge_bytes must be a non-zero multiple of 512, got {}",
                self.edge_bytes
            )))));
        }
        Ok(())
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_without_file() {
        Jail::expect_with(|jail| {
            let missing = jail.directory().join("absent.toml");
            let config = Config::load(Some(&missing), &Overrides::default()).unwrap();
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn file_then_env_then_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "blockvault.toml",
                r#"
                    compression_level = 1
                    allow_mounted = true
                    settle_timeout_secs = 5
                "#,
            )?;
            jail.set_env("BLOCKVAULT_COMPRESSION_LEVEL", "3");

            let overrides = Overrides {
                allow_mounted: Some(false),
                ..Default::default()
            };
            let path = jail.directory().join("blockvault.toml");
            let config = Config::load(Some(&path), &overrides).unwrap();

            assert_eq!(config.compression_level, 3);
            assert!(!config.allow_mounted);
            assert_eq!(config.settle_timeout(), Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn safety_switches_ignore_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "blockvault.toml",
                r#"
                    assume_yes = true
                    require_root = false
                "#,
            )?;
            jail.set_env("BLOCKVAULT_ASSUME_YES", "true");
            jail.set_env("BLOCKVAULT_REQUIRE_ROOT", "false");

            let path = jail.directory().join("blockvault.toml");
            let config = Config::load(Some(&path), &Overrides::default()).unwrap();
            assert!(!config.assume_yes);
            assert!(config.require_root);

            let overrides = Overrides {
                assume_yes: Some(true),
                ..Default::default()
            };
            let config = Config::load(Some(&path), &overrides).unwrap();
            assert!(config.assume_yes);
            assert!(config.require_root);
            Ok(())
        });
    }

    #[test]
    fn rejects_out_of_range_level() {
        Jail::expect_with(|jail| {
            jail.set_env("BLOCKVAULT_COMPRESSION_LEVEL", "12");
            let missing = jail.directory().join("absent.toml");
            let err = Config::load(Some(&missing), &Overrides::default()).unwrap_err();
            assert!(err.to_string().contains("compression_level"));
            Ok(())
        });
    }
}
