//! The core, UI-agnostic library for the `blockvault` backup utility.
//!
//! `blockvault-core` captures a block device into a self-describing backup
//! set (partition table, per-partition images or one whole-device image,
//! checksums, audit report) and replays such a set onto a device. Any
//! front-end can drive it; the `blockvault` CLI is one.
//!
//! The library is structured into several key modules:
//! - [`resolve`]: turns a user-supplied identifier into a disk node.
//! - [`capability`]: picks the imaging method for a filesystem type.
//! - [`inventory`]: enumerates the partitions of a device.
//! - [`backup`] and [`restore`]: the two engines.
//! - [`verify`]: re-validates a backup set, optionally against a live device.
//! - [`backup_set`]: the on-disk layout shared by all of the above.
//! - [`platform`]: the [`platform::Host`] seam through which every OS
//!   interaction goes, with a Linux implementation and a simulated one.
//!
//! Engines report progress through the [`progress::Progress`] trait and can be
//! interrupted through a shared `AtomicBool`, so the calling application
//! decides how to display progress and when to stop.
//!
//! ## Example: Backing Up a Disk
//!
//! ```rust,no_run
//! use blockvault_core::backup::BackupEngine;
//! use blockvault_core::config::{Config, Overrides};
//! use blockvault_core::device::BackupMode;
//! use blockvault_core::platform::LinuxHost;
//! use blockvault_core::resolve::{DeviceResolver, Resolve};
//! use std::path::Path;
//!
//! fn main() -> blockvault_core::Result<()> {
//!     let config = Config::load(None, &Overrides::default())?;
//!     let host = LinuxHost;
//!     let device = DeviceResolver::new(&host).resolve_or_detect(Some("/dev/sda"))?;
//!
//!     let summary = BackupEngine::new(&config, &host).run(
//!         &device,
//!         Path::new("/mnt/backups/sda"),
//!         BackupMode::Partitioned,
//!     )?;
//!     for entry in &summary.entries {
//!         println!("{} -> {} ({})", entry.label(), entry.image, entry.method);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod backup_set;
pub mod capability;
pub mod config;
pub mod device;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod platform;
pub mod progress;
pub mod raw;
pub mod resolve;
pub mod restore;
pub mod verify;

pub use error::{Error, Result};
