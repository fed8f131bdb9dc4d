//! Configuration file handling for saving and loading provisioning configs.
//!
//! The front-end collects every choice once and hands it over as a
//! `ProvisionConfig`; the core never prompts. Enum fields give compile-time
//! validation for filesystem and policy, and missing fields fall back to the
//! installer defaults (`/dev/sda`, ext4, single root, mounted at `/mnt`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::layout::{GIB, PlannerOptions};
use crate::engine::provision::{ProvisionOptions, ProvisionRequest};
use crate::types::{FilesystemKind, LayoutPolicy};

/// Provisioning configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Target disk, e.g. `/dev/sda`
    pub device: PathBuf,
    pub filesystem: FilesystemKind,
    pub policy: LayoutPolicy,
    /// Where the new system is mounted
    pub root_mount: PathBuf,
    /// Fixed root size under root+home
    pub root_size_gib: u64,
    pub min_root_size_gib: u64,
    pub min_home_size_gib: u64,
    /// Mount options for Btrfs filesystems
    pub btrfs_mount_options: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        let planner = PlannerOptions::default();
        let options = ProvisionOptions::default();
        Self {
            device: PathBuf::from("/dev/sda"),
            filesystem: FilesystemKind::default(),
            policy: LayoutPolicy::default(),
            root_mount: options.root_mount,
            root_size_gib: planner.root_size / GIB,
            min_root_size_gib: planner.min_root_size / GIB,
            min_home_size_gib: planner.min_home_size / GIB,
            btrfs_mount_options: options.btrfs_mount_options,
        }
    }
}

impl ProvisionConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let device = self.device.to_string_lossy();
        if device.trim().is_empty() {
            anyhow::bail!("Target device must be specified");
        }
        if !self.device.starts_with("/dev/") || self.device == Path::new("/dev") {
            anyhow::bail!("Target device must be a /dev path (got {})", device);
        }

        if !self.root_mount.is_absolute() {
            anyhow::bail!(
                "Root mount must be an absolute path (got {})",
                self.root_mount.display()
            );
        }
        if self.root_mount == Path::new("/") {
            anyhow::bail!("Root mount cannot be / (that is the running system)");
        }

        if self.root_size_gib == 0 || self.min_root_size_gib == 0 || self.min_home_size_gib == 0 {
            anyhow::bail!("Partition sizes must be at least 1 GiB");
        }
        if self.root_size_gib < self.min_root_size_gib {
            anyhow::bail!(
                "root_size_gib ({}) is smaller than min_root_size_gib ({})",
                self.root_size_gib,
                self.min_root_size_gib
            );
        }
        // Guard the GiB -> bytes conversion
        for size in [
            self.root_size_gib,
            self.min_root_size_gib,
            self.min_home_size_gib,
        ] {
            if size.checked_mul(GIB).is_none() {
                anyhow::bail!("Partition size {} GiB is out of range", size);
            }
        }

        if !self.filesystem.can_hold_root() {
            anyhow::bail!("{} cannot be used for the root filesystem", self.filesystem);
        }
        if self.policy.uses_subvolumes() && !self.filesystem.supports_subvolumes() {
            anyhow::bail!(
                "Layout {} requires btrfs (got {})",
                self.policy,
                self.filesystem
            );
        }

        Ok(())
    }

    /// Planner sizes in bytes.
    pub fn planner_options(&self) -> PlannerOptions {
        PlannerOptions {
            root_size: self.root_size_gib.saturating_mul(GIB),
            min_root_size: self.min_root_size_gib.saturating_mul(GIB),
            min_home_size: self.min_home_size_gib.saturating_mul(GIB),
        }
    }

    pub fn provision_options(&self) -> ProvisionOptions {
        ProvisionOptions {
            root_mount: self.root_mount.clone(),
            btrfs_mount_options: self.btrfs_mount_options.clone(),
        }
    }

    /// Validated request for `provision_device`.
    pub fn to_request(&self) -> Result<ProvisionRequest> {
        self.validate()?;
        Ok(ProvisionRequest {
            device: self.device.clone(),
            filesystem: self.filesystem,
            policy: self.policy,
            planner: self.planner_options(),
            options: self.provision_options(),
        })
    }
}
