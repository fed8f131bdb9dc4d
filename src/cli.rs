use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config_file::ProvisionConfig;
use crate::types::{FilesystemKind, LayoutPolicy};

/// archprov - plan and provision the disk layout for an Arch Linux install
#[derive(Parser, Debug)]
#[command(name = "archprov")]
#[command(about = "Plan and provision the disk layout for an Arch Linux installation")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// The device is still probed so the plan is realistic, but every
    /// storage call is logged instead of executed.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List block devices that can be provisioned
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Compute and print the layout plan and operation schedule
    Plan {
        #[command(flatten)]
        layout: LayoutArgs,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Wipe, partition, format and mount the target device
    Provision {
        #[command(flatten)]
        layout: LayoutArgs,

        /// Confirm destructive operation
        #[arg(long)]
        confirm: bool,

        /// Write the resulting mount tree to this file
        #[arg(long)]
        mount_tree_out: Option<PathBuf>,
    },
    /// Unmount a saved mount tree, deepest mount first
    Release {
        /// Mount tree file written by `provision --mount-tree-out`
        #[arg(long)]
        mount_tree: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

/// Layout inputs: a config file, individual flags, or both (flags win).
#[derive(Args, Debug, Clone, Default)]
pub struct LayoutArgs {
    /// Configuration file to start from
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Target disk (e.g., /dev/sda)
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// Root filesystem (btrfs, ext4, xfs)
    #[arg(short, long)]
    pub filesystem: Option<FilesystemKind>,

    /// Layout policy (single, root-home, root-subvolumes)
    #[arg(short, long)]
    pub policy: Option<LayoutPolicy>,

    /// Fixed root size for root-home, in GiB
    #[arg(long)]
    pub root_size_gib: Option<u64>,

    /// Where to mount the new system
    #[arg(long)]
    pub root_mount: Option<PathBuf>,
}

impl LayoutArgs {
    /// Merge the config file (or defaults) with command-line overrides.
    pub fn resolve(&self) -> Result<ProvisionConfig> {
        let mut config = match &self.config {
            Some(path) => ProvisionConfig::load_from_file(path)?,
            None => ProvisionConfig::default(),
        };
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(filesystem) = self.filesystem {
            config.filesystem = filesystem;
        }
        if let Some(policy) = self.policy {
            config.policy = policy;
        }
        if let Some(size) = self.root_size_gib {
            config.root_size_gib = size;
        }
        if let Some(root_mount) = &self.root_mount {
            config.root_mount = root_mount.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["archprov"]).is_err());
    }

    #[test]
    fn test_cli_plan_with_flags() {
        let cli = Cli::try_parse_from([
            "archprov",
            "plan",
            "--device",
            "/dev/nvme0n1",
            "--filesystem",
            "btrfs",
            "--policy",
            "root-subvolumes",
        ])
        .expect("parse");
        match cli.command {
            Commands::Plan { layout, json } => {
                assert!(!json);
                let config = layout.resolve().expect("resolve");
                assert_eq!(config.device, PathBuf::from("/dev/nvme0n1"));
                assert_eq!(config.filesystem, FilesystemKind::Btrfs);
                assert_eq!(config.policy, LayoutPolicy::RootSubvolumes);
            }
            other => panic!("Expected Plan command, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_filesystem() {
        let result = Cli::try_parse_from(["archprov", "plan", "--filesystem", "ntfs"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_global_dry_run_after_subcommand() {
        let cli = Cli::try_parse_from(["archprov", "provision", "--confirm", "--dry-run"])
            .expect("parse");
        assert!(cli.dry_run);
        match cli.command {
            Commands::Provision { confirm, .. } => assert!(confirm),
            other => panic!("Expected Provision command, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_release_and_validate() {
        let cli = Cli::try_parse_from(["archprov", "release", "--mount-tree", "/tmp/tree.json"])
            .expect("parse");
        assert!(matches!(cli.command, Commands::Release { .. }));

        let cli = Cli::try_parse_from(["archprov", "validate", "/path/to/config.json"])
            .expect("parse");
        match cli.command {
            Commands::Validate { config } => {
                assert_eq!(config, PathBuf::from("/path/to/config.json"));
            }
            other => panic!("Expected Validate command, got {other:?}"),
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        ProvisionConfig {
            device: PathBuf::from("/dev/vda"),
            filesystem: FilesystemKind::Xfs,
            ..ProvisionConfig::default()
        }
        .save_to_file(&path)
        .expect("save");

        let args = LayoutArgs {
            config: Some(path),
            policy: Some(LayoutPolicy::RootHome),
            root_size_gib: Some(40),
            ..LayoutArgs::default()
        };
        let config = args.resolve().expect("resolve");
        assert_eq!(config.device, PathBuf::from("/dev/vda"));
        assert_eq!(config.filesystem, FilesystemKind::Xfs);
        assert_eq!(config.policy, LayoutPolicy::RootHome);
        assert_eq!(config.root_size_gib, 40);
    }

    #[test]
    fn test_resolve_validates() {
        let args = LayoutArgs {
            filesystem: Some(FilesystemKind::Ext4),
            policy: Some(LayoutPolicy::RootSubvolumes),
            ..LayoutArgs::default()
        };
        assert!(args.resolve().is_err());
    }
}
