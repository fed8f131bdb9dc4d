//! Type-safe storage vocabulary for the provisioner
//!
//! Filesystem, layout policy and partition role choices are proper Rust enums
//! instead of strings. The strum derives give every variant one spelling that
//! is shared by CLI flags, config files and log output.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Filesystem applied to a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum FilesystemKind {
    #[strum(serialize = "btrfs")]
    Btrfs,
    #[default]
    #[strum(serialize = "ext4")]
    Ext4,
    #[strum(serialize = "xfs")]
    Xfs,
    /// FAT32, only used for the EFI System Partition
    #[strum(serialize = "fat32")]
    Fat32,
}

impl FilesystemKind {
    /// Whether a Linux root filesystem can live on this kind.
    pub fn can_hold_root(self) -> bool {
        !matches!(self, Self::Fat32)
    }

    /// Whether the filesystem supports subvolumes.
    pub fn supports_subvolumes(self) -> bool {
        matches!(self, Self::Btrfs)
    }
}

/// How the space after the boot partition is divided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(ascii_case_insensitive)]
pub enum LayoutPolicy {
    /// Boot + one root partition spanning the rest of the disk
    #[default]
    #[strum(serialize = "single")]
    Single,
    /// Boot + root + separate home partition
    #[strum(serialize = "root-home")]
    RootHome,
    /// Boot + one Btrfs root partition carrying `@` and `@home` subvolumes
    #[strum(serialize = "root-subvolumes")]
    RootSubvolumes,
}

impl LayoutPolicy {
    /// Check if this policy creates a dedicated home partition
    pub fn has_home_partition(&self) -> bool {
        matches!(self, Self::RootHome)
    }

    /// Check if this policy creates Btrfs subvolumes
    pub fn uses_subvolumes(&self) -> bool {
        matches!(self, Self::RootSubvolumes)
    }
}

/// Logical role of a partition in a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionRole {
    Boot,
    Root,
    Home,
}

impl PartitionRole {
    /// sgdisk type code for the role.
    ///
    /// | Role | Code   | GPT type                  |
    /// |------|--------|---------------------------|
    /// | Boot | `ef00` | EFI System                |
    /// | Root | `8304` | Linux x86-64 root (/)     |
    /// | Home | `8302` | Linux /home               |
    pub fn gpt_typecode(self) -> &'static str {
        match self {
            Self::Boot => "ef00",
            Self::Root => "8304",
            Self::Home => "8302",
        }
    }

    /// Filesystem and GPT partition label for the role.
    pub fn label(self) -> &'static str {
        match self {
            Self::Boot => "EFI",
            Self::Root => "archroot",
            Self::Home => "archhome",
        }
    }
}
