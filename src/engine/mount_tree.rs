//! Mount tree handed to post-provisioning steps.
//!
//! Built by the engine one successful `mount` at a time. Downstream steps read
//! it to learn where the new system lives (`root()`) and which device backs
//! `/boot` for the bootloader. It serializes to JSON so a later process can
//! `release` it.

use crate::types::FilesystemKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// What backs a mount point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MountSource {
    /// A whole partition
    Partition { device: PathBuf },
    /// A Btrfs subvolume of a partition
    Subvolume { device: PathBuf, subvolume: String },
}

impl MountSource {
    /// Block device passed to `mount`.
    pub fn device(&self) -> &Path {
        match self {
            Self::Partition { device } | Self::Subvolume { device, .. } => device,
        }
    }
}

/// One active mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Path in the installed system (`/`, `/boot`, `/home`)
    pub target: PathBuf,
    /// Absolute path in the running system (`/mnt/boot`)
    pub path: PathBuf,
    pub source: MountSource,
    pub filesystem: FilesystemKind,
    #[serde(default)]
    pub options: Option<String>,
}

impl MountEntry {
    pub fn depth(&self) -> usize {
        path_depth(&self.target)
    }
}

/// Mounts established under one root, in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTree {
    root: PathBuf,
    entries: Vec<MountEntry>,
}

impl MountTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Vec::new(),
        }
    }

    /// Top-level mount point of the new system
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Active mounts in mount order
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entry mounted at a path of the installed system.
    pub fn get(&self, target: &Path) -> Option<&MountEntry> {
        self.entries.iter().find(|e| e.target == target)
    }

    /// Where `/boot` is mounted; the bootloader installer needs this.
    pub fn boot_entry(&self) -> Option<&MountEntry> {
        self.get(Path::new("/boot"))
    }

    /// Entries in teardown order: deepest first, later mounts first among equals.
    pub fn unmount_order(&self) -> Vec<&MountEntry> {
        let mut order: Vec<&MountEntry> = self.entries.iter().rev().collect();
        order.sort_by_key(|e| std::cmp::Reverse(e.depth()));
        order
    }

    /// Absolute path of a target under this tree's root.
    pub fn resolve(&self, target: &Path) -> PathBuf {
        resolve_target(&self.root, target)
    }

    pub(crate) fn record_mount(&mut self, entry: MountEntry) {
        self.entries.retain(|e| e.path != entry.path);
        self.entries.push(entry);
    }

    pub(crate) fn record_unmount(&mut self, path: &Path) {
        self.entries.retain(|e| e.path != path);
    }

    /// Save the tree as pretty JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize mount tree")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write mount tree to {}", path.display()))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read mount tree from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse mount tree {}", path.display()))
    }
}

/// Number of named components: `/` is 0, `/home` is 1, `/var/log` is 2.
pub fn path_depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

/// Map an installed-system path onto `root`: `/home` under `/mnt` is `/mnt/home`.
pub fn resolve_target(root: &Path, target: &Path) -> PathBuf {
    let mut resolved = root.to_path_buf();
    for component in target.components() {
        if let Component::Normal(part) = component {
            resolved.push(part);
        }
    }
    resolved
}
