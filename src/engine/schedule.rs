//! Provisioning schedule
//!
//! Expands a `LayoutPlan` into the exact `StorageOp`s the engine will run,
//! grouped by the stage each group completes. Pure, like the planner: `plan`
//! and `provision --dry-run` print this same schedule.
//!
//! | Stage             | Operations |
//! |-------------------|------------|
//! | Wiped             | wipe every existing partition, then the disk |
//! | PartitionsCreated | fresh GPT, then one partition per spec in ascending offset |
//! | Formatted         | mkfs per spec in ascending offset |
//! | Mounted           | mkdir + mount per target, shallowest first |
//!
//! For root+subvolumes the Mounted stage starts with the double mount: mount
//! the raw Btrfs root, create `@` and `@home`, unmount, then mount the
//! subvolumes like any other target.

use crate::backend::{PartitionRequest, StorageBackend};
use crate::engine::layout::{LayoutPlan, PartitionSpec};
use crate::engine::mount_tree::{MountEntry, MountSource, path_depth, resolve_target};
use crate::engine::provision::ProvisionOptions;
use crate::provision_state::ProvisionStage;
use crate::types::FilesystemKind;
use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// Storage Operation Types
// ============================================================================

/// One call into the storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Erase signatures from a disk or partition
    WipeSignatures { target: PathBuf },

    /// Write an empty GPT
    CreatePartitionTable { device: PathBuf },

    /// Create one partition
    CreatePartition {
        device: PathBuf,
        request: PartitionRequest,
    },

    /// Create a filesystem
    Format {
        partition: PathBuf,
        filesystem: FilesystemKind,
        label: String,
    },

    /// Create a mount point directory
    CreateDir { path: PathBuf },

    /// Mount and record the mount in the tree
    Mount { entry: MountEntry },

    /// Create a Btrfs subvolume below a mounted filesystem root
    CreateSubvolume { mounted_root: PathBuf, name: String },

    /// Unmount and drop the mount from the tree
    Unmount { target: PathBuf },
}

impl StorageOp {
    /// Backend primitive this operation calls; reported when it fails.
    pub fn step_name(&self) -> &'static str {
        match self {
            Self::WipeSignatures { .. } => "wipe_signatures",
            Self::CreatePartitionTable { .. } => "create_partition_table",
            Self::CreatePartition { .. } => "create_partition",
            Self::Format { .. } => "format",
            Self::CreateDir { .. } => "create_dir",
            Self::Mount { .. } => "mount",
            Self::CreateSubvolume { .. } => "create_subvolume",
            Self::Unmount { .. } => "unmount",
        }
    }

    /// Returns true if the operation destroys data on the device.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::WipeSignatures { .. }
                | Self::CreatePartitionTable { .. }
                | Self::CreatePartition { .. }
                | Self::Format { .. }
        )
    }

    /// Run the operation against a backend.
    pub fn apply(&self, backend: &mut dyn StorageBackend) -> Result<()> {
        match self {
            Self::WipeSignatures { target } => backend.wipe_signatures(target),
            Self::CreatePartitionTable { device } => backend.create_partition_table(device),
            Self::CreatePartition { device, request } => backend.create_partition(device, request),
            Self::Format {
                partition,
                filesystem,
                label,
            } => backend.format(partition, *filesystem, Some(label.as_str())),
            Self::CreateDir { path } => backend.create_dir(path),
            Self::Mount { entry } => {
                backend.mount(entry.source.device(), &entry.path, entry.options.as_deref())
            }
            Self::CreateSubvolume { mounted_root, name } => {
                backend.create_subvolume(mounted_root, name)
            }
            Self::Unmount { target } => backend.unmount(target),
        }
    }
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WipeSignatures { target } => write!(f, "WipeSignatures({})", target.display()),
            Self::CreatePartitionTable { device } => {
                write!(f, "CreatePartitionTable({}, gpt)", device.display())
            }
            Self::CreatePartition { device, request } => write!(
                f,
                "CreatePartition({} #{}, {}, sectors {}..={}{})",
                device.display(),
                request.number,
                request.role,
                request.start_sector(),
                request.end_sector(),
                if request.bootable { ", bootable" } else { "" }
            ),
            Self::Format {
                partition,
                filesystem,
                label,
            } => write!(
                f,
                "Format({}, fs={}, label={})",
                partition.display(),
                filesystem,
                label
            ),
            Self::CreateDir { path } => write!(f, "CreateDir({})", path.display()),
            Self::Mount { entry } => {
                let source = match &entry.source {
                    MountSource::Partition { device } => device.display().to_string(),
                    MountSource::Subvolume { device, subvolume } => {
                        format!("{}[{}]", device.display(), subvolume)
                    }
                };
                write!(
                    f,
                    "Mount({} -> {}, opts={:?})",
                    source,
                    entry.path.display(),
                    entry.options
                )
            }
            Self::CreateSubvolume { mounted_root, name } => write!(
                f,
                "CreateSubvolume({})",
                mounted_root.join(name).display()
            ),
            Self::Unmount { target } => write!(f, "Unmount({})", target.display()),
        }
    }
}

/// Operations that together complete one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOps {
    /// Stage reached once every operation succeeded
    pub stage: ProvisionStage,
    pub ops: Vec<StorageOp>,
}

/// Every operation of a provisioning run, grouped by stage in stage order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    device: PathBuf,
    stages: Vec<StageOps>,
}

impl Schedule {
    /// Derive the schedule for `plan`.
    ///
    /// `existing_partitions` are the partition nodes currently on the device;
    /// their signatures are wiped before the disk's own.
    pub fn build(
        plan: &LayoutPlan,
        options: &ProvisionOptions,
        existing_partitions: &[PathBuf],
    ) -> Self {
        let device = plan.device().path.clone();
        let sector_size = plan.device().sector_size;

        let mut specs: Vec<&PartitionSpec> = plan.partitions().iter().collect();
        specs.sort_by_key(|s| s.offset);

        let mut wiped: Vec<StorageOp> = existing_partitions
            .iter()
            .map(|p| StorageOp::WipeSignatures { target: p.clone() })
            .collect();
        wiped.push(StorageOp::WipeSignatures {
            target: device.clone(),
        });

        let mut created = vec![StorageOp::CreatePartitionTable {
            device: device.clone(),
        }];
        created.extend(specs.iter().map(|s| StorageOp::CreatePartition {
            device: device.clone(),
            request: s.to_request(sector_size),
        }));

        let formatted = specs
            .iter()
            .map(|s| StorageOp::Format {
                partition: plan.partition_device(s),
                filesystem: s.filesystem,
                label: s.label().to_string(),
            })
            .collect();

        Self {
            device,
            stages: vec![
                StageOps {
                    stage: ProvisionStage::Wiped,
                    ops: wiped,
                },
                StageOps {
                    stage: ProvisionStage::PartitionsCreated,
                    ops: created,
                },
                StageOps {
                    stage: ProvisionStage::Formatted,
                    ops: formatted,
                },
                StageOps {
                    stage: ProvisionStage::Mounted,
                    ops: mount_ops(plan, options),
                },
            ],
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn stages(&self) -> &[StageOps] {
        &self.stages
    }

    /// All operations in execution order.
    pub fn ops(&self) -> impl Iterator<Item = &StorageOp> {
        self.stages.iter().flat_map(|s| s.ops.iter())
    }

    /// Total number of operations.
    pub fn len(&self) -> usize {
        self.stages.iter().map(|s| s.ops.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of operations that destroy data on the device.
    pub fn destructive_len(&self) -> usize {
        self.ops().filter(|op| op.is_destructive()).count()
    }

    /// Returns a summary of the schedule for logging/display.
    ///
    /// Destructive operations are marked with `!`.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Provisioning Schedule: {} ({} operations, {} destructive)",
            self.device.display(),
            self.len(),
            self.destructive_len()
        )];
        let mut n = 0;
        for stage in &self.stages {
            lines.push(format!("  -> {}", stage.stage));
            for op in &stage.ops {
                n += 1;
                let mark = if op.is_destructive() { '!' } else { ' ' };
                lines.push(format!("  {} {}. {}", mark, n, op));
            }
        }
        lines.join("\n")
    }
}

/// Mount options for a plain partition of `filesystem`.
fn partition_mount_options(filesystem: FilesystemKind, options: &ProvisionOptions) -> Option<String> {
    if filesystem == FilesystemKind::Btrfs && !options.btrfs_mount_options.is_empty() {
        Some(options.btrfs_mount_options.clone())
    } else {
        None
    }
}

/// `subvol=NAME` plus the configured Btrfs options.
fn subvolume_mount_options(name: &str, options: &ProvisionOptions) -> String {
    if options.btrfs_mount_options.is_empty() {
        format!("subvol={}", name)
    } else {
        format!("subvol={},{}", name, options.btrfs_mount_options)
    }
}

fn mount_ops(plan: &LayoutPlan, options: &ProvisionOptions) -> Vec<StorageOp> {
    let root_mount = options.root_mount.as_path();
    let mut ops = Vec::new();
    let mut entries: Vec<MountEntry> = Vec::new();

    for spec in plan.partitions() {
        let device = plan.partition_device(spec);
        if plan.policy().uses_subvolumes() && spec.filesystem.supports_subvolumes() {
            // Subvolumes can only be created once the filesystem is mounted,
            // and only mounted by name once they exist.
            ops.push(StorageOp::CreateDir {
                path: root_mount.to_path_buf(),
            });
            ops.push(StorageOp::Mount {
                entry: MountEntry {
                    target: PathBuf::from("/"),
                    path: root_mount.to_path_buf(),
                    source: MountSource::Partition {
                        device: device.clone(),
                    },
                    filesystem: spec.filesystem,
                    options: None,
                },
            });
            for subvolume in plan.subvolumes() {
                ops.push(StorageOp::CreateSubvolume {
                    mounted_root: root_mount.to_path_buf(),
                    name: subvolume.name.clone(),
                });
            }
            ops.push(StorageOp::Unmount {
                target: root_mount.to_path_buf(),
            });

            entries.extend(plan.subvolumes().iter().map(|subvolume| MountEntry {
                target: subvolume.mount_target.clone(),
                path: resolve_target(root_mount, &subvolume.mount_target),
                source: MountSource::Subvolume {
                    device: device.clone(),
                    subvolume: subvolume.name.clone(),
                },
                filesystem: spec.filesystem,
                options: Some(subvolume_mount_options(&subvolume.name, options)),
            }));
        } else {
            entries.push(MountEntry {
                target: spec.mount_target.clone(),
                path: resolve_target(root_mount, &spec.mount_target),
                source: MountSource::Partition { device },
                filesystem: spec.filesystem,
                options: partition_mount_options(spec.filesystem, options),
            });
        }
    }

    // Parents before children; ties broken by path for a stable order
    entries.sort_by(|a, b| {
        path_depth(&a.target)
            .cmp(&path_depth(&b.target))
            .then_with(|| a.target.cmp(&b.target))
    });

    for entry in entries {
        ops.push(StorageOp::CreateDir {
            path: entry.path.clone(),
        });
        ops.push(StorageOp::Mount { entry });
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::layout::{GIB, plan};
    use crate::inventory::BlockDevice;
    use crate::types::LayoutPolicy;

    fn schedule_for(fs: FilesystemKind, policy: LayoutPolicy) -> Schedule {
        let device = BlockDevice::new("/dev/sda", 512, 64 * GIB);
        let plan = plan(&device, fs, policy).expect("plan");
        Schedule::build(&plan, &ProvisionOptions::default(), &[])
    }

    fn mounted_ops(schedule: &Schedule) -> &[StorageOp] {
        &schedule.stages()[3].ops
    }

    #[test]
    fn test_stages_in_order() {
        let schedule = schedule_for(FilesystemKind::Ext4, LayoutPolicy::RootHome);
        let stages: Vec<_> = schedule.stages().iter().map(|s| s.stage).collect();
        assert_eq!(
            stages,
            vec![
                ProvisionStage::Wiped,
                ProvisionStage::PartitionsCreated,
                ProvisionStage::Formatted,
                ProvisionStage::Mounted
            ]
        );
    }

    #[test]
    fn test_existing_partitions_wiped_before_disk() {
        let device = BlockDevice::new("/dev/nvme0n1", 512, 64 * GIB);
        let plan = plan(&device, FilesystemKind::Ext4, LayoutPolicy::Single).expect("plan");
        let existing = vec![
            PathBuf::from("/dev/nvme0n1p1"),
            PathBuf::from("/dev/nvme0n1p2"),
        ];
        let schedule = Schedule::build(&plan, &ProvisionOptions::default(), &existing);
        let targets: Vec<_> = schedule.stages()[0]
            .ops
            .iter()
            .map(|op| match op {
                StorageOp::WipeSignatures { target } => target.clone(),
                other => panic!("unexpected op {other}"),
            })
            .collect();
        assert_eq!(
            targets,
            vec![
                PathBuf::from("/dev/nvme0n1p1"),
                PathBuf::from("/dev/nvme0n1p2"),
                PathBuf::from("/dev/nvme0n1"),
            ]
        );
    }

    #[test]
    fn test_partitions_created_in_offset_order() {
        let schedule = schedule_for(FilesystemKind::Xfs, LayoutPolicy::RootHome);
        let ops = &schedule.stages()[1].ops;
        assert!(matches!(ops[0], StorageOp::CreatePartitionTable { .. }));
        let offsets: Vec<u64> = ops[1..]
            .iter()
            .filter_map(|op| match op {
                StorageOp::CreatePartition { request, .. } => Some(request.offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets.len(), 3);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_format_uses_role_labels() {
        let schedule = schedule_for(FilesystemKind::Ext4, LayoutPolicy::RootHome);
        let formats: Vec<_> = schedule.stages()[2]
            .ops
            .iter()
            .map(|op| op.to_string())
            .collect();
        assert_eq!(
            formats,
            vec![
                "Format(/dev/sda1, fs=fat32, label=EFI)",
                "Format(/dev/sda2, fs=ext4, label=archroot)",
                "Format(/dev/sda3, fs=ext4, label=archhome)",
            ]
        );
    }

    #[test]
    fn test_mounts_shallowest_first() {
        let schedule = schedule_for(FilesystemKind::Ext4, LayoutPolicy::RootHome);
        let mounted: Vec<_> = mounted_ops(&schedule)
            .iter()
            .filter_map(|op| match op {
                StorageOp::Mount { entry } => Some(entry.path.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            mounted,
            vec![
                PathBuf::from("/mnt"),
                PathBuf::from("/mnt/boot"),
                PathBuf::from("/mnt/home"),
            ]
        );
    }

    #[test]
    fn test_btrfs_double_mount_sequence() {
        let schedule = schedule_for(FilesystemKind::Btrfs, LayoutPolicy::RootSubvolumes);
        let steps: Vec<String> = mounted_ops(&schedule)
            .iter()
            .map(|op| op.to_string())
            .collect();
        assert_eq!(
            steps,
            vec![
                "CreateDir(/mnt)",
                "Mount(/dev/sda2 -> /mnt, opts=None)",
                "CreateSubvolume(/mnt/@)",
                "CreateSubvolume(/mnt/@home)",
                "Unmount(/mnt)",
                "CreateDir(/mnt)",
                "Mount(/dev/sda2[@] -> /mnt, opts=Some(\"subvol=@,compress=zstd,noatime\"))",
                "CreateDir(/mnt/boot)",
                "Mount(/dev/sda1 -> /mnt/boot, opts=None)",
                "CreateDir(/mnt/home)",
                "Mount(/dev/sda2[@home] -> /mnt/home, opts=Some(\"subvol=@home,compress=zstd,noatime\"))",
            ]
        );
    }

    #[test]
    fn test_plain_btrfs_root_gets_mount_options() {
        let schedule = schedule_for(FilesystemKind::Btrfs, LayoutPolicy::Single);
        let root = mounted_ops(&schedule)
            .iter()
            .find_map(|op| match op {
                StorageOp::Mount { entry } if entry.target == Path::new("/") => Some(entry),
                _ => None,
            })
            .expect("root mount");
        assert_eq!(root.options.as_deref(), Some("compress=zstd,noatime"));
    }

    #[test]
    fn test_custom_root_mount() {
        let device = BlockDevice::new("/dev/sda", 512, 64 * GIB);
        let plan = plan(&device, FilesystemKind::Ext4, LayoutPolicy::Single).expect("plan");
        let options = ProvisionOptions {
            root_mount: PathBuf::from("/target"),
            ..ProvisionOptions::default()
        };
        let schedule = Schedule::build(&plan, &options, &[]);
        assert!(
            schedule
                .ops()
                .any(|op| op.to_string() == "Mount(/dev/sda1 -> /target/boot, opts=None)")
        );
    }

    #[test]
    fn test_destructive_ops_only_before_mount_stage() {
        let schedule = schedule_for(FilesystemKind::Btrfs, LayoutPolicy::RootSubvolumes);
        assert!(mounted_ops(&schedule).iter().all(|op| !op.is_destructive()));
        assert!(schedule.stages()[..3]
            .iter()
            .flat_map(|s| s.ops.iter())
            .all(StorageOp::is_destructive));
        assert!(schedule.summary().contains("-> partitions created"));
    }

    #[test]
    fn test_summary_marks_destructive_ops() {
        let schedule = schedule_for(FilesystemKind::Ext4, LayoutPolicy::RootHome);
        let before_mount: usize = schedule.stages()[..3].iter().map(|s| s.ops.len()).sum();
        assert_eq!(schedule.destructive_len(), before_mount);

        let summary = schedule.summary();
        assert!(summary.contains(&format!(
            "({} operations, {} destructive)",
            schedule.len(),
            before_mount
        )));
        let marked = summary.lines().filter(|l| l.starts_with("  ! ")).count();
        assert_eq!(marked, before_mount);
        assert!(summary.lines().any(|l| l.starts_with("    ") && l.contains("Mount")));
    }
}
