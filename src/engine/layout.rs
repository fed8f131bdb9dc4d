//! Layout Planner
//!
//! Turns a `BlockDevice`, a `FilesystemKind` and a `LayoutPolicy` into a
//! `LayoutPlan`: partitions with byte-exact offsets and lengths, plus the
//! Btrfs subvolumes to create. Pure computation, no I/O.
//!
//! # Geometry
//!
//! ```text
//! 0      1 MiB              513 MiB                                usable_end  capacity
//! |------|------------------|-----------------------------------------|---------|
//!  align   EFI (fat32)        root [+ home]                             backup GPT
//! ```
//!
//! Everything is aligned to 1 MiB. The last MiB of the device is left to the
//! backup GPT header, so `usable_end = align_down(capacity - 1 MiB)`.
//!
//! # Root + Home Split
//!
//! With `available = usable_end - 513 MiB`:
//!
//! | Condition | Root | Home |
//! |-----------|------|------|
//! | `available >= root_size + min_home_size` | `root_size` | `available - root_size` |
//! | otherwise | `max(align_down(available / 2), min_root_size)`, at most `available - min_home_size` | `available - root` |
//!
//! Both lengths are derived from `available` alone. The split only fails when
//! `available < min_root_size + min_home_size`, and then with
//! `InsufficientCapacity`.

use crate::backend::PartitionRequest;
use crate::error::{ProvisionError, Result};
use crate::inventory::BlockDevice;
use crate::types::{FilesystemKind, LayoutPolicy, PartitionRole};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Every offset and length is a multiple of this
pub const ALIGNMENT: u64 = MIB;
/// Start of the EFI System Partition
pub const BOOT_OFFSET: u64 = MIB;
/// Size of the EFI System Partition
pub const BOOT_SIZE: u64 = 512 * MIB;
/// Space left free at the end of the disk for the backup GPT
pub const GPT_TAIL_RESERVE: u64 = MIB;

pub const BOOT_MOUNT: &str = "/boot";
pub const ROOT_MOUNT: &str = "/";
pub const HOME_MOUNT: &str = "/home";

pub const ROOT_SUBVOLUME: &str = "@";
pub const HOME_SUBVOLUME: &str = "@home";

/// Tunable sizes for the planner (bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerOptions {
    /// Fixed root size under root+home when the disk is large enough
    pub root_size: u64,
    /// Smallest acceptable root partition
    pub min_root_size: u64,
    /// Smallest acceptable home partition
    pub min_home_size: u64,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            root_size: 20 * GIB,
            min_root_size: GIB,
            min_home_size: GIB,
        }
    }
}

impl PlannerOptions {
    /// Sizes must be non-zero multiples of the alignment, and the fixed root
    /// size must not be below the root floor.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("root_size", self.root_size),
            ("min_root_size", self.min_root_size),
            ("min_home_size", self.min_home_size),
        ] {
            if value == 0 || value % ALIGNMENT != 0 {
                return Err(ProvisionError::config(format!(
                    "{} must be a non-zero multiple of 1 MiB (got {})",
                    name, value
                )));
            }
        }
        if self.root_size < self.min_root_size {
            return Err(ProvisionError::config(format!(
                "root_size ({}) is below min_root_size ({})",
                format_size(self.root_size),
                format_size(self.min_root_size)
            )));
        }
        Ok(())
    }
}

/// Partition flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFlags {
    pub bootable: bool,
}

/// One partition of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// 1-based number in the partition table, ascending with offset
    pub number: u32,
    pub role: PartitionRole,
    /// Byte offset from the start of the device
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
    pub filesystem: FilesystemKind,
    /// Where it appears in the installed system (`/`, `/boot`, `/home`)
    pub mount_target: PathBuf,
    pub flags: PartitionFlags,
}

impl PartitionSpec {
    /// First byte after the partition.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Filesystem label and GPT partition name.
    pub fn label(&self) -> &'static str {
        self.role.label()
    }

    /// Backend request for creating this partition.
    pub fn to_request(&self, sector_size: u64) -> PartitionRequest {
        PartitionRequest {
            number: self.number,
            offset: self.offset,
            length: self.length,
            sector_size,
            role: self.role,
            bootable: self.flags.bootable,
        }
    }
}

/// A Btrfs subvolume inside the root partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeSpec {
    pub name: String,
    pub mount_target: PathBuf,
}

/// Complete layout for one device.
///
/// Built by `plan`/`plan_with_options` only, and already validated when
/// returned. The engine consumes it read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutPlan {
    device: BlockDevice,
    filesystem: FilesystemKind,
    policy: LayoutPolicy,
    partitions: Vec<PartitionSpec>,
    subvolumes: Vec<SubvolumeSpec>,
}

impl LayoutPlan {
    pub fn device(&self) -> &BlockDevice {
        &self.device
    }

    /// Filesystem of the root (and home) partition
    pub fn filesystem(&self) -> FilesystemKind {
        self.filesystem
    }

    pub fn policy(&self) -> LayoutPolicy {
        self.policy
    }

    /// Partitions in ascending offset order
    pub fn partitions(&self) -> &[PartitionSpec] {
        &self.partitions
    }

    pub fn subvolumes(&self) -> &[SubvolumeSpec] {
        &self.subvolumes
    }

    pub fn boot(&self) -> Option<&PartitionSpec> {
        self.by_role(PartitionRole::Boot)
    }

    pub fn root(&self) -> Option<&PartitionSpec> {
        self.by_role(PartitionRole::Root)
    }

    pub fn home(&self) -> Option<&PartitionSpec> {
        self.by_role(PartitionRole::Home)
    }

    fn by_role(&self, role: PartitionRole) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.role == role)
    }

    /// Device node the partition will appear as.
    pub fn partition_device(&self, spec: &PartitionSpec) -> PathBuf {
        self.device.partition_path(spec.number)
    }

    /// Human-readable table for logs and the CLI.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Layout Plan: {} ({})", self.policy, self.filesystem);
        let _ = writeln!(
            out,
            "  Device: {} ({}, {} B sectors)",
            self.device.path.display(),
            format_size(self.device.capacity),
            self.device.sector_size
        );
        let _ = writeln!(out, "  Partitions ({}):", self.partitions.len());
        for spec in &self.partitions {
            let _ = writeln!(
                out,
                "    {}. {:<14} {:<5} {:<6} offset {:>10}  size {:>10}  -> {}{}",
                spec.number,
                self.partition_device(spec).display(),
                spec.role,
                spec.filesystem,
                format_size(spec.offset),
                format_size(spec.length),
                spec.mount_target.display(),
                if spec.flags.bootable { " [boot]" } else { "" }
            );
        }
        if !self.subvolumes.is_empty() {
            let _ = writeln!(out, "  Subvolumes ({}):", self.subvolumes.len());
            for subvolume in &self.subvolumes {
                let _ = writeln!(
                    out,
                    "    {:<6} -> {}",
                    subvolume.name,
                    subvolume.mount_target.display()
                );
            }
        }
        out.trim_end().to_string()
    }

    /// Re-check every structural invariant of the plan.
    ///
    /// # Errors
    ///
    /// `InvalidPlan` naming the first broken invariant.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(ProvisionError::invalid_plan(msg)) };
        let sector = self.device.sector_size;

        let count = |role: PartitionRole| self.partitions.iter().filter(|p| p.role == role).count();
        if count(PartitionRole::Boot) != 1 {
            return fail("plan must contain exactly one boot partition".into());
        }
        if count(PartitionRole::Root) != 1 {
            return fail("plan must contain exactly one root partition".into());
        }
        let homes = count(PartitionRole::Home);
        if self.policy.has_home_partition() != (homes == 1) || homes > 1 {
            return fail(format!(
                "{} home partition(s) under policy {}",
                homes, self.policy
            ));
        }

        if let Some(boot) = self.boot() {
            if boot.mount_target != Path::new(BOOT_MOUNT) || !boot.flags.bootable {
                return fail("boot partition must be bootable and mounted at /boot".into());
            }
            if boot.filesystem != FilesystemKind::Fat32 {
                return fail("boot partition must be fat32".into());
            }
        }

        let mut previous_end = 0u64;
        for (index, spec) in self.partitions.iter().enumerate() {
            if spec.number as usize != index + 1 {
                return fail(format!(
                    "partition {} is numbered {}",
                    index + 1,
                    spec.number
                ));
            }
            if spec.length == 0 {
                return fail(format!("partition {} has zero length", spec.number));
            }
            if spec.offset % sector != 0 || spec.length % sector != 0 {
                return fail(format!(
                    "partition {} is not aligned to {} byte sectors",
                    spec.number, sector
                ));
            }
            if spec.offset < previous_end {
                return fail(format!(
                    "partition {} overlaps its predecessor",
                    spec.number
                ));
            }
            previous_end = spec.end();
        }
        if previous_end > self.device.capacity {
            return fail(format!(
                "partitions end at {} but the device holds {}",
                previous_end, self.device.capacity
            ));
        }

        if self.policy.uses_subvolumes() {
            if self.filesystem != FilesystemKind::Btrfs {
                return fail("subvolumes require btrfs".into());
            }
            let expected = [(ROOT_SUBVOLUME, ROOT_MOUNT), (HOME_SUBVOLUME, HOME_MOUNT)];
            let matches = self.subvolumes.len() == expected.len()
                && self
                    .subvolumes
                    .iter()
                    .zip(expected)
                    .all(|(s, (name, target))| {
                        s.name == name && s.mount_target == Path::new(target)
                    });
            if !matches {
                return fail("subvolume layout must be @ at / and @home at /home".into());
            }
        } else if !self.subvolumes.is_empty() {
            return fail(format!("policy {} takes no subvolumes", self.policy));
        }

        Ok(())
    }
}

/// Plan a layout with the default planner options.
pub fn plan(
    device: &BlockDevice,
    filesystem: FilesystemKind,
    policy: LayoutPolicy,
) -> Result<LayoutPlan> {
    plan_with_options(device, filesystem, policy, &PlannerOptions::default())
}

/// Plan a layout.
///
/// # Errors
///
/// - `InvalidDevice` for a read-only device or a sector size that does not divide 1 MiB
/// - `InvalidPolicy` for an unsupported policy/filesystem pair
/// - `InsufficientCapacity` when the layout does not fit
/// - `Config` for inconsistent planner options
pub fn plan_with_options(
    device: &BlockDevice,
    filesystem: FilesystemKind,
    policy: LayoutPolicy,
    options: &PlannerOptions,
) -> Result<LayoutPlan> {
    options.validate()?;

    if device.read_only {
        return Err(ProvisionError::invalid_device(format!(
            "{} is read-only",
            device.path.display()
        )));
    }
    if device.sector_size == 0 || ALIGNMENT % device.sector_size != 0 {
        return Err(ProvisionError::invalid_device(format!(
            "{} has unsupported sector size {}",
            device.path.display(),
            device.sector_size
        )));
    }

    if !filesystem.can_hold_root() || (policy.uses_subvolumes() && !filesystem.supports_subvolumes())
    {
        return Err(ProvisionError::InvalidPolicy { policy, filesystem });
    }

    let root_offset = BOOT_OFFSET + BOOT_SIZE;
    let mut required = root_offset + options.min_root_size + GPT_TAIL_RESERVE;
    if policy.has_home_partition() {
        required += options.min_home_size;
    }
    let insufficient = || ProvisionError::InsufficientCapacity {
        required,
        available: device.capacity,
    };

    let usable_end = align_down(device.capacity.saturating_sub(GPT_TAIL_RESERVE), ALIGNMENT);
    let available = usable_end
        .checked_sub(root_offset)
        .ok_or_else(insufficient)?;

    let mut partitions = vec![PartitionSpec {
        number: 1,
        role: PartitionRole::Boot,
        offset: BOOT_OFFSET,
        length: BOOT_SIZE,
        filesystem: FilesystemKind::Fat32,
        mount_target: PathBuf::from(BOOT_MOUNT),
        flags: PartitionFlags { bootable: true },
    }];
    let mut subvolumes = Vec::new();

    let root_spec = |length| PartitionSpec {
        number: 2,
        role: PartitionRole::Root,
        offset: root_offset,
        length,
        filesystem,
        mount_target: PathBuf::from(ROOT_MOUNT),
        flags: PartitionFlags::default(),
    };

    match policy {
        LayoutPolicy::Single | LayoutPolicy::RootSubvolumes => {
            if available == 0 || available < options.min_root_size {
                return Err(insufficient());
            }
            partitions.push(root_spec(available));
            if policy.uses_subvolumes() {
                subvolumes.push(SubvolumeSpec {
                    name: ROOT_SUBVOLUME.to_string(),
                    mount_target: PathBuf::from(ROOT_MOUNT),
                });
                subvolumes.push(SubvolumeSpec {
                    name: HOME_SUBVOLUME.to_string(),
                    mount_target: PathBuf::from(HOME_MOUNT),
                });
            }
        }
        LayoutPolicy::RootHome => {
            let (root_len, home_len) =
                split_root_home(available, options).ok_or_else(insufficient)?;
            partitions.push(root_spec(root_len));
            partitions.push(PartitionSpec {
                number: 3,
                role: PartitionRole::Home,
                offset: root_offset + root_len,
                length: home_len,
                filesystem,
                mount_target: PathBuf::from(HOME_MOUNT),
                flags: PartitionFlags::default(),
            });
        }
    }

    let plan = LayoutPlan {
        device: device.clone(),
        filesystem,
        policy,
        partitions,
        subvolumes,
    };
    plan.validate()?;

    debug!("Planned layout:\n{}", plan.summary());
    Ok(plan)
}

/// Divide `available` bytes between root and home.
///
/// Returns `None` when either side would be zero or below its floor.
pub fn split_root_home(available: u64, options: &PlannerOptions) -> Option<(u64, u64)> {
    let fixed_fits = options
        .root_size
        .checked_add(options.min_home_size)
        .is_some_and(|needed| available >= needed);

    let root = if fixed_fits {
        options.root_size
    } else {
        let ceiling = available.checked_sub(options.min_home_size)?;
        align_down(available / 2, ALIGNMENT)
            .max(options.min_root_size)
            .min(ceiling)
    };
    let home = available.checked_sub(root)?;

    if root == 0 || home == 0 || root < options.min_root_size || home < options.min_home_size {
        return None;
    }
    Some((root, home))
}

/// Round `value` down to a multiple of `alignment`.
pub fn align_down(value: u64, alignment: u64) -> u64 {
    value - value % alignment
}

/// `512 MiB`, `19.50 GiB`, `4096 B`.
pub fn format_size(bytes: u64) -> String {
    if bytes >= GIB {
        if bytes % GIB == 0 {
            format!("{} GiB", bytes / GIB)
        } else {
            format!("{:.2} GiB", bytes as f64 / GIB as f64)
        }
    } else if bytes >= MIB && bytes % MIB == 0 {
        format!("{} MiB", bytes / MIB)
    } else {
        format!("{} B", bytes)
    }
}
