//! Type-safe argument contracts for the storage tools.
//!
//! Every external program the provisioner runs gets a struct implementing
//! `ToolArgs`. The struct is the single source of truth for the flags that
//! program receives, so a flag typo is a failing unit test instead of a
//! half-partitioned disk.
//!
//! | Struct                | Program        |
//! |-----------------------|----------------|
//! | `LsblkArgs`           | `lsblk`        |
//! | `WipeFsArgs`          | `wipefs`       |
//! | `SgdiskClearArgs`     | `sgdisk`       |
//! | `SgdiskNewArgs`       | `sgdisk`       |
//! | `PartprobeArgs`       | `partprobe`    |
//! | `UdevSettleArgs`      | `udevadm`      |
//! | `MkfsArgs`            | `mkfs.*`       |
//! | `MountArgs`           | `mount`        |
//! | `UmountArgs`          | `umount`       |
//! | `SubvolumeCreateArgs` | `btrfs`        |

use std::path::PathBuf;

use crate::types::{FilesystemKind, PartitionRole};

/// Trait for typed tool arguments.
///
/// # Contract
///
/// - `program()`: executable name, resolved through `PATH` at execution time.
/// - `to_cli_args()`: arguments exactly as the program expects them.
/// - `get_env_vars()`: extra environment. Defaults to `LC_ALL=C` so tool
///   diagnostics are stable and untranslated.
pub trait ToolArgs {
    /// Executable name (e.g., "sgdisk").
    fn program(&self) -> &'static str;

    /// Convert struct fields to CLI arguments.
    fn to_cli_args(&self) -> Vec<String>;

    /// Get required environment variables.
    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![("LC_ALL".to_string(), "C".to_string())]
    }

    /// The full command line, for logs and dry-run output.
    fn command_line(&self) -> String {
        let mut parts = vec![self.program().to_string()];
        parts.extend(self.to_cli_args());
        parts.join(" ")
    }
}

/// Columns requested when listing whole disks.
pub const LSBLK_DISK_COLUMNS: &str = "NAME,PATH,SIZE,LOG-SEC,TYPE,RO,RM,MODEL,TRAN";

/// Columns requested when listing the partitions of one disk.
pub const LSBLK_PARTITION_COLUMNS: &str = "NAME,PATH,TYPE";

/// `lsblk --json --bytes` query.
#[derive(Debug, Clone)]
pub struct LsblkArgs {
    /// Restrict the query to one device; `None` lists everything.
    pub device: Option<PathBuf>,
    /// Omit children (`--nodeps`).
    pub nodeps: bool,
    /// Comma separated column list for `--output`.
    pub columns: &'static str,
}

impl LsblkArgs {
    /// Whole disks only, with geometry columns.
    pub fn disks(device: Option<PathBuf>) -> Self {
        Self {
            device,
            nodeps: true,
            columns: LSBLK_DISK_COLUMNS,
        }
    }

    /// One disk and its partition tree.
    pub fn partitions(device: PathBuf) -> Self {
        Self {
            device: Some(device),
            nodeps: false,
            columns: LSBLK_PARTITION_COLUMNS,
        }
    }
}

impl ToolArgs for LsblkArgs {
    fn program(&self) -> &'static str {
        "lsblk"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["--json".to_string(), "--bytes".to_string()];
        if self.nodeps {
            args.push("--nodeps".to_string());
        }
        args.push("--output".to_string());
        args.push(self.columns.to_string());
        if let Some(device) = &self.device {
            args.push(device.display().to_string());
        }
        args
    }
}

/// `wipefs --all` on a disk or partition.
#[derive(Debug, Clone)]
pub struct WipeFsArgs {
    pub target: PathBuf,
}

impl ToolArgs for WipeFsArgs {
    fn program(&self) -> &'static str {
        "wipefs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["--all".to_string(), self.target.display().to_string()]
    }
}

/// `sgdisk --clear`: write a fresh, empty GPT.
#[derive(Debug, Clone)]
pub struct SgdiskClearArgs {
    pub disk: PathBuf,
}

impl ToolArgs for SgdiskClearArgs {
    fn program(&self) -> &'static str {
        "sgdisk"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["--clear".to_string(), self.disk.display().to_string()]
    }
}

/// `sgdisk --new` for one partition.
///
/// # Field to Flag Mapping
///
/// | Field          | Flag |
/// |----------------|------|
/// | `number`, `start_sector`, `end_sector` | `--new=N:START:END` (END inclusive) |
/// | `role`         | `--typecode=N:CODE` and `--change-name=N:LABEL` |
/// | `bootable`     | `--attributes=N:set:2` (legacy BIOS bootable) |
#[derive(Debug, Clone)]
pub struct SgdiskNewArgs {
    pub disk: PathBuf,
    pub number: u32,
    pub start_sector: u64,
    pub end_sector: u64,
    pub role: PartitionRole,
    pub bootable: bool,
}

impl ToolArgs for SgdiskNewArgs {
    fn program(&self) -> &'static str {
        "sgdisk"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let n = self.number;
        let mut args = vec![
            format!("--new={}:{}:{}", n, self.start_sector, self.end_sector),
            format!("--typecode={}:{}", n, self.role.gpt_typecode()),
            format!("--change-name={}:{}", n, self.role.label()),
        ];
        if self.bootable {
            args.push(format!("--attributes={}:set:2", n));
        }
        args.push(self.disk.display().to_string());
        args
    }
}

/// `partprobe`: make the kernel re-read the partition table.
#[derive(Debug, Clone)]
pub struct PartprobeArgs {
    pub disk: PathBuf,
}

impl ToolArgs for PartprobeArgs {
    fn program(&self) -> &'static str {
        "partprobe"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.disk.display().to_string()]
    }
}

/// `udevadm settle`: wait until partition device nodes exist.
#[derive(Debug, Clone, Default)]
pub struct UdevSettleArgs;

impl ToolArgs for UdevSettleArgs {
    fn program(&self) -> &'static str {
        "udevadm"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["settle".to_string()]
    }
}

/// `mkfs.*` for one partition.
///
/// | Filesystem | Program      | Arguments |
/// |------------|--------------|-----------|
/// | Fat32      | `mkfs.fat`   | `-F 32 -n LABEL DEV` |
/// | Ext4       | `mkfs.ext4`  | `-F -L LABEL DEV` |
/// | Xfs        | `mkfs.xfs`   | `-f -L LABEL DEV` |
/// | Btrfs      | `mkfs.btrfs` | `-f -L LABEL DEV` |
#[derive(Debug, Clone)]
pub struct MkfsArgs {
    pub device: PathBuf,
    pub filesystem: FilesystemKind,
    pub label: Option<String>,
}

impl ToolArgs for MkfsArgs {
    fn program(&self) -> &'static str {
        mkfs_program(self.filesystem)
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args: Vec<String> = match self.filesystem {
            FilesystemKind::Fat32 => vec!["-F".into(), "32".into()],
            FilesystemKind::Ext4 => vec!["-F".into()],
            FilesystemKind::Xfs | FilesystemKind::Btrfs => vec!["-f".into()],
        };
        if let Some(label) = &self.label {
            let flag = if self.filesystem == FilesystemKind::Fat32 { "-n" } else { "-L" };
            args.push(flag.to_string());
            args.push(label.clone());
        }
        args.push(self.device.display().to_string());
        args
    }
}

/// Program that creates a filesystem of the given kind.
pub fn mkfs_program(filesystem: FilesystemKind) -> &'static str {
    match filesystem {
        FilesystemKind::Fat32 => "mkfs.fat",
        FilesystemKind::Ext4 => "mkfs.ext4",
        FilesystemKind::Xfs => "mkfs.xfs",
        FilesystemKind::Btrfs => "mkfs.btrfs",
    }
}

/// `mount [-o OPTIONS] SOURCE TARGET`
#[derive(Debug, Clone)]
pub struct MountArgs {
    pub source: PathBuf,
    pub target: PathBuf,
    pub options: Option<String>,
}

impl ToolArgs for MountArgs {
    fn program(&self) -> &'static str {
        "mount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(options) = self.options.as_deref().filter(|o| !o.is_empty()) {
            args.push("-o".to_string());
            args.push(options.to_string());
        }
        args.push(self.source.display().to_string());
        args.push(self.target.display().to_string());
        args
    }
}

/// `umount TARGET`
#[derive(Debug, Clone)]
pub struct UmountArgs {
    pub target: PathBuf,
}

impl ToolArgs for UmountArgs {
    fn program(&self) -> &'static str {
        "umount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.target.display().to_string()]
    }
}

/// `btrfs subvolume create MOUNTED_ROOT/NAME`
#[derive(Debug, Clone)]
pub struct SubvolumeCreateArgs {
    pub mounted_root: PathBuf,
    pub name: String,
}

impl ToolArgs for SubvolumeCreateArgs {
    fn program(&self) -> &'static str {
        "btrfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "subvolume".to_string(),
            "create".to_string(),
            self.mounted_root.join(&self.name).display().to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsblk_disk_query() {
        let args = LsblkArgs::disks(Some(PathBuf::from("/dev/sda")));
        assert_eq!(
            args.to_cli_args(),
            vec!["--json", "--bytes", "--nodeps", "--output", LSBLK_DISK_COLUMNS, "/dev/sda"]
        );
        assert!(!LsblkArgs::partitions(PathBuf::from("/dev/sda"))
            .to_cli_args()
            .contains(&"--nodeps".to_string()));
    }

    #[test]
    fn test_wipefs_args() {
        let args = WipeFsArgs {
            target: PathBuf::from("/dev/nvme0n1"),
        };
        assert_eq!(args.command_line(), "wipefs --all /dev/nvme0n1");
    }

    #[test]
    fn test_sgdisk_new_boot_partition() {
        let args = SgdiskNewArgs {
            disk: PathBuf::from("/dev/sda"),
            number: 1,
            start_sector: 2048,
            end_sector: 1050623,
            role: PartitionRole::Boot,
            bootable: true,
        };
        assert_eq!(
            args.to_cli_args(),
            vec![
                "--new=1:2048:1050623",
                "--typecode=1:ef00",
                "--change-name=1:EFI",
                "--attributes=1:set:2",
                "/dev/sda",
            ]
        );
    }

    #[test]
    fn test_sgdisk_new_root_partition_has_no_attributes() {
        let args = SgdiskNewArgs {
            disk: PathBuf::from("/dev/sda"),
            number: 2,
            start_sector: 1050624,
            end_sector: 2000000,
            role: PartitionRole::Root,
            bootable: false,
        };
        let cli = args.to_cli_args();
        assert_eq!(cli[1], "--typecode=2:8304");
        assert!(!cli.iter().any(|a| a.starts_with("--attributes")));
        // The disk is always the last argument
        assert_eq!(cli.last().map(String::as_str), Some("/dev/sda"));
    }

    #[test]
    fn test_mkfs_per_filesystem() {
        let fat = MkfsArgs {
            device: PathBuf::from("/dev/sda1"),
            filesystem: FilesystemKind::Fat32,
            label: Some("EFI".to_string()),
        };
        assert_eq!(fat.command_line(), "mkfs.fat -F 32 -n EFI /dev/sda1");

        let ext4 = MkfsArgs {
            device: PathBuf::from("/dev/sda2"),
            filesystem: FilesystemKind::Ext4,
            label: Some("archroot".to_string()),
        };
        assert_eq!(ext4.command_line(), "mkfs.ext4 -F -L archroot /dev/sda2");

        let xfs = MkfsArgs {
            device: PathBuf::from("/dev/sda3"),
            filesystem: FilesystemKind::Xfs,
            label: None,
        };
        assert_eq!(xfs.command_line(), "mkfs.xfs -f /dev/sda3");
    }

    #[test]
    fn test_mount_skips_empty_options() {
        let args = MountArgs {
            source: PathBuf::from("/dev/sda2"),
            target: PathBuf::from("/mnt"),
            options: Some(String::new()),
        };
        assert_eq!(args.to_cli_args(), vec!["/dev/sda2", "/mnt"]);

        let args = MountArgs {
            source: PathBuf::from("/dev/sda2"),
            target: PathBuf::from("/mnt/home"),
            options: Some("subvol=@home,compress=zstd".to_string()),
        };
        assert_eq!(
            args.to_cli_args(),
            vec!["-o", "subvol=@home,compress=zstd", "/dev/sda2", "/mnt/home"]
        );
    }

    #[test]
    fn test_subvolume_create_path() {
        let args = SubvolumeCreateArgs {
            mounted_root: PathBuf::from("/mnt"),
            name: "@home".to_string(),
        };
        assert_eq!(args.command_line(), "btrfs subvolume create /mnt/@home");
    }

    #[test]
    fn test_default_env_forces_c_locale() {
        let args = UmountArgs {
            target: PathBuf::from("/mnt"),
        };
        assert_eq!(
            args.get_env_vars(),
            vec![("LC_ALL".to_string(), "C".to_string())]
        );
    }
}
