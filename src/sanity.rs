//! Pre-flight sanity checks for runtime environment
//!
//! Before a single storage tool runs, verify:
//! - Every binary the chosen layout needs is on `PATH`
//! - Running with root privileges (EUID 0)
//!
//! Dry runs skip these checks; they never call the tools.

use crate::tools::mkfs_program;
use crate::types::{FilesystemKind, LayoutPolicy};
use std::fmt::Write as _;
use tracing::{debug, info};

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }

    /// Multi-line explanation of what failed and how to fix it.
    pub fn report(&self) -> String {
        let mut out = String::from("Pre-flight check failed\n");

        if !self.is_root {
            let _ = writeln!(out, "\n  Root privileges required");
            let _ = writeln!(
                out,
                "  Partitioning and formatting need root. Run with sudo or as root."
            );
        }

        if !self.missing_binaries.is_empty() {
            let _ = writeln!(out, "\n  Missing required binaries:");
            for binary in &self.missing_binaries {
                let _ = writeln!(
                    out,
                    "    - {} (install: pacman -S {})",
                    binary,
                    package_for_binary(binary)
                );
            }
            let mut packages: Vec<&str> = self
                .missing_binaries
                .iter()
                .map(|b| package_for_binary(b))
                .collect();
            packages.sort_unstable();
            packages.dedup();
            let _ = writeln!(out, "\n  Fix: pacman -S {}", packages.join(" "));
        }

        out.trim_end().to_string()
    }
}

/// Binaries needed for every layout
const BASE_BINARIES: &[&str] = &[
    "lsblk",     // Device inventory (util-linux)
    "wipefs",    // Signature wiping (util-linux)
    "sgdisk",    // GPT partitioning (gptfdisk)
    "partprobe", // Partition table re-read (parted)
    "udevadm",   // Waiting for device nodes (systemd)
    "mount",     // util-linux
    "umount",    // util-linux
    "mkfs.fat",  // EFI System Partition (dosfstools)
];

/// Binaries needed to provision `filesystem` under `policy`.
pub fn required_binaries(filesystem: FilesystemKind, policy: LayoutPolicy) -> Vec<&'static str> {
    let mut binaries = BASE_BINARIES.to_vec();
    let mkfs = mkfs_program(filesystem);
    if !binaries.contains(&mkfs) {
        binaries.push(mkfs);
    }
    if policy.uses_subvolumes() {
        binaries.push("btrfs");
    }
    binaries
}

/// Check if a binary is available in PATH
fn binary_exists(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Check if running as root (EUID 0)
fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Perform all sanity checks and return the result
pub fn verify_environment(filesystem: FilesystemKind, policy: LayoutPolicy) -> SanityCheckResult {
    debug!("Running pre-flight sanity checks...");

    let missing_binaries: Vec<String> = required_binaries(filesystem, policy)
        .into_iter()
        .filter(|b| !binary_exists(b))
        .map(str::to_string)
        .collect();

    let result = SanityCheckResult {
        missing_binaries,
        is_root: is_running_as_root(),
    };

    if result.is_ok() {
        info!("Pre-flight checks passed");
    }
    result
}

/// Map binary names to their Arch Linux package names
fn package_for_binary(binary: &str) -> &'static str {
    match binary {
        "lsblk" | "wipefs" | "mount" | "umount" => "util-linux",
        "sgdisk" => "gptfdisk",
        "partprobe" => "parted",
        "udevadm" => "systemd",
        "mkfs.fat" => "dosfstools",
        "mkfs.ext4" => "e2fsprogs",
        "mkfs.xfs" => "xfsprogs",
        "mkfs.btrfs" | "btrfs" => "btrfs-progs",
        _ => "unknown",
    }
}
