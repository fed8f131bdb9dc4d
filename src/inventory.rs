//! Device Inventory
//!
//! Enumerates block devices and reports their geometry. The planner only needs
//! path, logical sector size and capacity; the rest is shown to the operator
//! when picking a disk.
//!
//! The real implementation asks `lsblk --json --bytes`. util-linux changed the
//! JSON it emits over the years (numbers and booleans used to be strings), so
//! the parser accepts both forms.

use crate::backend::command::run_tool;
use crate::tools::LsblkArgs;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A whole disk as the OS reports it. Read once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub path: PathBuf,
    /// Logical sector size in bytes
    pub sector_size: u64,
    /// Total capacity in bytes
    pub capacity: u64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub removable: bool,
}

impl BlockDevice {
    /// A writable device with no descriptive metadata.
    pub fn new(path: impl Into<PathBuf>, sector_size: u64, capacity: u64) -> Self {
        Self {
            path: path.into(),
            sector_size,
            capacity,
            model: None,
            transport: None,
            read_only: false,
            removable: false,
        }
    }

    /// Device node of partition `number` on this disk.
    pub fn partition_path(&self, number: u32) -> PathBuf {
        partition_path(&self.path, number)
    }
}

/// Device node of partition `number` on `disk`.
///
/// Disks whose name ends in a digit (`nvme0n1`, `mmcblk0`, `loop0`) take a
/// `p` separator: `/dev/nvme0n1p2`, but `/dev/sda2`.
pub fn partition_path(disk: &Path, number: u32) -> PathBuf {
    let disk_str = disk.display().to_string();
    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk_str, number))
    } else {
        PathBuf::from(format!("{}{}", disk_str, number))
    }
}

/// Source of block device information.
pub trait DeviceInventory {
    /// Every whole disk with a non-zero size.
    fn list(&self) -> Result<Vec<BlockDevice>>;

    /// Geometry of one whole disk.
    fn probe(&self, path: &Path) -> Result<BlockDevice>;

    /// Existing partition device nodes on a disk.
    fn partitions(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// Inventory backed by `lsblk`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LsblkInventory;

impl LsblkInventory {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceInventory for LsblkInventory {
    fn list(&self) -> Result<Vec<BlockDevice>> {
        let args = LsblkArgs::disks(None);
        let output = run_tool(&args)?;
        output.ensure_success("lsblk")?;
        devices_from_lsblk(&output.stdout)
    }

    fn probe(&self, path: &Path) -> Result<BlockDevice> {
        let args = LsblkArgs::disks(Some(path.to_path_buf()));
        let output = run_tool(&args)?;
        output.ensure_success(&format!("lsblk {}", path.display()))?;
        find_disk(devices_from_lsblk(&output.stdout)?, path)
    }

    fn partitions(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let args = LsblkArgs::partitions(path.to_path_buf());
        let output = run_tool(&args)?;
        output.ensure_success(&format!("lsblk {}", path.display()))?;
        partitions_from_lsblk(&output.stdout)
    }
}

/// Pick `path` out of `devices`, following symlinks like `/dev/disk/by-id/...`
/// to the node lsblk reports.
pub fn find_disk(devices: Vec<BlockDevice>, path: &Path) -> Result<BlockDevice> {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if canonical != path {
        debug!("{} resolves to {}", path.display(), canonical.display());
    }
    devices
        .into_iter()
        .find(|d| d.path == canonical || d.path == path)
        .with_context(|| format!("{} is not a whole disk", path.display()))
}

// ============================================================================
// lsblk JSON
// ============================================================================

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkEntry>,
}

#[derive(Debug, Deserialize)]
struct LsblkEntry {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default, deserialize_with = "de_u64")]
    size: Option<u64>,
    #[serde(rename = "log-sec", default, deserialize_with = "de_u64")]
    log_sec: Option<u64>,
    #[serde(default, deserialize_with = "de_bool")]
    ro: Option<bool>,
    #[serde(default, deserialize_with = "de_bool")]
    rm: Option<bool>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    children: Vec<LsblkEntry>,
}

impl LsblkEntry {
    fn device_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from("/dev").join(&self.name),
        }
    }

    fn is(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }
}

/// Accepts `123`, `"123"` and `null`.
fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    use serde::de::Error;
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("not an unsigned integer: {}", n))),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("not an unsigned integer: {:?}", s))),
        Some(other) => Err(D::Error::custom(format!("unexpected value: {}", other))),
    }
}

/// Accepts `true`, `"1"`, `1` and their false counterparts.
fn de_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    use serde::de::Error;
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Bool(b)) => Ok(Some(b)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.as_u64() != Some(0))),
        Some(serde_json::Value::String(s)) => match s.trim() {
            "1" | "true" => Ok(Some(true)),
            "0" | "false" | "" => Ok(Some(false)),
            other => Err(D::Error::custom(format!("not a boolean: {:?}", other))),
        },
        Some(other) => Err(D::Error::custom(format!("unexpected value: {}", other))),
    }
}

/// Whole disks from `lsblk --json --bytes --nodeps` output.
pub fn devices_from_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput =
        serde_json::from_str(json).context("Failed to parse lsblk JSON output")?;

    let mut devices = Vec::new();
    for entry in parsed.blockdevices.iter().filter(|e| e.is("disk")) {
        let capacity = entry.size.unwrap_or(0);
        if capacity == 0 {
            debug!("Skipping {}: zero size", entry.name);
            continue;
        }
        let Some(sector_size) = entry.log_sec.filter(|s| *s > 0) else {
            bail!("lsblk reported no logical sector size for {}", entry.name);
        };
        devices.push(BlockDevice {
            path: entry.device_path(),
            sector_size,
            capacity,
            model: entry
                .model
                .as_ref()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
            transport: entry.tran.clone().filter(|t| !t.is_empty()),
            read_only: entry.ro.unwrap_or(false),
            removable: entry.rm.unwrap_or(false),
        });
    }

    debug!("Inventory: {} disk(s)", devices.len());
    Ok(devices)
}

/// Partition nodes from `lsblk --json` output for one disk.
pub fn partitions_from_lsblk(json: &str) -> Result<Vec<PathBuf>> {
    let parsed: LsblkOutput =
        serde_json::from_str(json).context("Failed to parse lsblk JSON output")?;

    fn collect(entries: &[LsblkEntry], out: &mut Vec<PathBuf>) {
        for entry in entries {
            if entry.is("part") {
                out.push(entry.device_path());
            }
            collect(&entry.children, out);
        }
    }

    let mut partitions = Vec::new();
    collect(&parsed.blockdevices, &mut partitions);
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERN: &str = r#"{
        "blockdevices": [
            {"name":"sda","path":"/dev/sda","size":42949672960,"log-sec":512,"type":"disk",
             "ro":false,"rm":false,"model":"QEMU HARDDISK   ","tran":"sata"},
            {"name":"nvme0n1","path":"/dev/nvme0n1","size":512110190592,"log-sec":4096,
             "type":"disk","ro":false,"rm":false,"model":"Samsung SSD 980","tran":"nvme"},
            {"name":"sr0","path":"/dev/sr0","size":1073741312,"log-sec":2048,"type":"rom",
             "ro":true,"rm":true,"model":"QEMU DVD-ROM","tran":"sata"},
            {"name":"loop1","path":"/dev/loop1","size":0,"log-sec":512,"type":"disk",
             "ro":false,"rm":false,"model":null,"tran":null}
        ]
    }"#;

    const LEGACY: &str = r#"{
        "blockdevices": [
            {"name":"sdb","size":"8004829184","log-sec":"512","type":"disk",
             "ro":"1","rm":"1","model":"Cruzer","tran":"usb"}
        ]
    }"#;

    #[test]
    fn test_parse_modern_lsblk() {
        let devices = devices_from_lsblk(MODERN).expect("parse");
        assert_eq!(devices.len(), 2);

        assert_eq!(devices[0].path, PathBuf::from("/dev/sda"));
        assert_eq!(devices[0].capacity, 40 * 1024 * 1024 * 1024);
        assert_eq!(devices[0].sector_size, 512);
        assert_eq!(devices[0].model.as_deref(), Some("QEMU HARDDISK"));

        assert_eq!(devices[1].sector_size, 4096);
        assert_eq!(devices[1].transport.as_deref(), Some("nvme"));
    }

    #[test]
    fn test_parse_legacy_string_fields() {
        let devices = devices_from_lsblk(LEGACY).expect("parse");
        assert_eq!(devices.len(), 1);
        let usb = &devices[0];
        // No PATH column in old versions
        assert_eq!(usb.path, PathBuf::from("/dev/sdb"));
        assert_eq!(usb.capacity, 8_004_829_184);
        assert!(usb.read_only);
        assert!(usb.removable);
    }

    #[test]
    fn test_missing_sector_size_is_error() {
        let json = r#"{"blockdevices":[{"name":"sda","size":1024,"type":"disk"}]}"#;
        assert!(devices_from_lsblk(json).is_err());
    }

    #[test]
    fn test_garbage_is_error() {
        assert!(devices_from_lsblk("not json").is_err());
        let json = r#"{"blockdevices":[{"name":"sda","size":"huge","type":"disk"}]}"#;
        assert!(devices_from_lsblk(json).is_err());
    }

    #[test]
    fn test_partitions_walk_children() {
        let json = r#"{
            "blockdevices": [
                {"name":"nvme0n1","path":"/dev/nvme0n1","type":"disk","children":[
                    {"name":"nvme0n1p1","path":"/dev/nvme0n1p1","type":"part"},
                    {"name":"nvme0n1p2","path":"/dev/nvme0n1p2","type":"part","children":[
                        {"name":"cryptroot","path":"/dev/mapper/cryptroot","type":"crypt"}
                    ]}
                ]}
            ]
        }"#;
        let parts = partitions_from_lsblk(json).expect("parse");
        assert_eq!(
            parts,
            vec![
                PathBuf::from("/dev/nvme0n1p1"),
                PathBuf::from("/dev/nvme0n1p2")
            ]
        );
    }

    #[test]
    fn test_partition_path_separator() {
        assert_eq!(
            partition_path(Path::new("/dev/sda"), 2),
            PathBuf::from("/dev/sda2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 1),
            PathBuf::from("/dev/nvme0n1p1")
        );
        assert_eq!(
            BlockDevice::new("/dev/mmcblk0", 512, 1 << 30).partition_path(3),
            PathBuf::from("/dev/mmcblk0p3")
        );
    }

    #[test]
    fn test_find_disk_follows_symlinks() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let node = dir.path().join("vdb");
        fs::write(&node, b"").expect("node");
        let by_id = dir.path().join("virtio-disk1");
        std::os::unix::fs::symlink(&node, &by_id).expect("symlink");

        let canonical = fs::canonicalize(&node).expect("canonical");
        let devices = vec![
            BlockDevice::new("/dev/sda", 512, 64 << 30),
            BlockDevice::new(canonical.clone(), 512, 32 << 30),
        ];

        let found = find_disk(devices.clone(), &by_id).expect("symlink resolves");
        assert_eq!(found.path, canonical);
        assert_eq!(found.capacity, 32 << 30);

        assert_eq!(
            find_disk(devices.clone(), Path::new("/dev/sda")).map(|d| d.capacity).ok(),
            Some(64 << 30)
        );
        let err = find_disk(devices, Path::new("/dev/sdq")).expect_err("unknown");
        assert!(err.to_string().contains("not a whole disk"));
    }
}
