//! Storage capability interface.
//!
//! The engine only ever talks to a `StorageBackend`. Which programs implement
//! a primitive, and with which flags, is the backend's business:
//!
//! - `CommandBackend` runs the real tools (`wipefs`, `sgdisk`, `mkfs.*`, ...).
//! - `RecordingBackend` logs every call and touches nothing. It drives
//!   `--dry-run` and the engine tests.
//!
//! Every primitive blocks until it is done and returns the tool's diagnostic
//! text as the error on failure. There are no retries and no timeouts.

pub mod command;
pub mod recording;

pub use command::CommandBackend;
pub use recording::{BackendCall, RecordingBackend};

use crate::types::{FilesystemKind, PartitionRole};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Geometry and type of one partition to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRequest {
    /// 1-based partition number in the table
    pub number: u32,
    /// Byte offset from the start of the device
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
    /// Logical sector size of the device
    pub sector_size: u64,
    /// Decides the GPT type code and partition name
    pub role: PartitionRole,
    /// Set the legacy BIOS bootable attribute
    pub bootable: bool,
}

impl PartitionRequest {
    /// First sector of the partition.
    pub fn start_sector(&self) -> u64 {
        self.offset / self.sector_size
    }

    /// Last sector of the partition (inclusive, as sgdisk expects).
    pub fn end_sector(&self) -> u64 {
        (self.offset + self.length) / self.sector_size - 1
    }
}

/// Storage primitives the provisioning engine is built on.
pub trait StorageBackend {
    /// Erase filesystem, RAID and partition-table signatures from a disk or partition.
    fn wipe_signatures(&mut self, target: &Path) -> Result<()>;

    /// Write a new, empty GPT to the device.
    fn create_partition_table(&mut self, device: &Path) -> Result<()>;

    /// Create one partition and wait until its device node exists.
    fn create_partition(&mut self, device: &Path, request: &PartitionRequest) -> Result<()>;

    /// Create a filesystem on a partition.
    fn format(&mut self, partition: &Path, filesystem: FilesystemKind, label: Option<&str>)
    -> Result<()>;

    /// Mount `source` at `target`.
    fn mount(&mut self, source: &Path, target: &Path, options: Option<&str>) -> Result<()>;

    /// Create a Btrfs subvolume `name` directly below a mounted filesystem root.
    fn create_subvolume(&mut self, mounted_root: &Path, name: &str) -> Result<()>;

    /// Unmount whatever is mounted at `target`.
    fn unmount(&mut self, target: &Path) -> Result<()>;

    /// Create a directory (and its parents) to be used as a mount point.
    fn create_dir(&mut self, path: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_request_sectors() {
        let request = PartitionRequest {
            number: 1,
            offset: 1024 * 1024,
            length: 512 * 1024 * 1024,
            sector_size: 512,
            role: PartitionRole::Boot,
            bootable: true,
        };
        assert_eq!(request.start_sector(), 2048);
        assert_eq!(request.end_sector(), 2048 + 1_048_576 - 1);
    }

    #[test]
    fn test_partition_request_4k_sectors() {
        let request = PartitionRequest {
            number: 2,
            offset: 513 * 1024 * 1024,
            length: 1024 * 1024 * 1024,
            sector_size: 4096,
            role: PartitionRole::Root,
            bootable: false,
        };
        assert_eq!(request.start_sector(), 513 * 256);
        assert_eq!(request.end_sector(), 513 * 256 + 1024 * 256 - 1);
    }
}
