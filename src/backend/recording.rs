//! Backend that records calls instead of touching devices.
//!
//! Used for `--dry-run` and as the engine's test double. A step can be told
//! to fail so the engine's halt-on-failure path is exercised without a disk.

use crate::backend::{PartitionRequest, StorageBackend};
use crate::types::FilesystemKind;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// One primitive call as the engine issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum BackendCall {
    WipeSignatures {
        target: PathBuf,
    },
    CreatePartitionTable {
        device: PathBuf,
    },
    CreatePartition {
        device: PathBuf,
        request: PartitionRequest,
    },
    Format {
        partition: PathBuf,
        filesystem: FilesystemKind,
        label: Option<String>,
    },
    Mount {
        source: PathBuf,
        target: PathBuf,
        options: Option<String>,
    },
    CreateSubvolume {
        mounted_root: PathBuf,
        name: String,
    },
    Unmount {
        target: PathBuf,
    },
    CreateDir {
        path: PathBuf,
    },
}

impl BackendCall {
    /// Primitive name, matching the engine's step names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WipeSignatures { .. } => "wipe_signatures",
            Self::CreatePartitionTable { .. } => "create_partition_table",
            Self::CreatePartition { .. } => "create_partition",
            Self::Format { .. } => "format",
            Self::Mount { .. } => "mount",
            Self::CreateSubvolume { .. } => "create_subvolume",
            Self::Unmount { .. } => "unmount",
            Self::CreateDir { .. } => "create_dir",
        }
    }

    /// Calls that destroy data already on the device.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::WipeSignatures { .. }
                | Self::CreatePartitionTable { .. }
                | Self::CreatePartition { .. }
                | Self::Format { .. }
        )
    }
}

impl fmt::Display for BackendCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WipeSignatures { target } => write!(f, "wipe_signatures {}", target.display()),
            Self::CreatePartitionTable { device } => {
                write!(f, "create_partition_table {}", device.display())
            }
            Self::CreatePartition { device, request } => write!(
                f,
                "create_partition {} #{} {} offset={} length={}",
                device.display(),
                request.number,
                request.role,
                request.offset,
                request.length
            ),
            Self::Format {
                partition,
                filesystem,
                label,
            } => write!(
                f,
                "format {} {} label={}",
                partition.display(),
                filesystem,
                label.as_deref().unwrap_or("-")
            ),
            Self::Mount {
                source,
                target,
                options,
            } => write!(
                f,
                "mount {} {} options={}",
                source.display(),
                target.display(),
                options.as_deref().unwrap_or("-")
            ),
            Self::CreateSubvolume { mounted_root, name } => {
                write!(f, "create_subvolume {} {}", mounted_root.display(), name)
            }
            Self::Unmount { target } => write!(f, "unmount {}", target.display()),
            Self::CreateDir { path } => write!(f, "create_dir {}", path.display()),
        }
    }
}

/// Records every successful call in order.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    calls: Vec<BackendCall>,
    failing_steps: HashSet<&'static str>,
    echo: bool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log each call at `info` as it arrives (dry-run output).
    pub fn echoing() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// Make every call to primitive `step` fail. Failed calls are not recorded.
    pub fn fail_on_step(mut self, step: &'static str) -> Self {
        self.failing_steps.insert(step);
        self
    }

    /// Calls recorded so far, in order.
    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    /// Number of recorded calls that destroy data.
    pub fn destructive_calls(&self) -> usize {
        self.calls.iter().filter(|c| c.is_destructive()).count()
    }

    fn record(&mut self, call: BackendCall) -> Result<()> {
        let name = call.name();
        if self.failing_steps.contains(name) {
            anyhow::bail!("{} failed: injected failure for {}", name, call);
        }
        if self.echo {
            info!("[dry-run] {}", call);
        }
        self.calls.push(call);
        Ok(())
    }
}

impl StorageBackend for RecordingBackend {
    fn wipe_signatures(&mut self, target: &Path) -> Result<()> {
        self.record(BackendCall::WipeSignatures {
            target: target.to_path_buf(),
        })
    }

    fn create_partition_table(&mut self, device: &Path) -> Result<()> {
        self.record(BackendCall::CreatePartitionTable {
            device: device.to_path_buf(),
        })
    }

    fn create_partition(&mut self, device: &Path, request: &PartitionRequest) -> Result<()> {
        self.record(BackendCall::CreatePartition {
            device: device.to_path_buf(),
            request: request.clone(),
        })
    }

    fn format(
        &mut self,
        partition: &Path,
        filesystem: FilesystemKind,
        label: Option<&str>,
    ) -> Result<()> {
        self.record(BackendCall::Format {
            partition: partition.to_path_buf(),
            filesystem,
            label: label.map(str::to_string),
        })
    }

    fn mount(&mut self, source: &Path, target: &Path, options: Option<&str>) -> Result<()> {
        self.record(BackendCall::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options: options.map(str::to_string),
        })
    }

    fn create_subvolume(&mut self, mounted_root: &Path, name: &str) -> Result<()> {
        self.record(BackendCall::CreateSubvolume {
            mounted_root: mounted_root.to_path_buf(),
            name: name.to_string(),
        })
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        self.record(BackendCall::Unmount {
            target: target.to_path_buf(),
        })
    }

    fn create_dir(&mut self, path: &Path) -> Result<()> {
        self.record(BackendCall::CreateDir {
            path: path.to_path_buf(),
        })
    }
}
