//! archprov library
//!
//! Disk layout planning and provisioning for an Arch Linux installer: device
//! inventory, a pure layout planner, and a staged engine that wipes,
//! partitions, formats and mounts through a pluggable storage backend.

pub mod backend;
pub mod cli;
pub mod config_file;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod process_guard;
pub mod provision_state;
pub mod sanity;
pub mod tools;
pub mod types;

// Re-export main types for convenience
pub use backend::{BackendCall, CommandBackend, PartitionRequest, RecordingBackend, StorageBackend};
pub use config_file::ProvisionConfig;
pub use engine::{
    LayoutPlan, MountEntry, MountSource, MountTree, PartitionSpec, PlannerOptions,
    ProvisionOptions, ProvisionRequest, Provisioner, Schedule, StorageOp, SubvolumeSpec, plan,
    plan_with_options, provision_device, release,
};
pub use error::{ProvisionError, Result};
pub use inventory::{BlockDevice, DeviceInventory, LsblkInventory};
pub use process_guard::{CommandProcessGroup, ProcessGuard, ToolSlot};
pub use provision_state::{ProvisionContext, ProvisionStage, TransitionError};
pub use tools::ToolArgs;
pub use types::{FilesystemKind, LayoutPolicy, PartitionRole};
