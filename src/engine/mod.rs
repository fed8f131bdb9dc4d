//! Engine modules: the planner and the provisioning engine.
//!
//! `layout` decides what the disk should look like, `schedule` spells that out
//! as backend calls, and `provision` runs them and builds the `MountTree`.

pub mod layout;
pub mod mount_tree;
pub mod provision;
pub mod schedule;

pub use layout::{
    LayoutPlan, PartitionFlags, PartitionSpec, PlannerOptions, SubvolumeSpec, plan,
    plan_with_options,
};
pub use mount_tree::{MountEntry, MountSource, MountTree};
pub use provision::{ProvisionOptions, ProvisionRequest, Provisioner, provision_device, release};
pub use schedule::{Schedule, StageOps, StorageOp};
