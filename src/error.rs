//! Error handling module for the provisioner
//!
//! One `thiserror` enum covers every failure the planner and the engine can
//! report. Planning errors are raised before any device is touched; a
//! `ProvisioningFailed` means destructive work has already happened.

use crate::engine::mount_tree::MountTree;
use crate::provision_state::{ProvisionStage, TransitionError};
use crate::types::{FilesystemKind, LayoutPolicy};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for planning and provisioning
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The layout does not fit on the device
    #[error("Insufficient capacity: layout needs {required} bytes, device has {available} bytes")]
    InsufficientCapacity { required: u64, available: u64 },

    /// Policy and filesystem cannot be combined
    #[error("Invalid policy: {policy} layout is not supported with {filesystem}")]
    InvalidPolicy {
        policy: LayoutPolicy,
        filesystem: FilesystemKind,
    },

    /// The device cannot be a provisioning target
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// A computed plan broke one of its own invariants
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// The device changed since the plan was computed
    #[error("Plan is stale: {0}")]
    PlanStale(String),

    /// A destructive step failed; the device is in an intermediate state.
    /// `mounted` holds whatever was still mounted when the run stopped.
    #[error(
        "Provisioning failed while entering '{stage}' at step {step} [{operation}]: {message}{}",
        still_mounted(.mounted)
    )]
    ProvisioningFailed {
        stage: ProvisionStage,
        step: &'static str,
        operation: String,
        message: String,
        mounted: MountTree,
    },

    /// Unmounting a finished mount tree failed
    #[error("Release failed for {}: {message}", .target.display())]
    ReleaseFailed { target: PathBuf, message: String },

    /// Provisioning state machine transition errors
    #[error("State transition error: {0}")]
    Transition(#[from] TransitionError),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),
}

fn still_mounted(tree: &MountTree) -> String {
    if tree.is_empty() {
        return String::new();
    }
    let paths: Vec<String> = tree
        .entries()
        .iter()
        .map(|e| e.path.display().to_string())
        .collect();
    format!(" (still mounted: {})", paths.join(", "))
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Create an invalid device error
    pub fn invalid_device(msg: impl Into<String>) -> Self {
        Self::InvalidDevice(msg.into())
    }

    /// Create an invalid plan error
    pub fn invalid_plan(msg: impl Into<String>) -> Self {
        Self::InvalidPlan(msg.into())
    }

    /// Create a stale plan error
    pub fn plan_stale(msg: impl Into<String>) -> Self {
        Self::PlanStale(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True when the error was raised before any destructive call.
    ///
    /// These can be fixed by re-planning, picking another device or another
    /// layout. Everything else needs an operator to look at the disk.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCapacity { .. }
                | Self::InvalidPolicy { .. }
                | Self::InvalidDevice(_)
                | Self::InvalidPlan(_)
                | Self::PlanStale(_)
                | Self::Config(_)
        )
    }
}
