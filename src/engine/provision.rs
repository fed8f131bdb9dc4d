//! Provisioning Engine
//!
//! Executes a `LayoutPlan` against a device through a `StorageBackend`.
//!
//! # Guarantees
//!
//! - The plan is checked against the live device before anything destructive
//!   runs; a device that shrank or changed sector size yields `PlanStale`.
//! - Stages run strictly in order (`ProvisionContext` refuses anything else).
//! - A partition is only formatted after its `create_partition` succeeded, and
//!   a mount point is only mounted after its parent.
//! - The first failing operation halts the run with `ProvisioningFailed`.
//!   Nothing is retried and nothing is rolled back: a wiped or reformatted
//!   disk cannot be restored, so the operator has to look at it.
//!
//! A `Provisioner` is single-use. Once it reaches `Mounted` or `Failed` it
//! refuses further work.

use crate::backend::StorageBackend;
use crate::engine::layout::{LayoutPlan, PlannerOptions, plan_with_options};
use crate::engine::mount_tree::MountTree;
use crate::engine::schedule::{Schedule, StorageOp};
use crate::error::{ProvisionError, Result};
use crate::inventory::DeviceInventory;
use crate::process_guard::{clear_active_stage, note_active_stage};
use crate::provision_state::{ProvisionContext, ProvisionStage, TransitionError};
use crate::types::{FilesystemKind, LayoutPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Engine settings that do not affect the partition layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionOptions {
    /// Where the new root filesystem is mounted
    pub root_mount: PathBuf,
    /// Options for Btrfs mounts; appended after `subvol=` for subvolumes
    pub btrfs_mount_options: String,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            root_mount: PathBuf::from("/mnt"),
            btrfs_mount_options: "compress=zstd,noatime".to_string(),
        }
    }
}

/// Everything `provision_device` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub device: PathBuf,
    pub filesystem: FilesystemKind,
    pub policy: LayoutPolicy,
    pub planner: PlannerOptions,
    pub options: ProvisionOptions,
}

/// Runs one plan against one device.
pub struct Provisioner<'a> {
    backend: &'a mut dyn StorageBackend,
    inventory: &'a dyn DeviceInventory,
    options: ProvisionOptions,
    context: ProvisionContext,
    tree: MountTree,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        backend: &'a mut dyn StorageBackend,
        inventory: &'a dyn DeviceInventory,
        options: ProvisionOptions,
    ) -> Self {
        let tree = MountTree::new(options.root_mount.clone());
        Self {
            backend,
            inventory,
            options,
            context: ProvisionContext::new(),
            tree,
        }
    }

    /// Stage reached so far, and where it failed if it did.
    pub fn context(&self) -> &ProvisionContext {
        &self.context
    }

    /// What is mounted right now. After a failed run this is what `release`
    /// has to take down.
    pub fn mount_tree(&self) -> &MountTree {
        &self.tree
    }

    /// Wipe, partition, format and mount the plan's device.
    ///
    /// # Errors
    ///
    /// - `InvalidPlan` if the plan fails validation
    /// - `PlanStale` if the device no longer matches the plan (nothing was touched)
    /// - `ProvisioningFailed` naming the stage, the step, the tool error and
    ///   the mounts left behind
    /// - `Transition` if this provisioner was already used
    pub fn provision(&mut self, plan: LayoutPlan) -> Result<MountTree> {
        let current = self.context.current_stage();
        if current != ProvisionStage::Unwiped {
            return Err(TransitionError::FromTerminalState { from: current }.into());
        }

        plan.validate()?;
        let existing = self.check_fresh(&plan)?;
        let schedule = Schedule::build(&plan, &self.options, &existing);
        self.context.mark_preconditions_verified();

        info!(
            "Provisioning {} ({} / {}), {} operations ({} destructive)",
            plan.device().path.display(),
            plan.policy(),
            plan.filesystem(),
            schedule.len(),
            schedule.destructive_len()
        );

        let result = self.run(&schedule);
        clear_active_stage();
        result?;

        info!(
            "Provisioning complete: {} mount(s) under {}",
            self.tree.len(),
            self.tree.root().display()
        );
        Ok(self.tree.clone())
    }

    /// Confirm the device still looks like it did at planning time and list
    /// the partitions currently on it.
    fn check_fresh(&self, plan: &LayoutPlan) -> Result<Vec<PathBuf>> {
        let planned = plan.device();
        let path = &planned.path;

        let live = self.inventory.probe(path).map_err(|e| {
            ProvisionError::plan_stale(format!("{} no longer probes: {:#}", path.display(), e))
        })?;

        if live.capacity < planned.capacity {
            return Err(ProvisionError::plan_stale(format!(
                "{} shrank from {} to {} bytes",
                path.display(),
                planned.capacity,
                live.capacity
            )));
        }
        if live.sector_size != planned.sector_size {
            return Err(ProvisionError::plan_stale(format!(
                "{} sector size changed from {} to {}",
                path.display(),
                planned.sector_size,
                live.sector_size
            )));
        }
        if live.read_only {
            return Err(ProvisionError::plan_stale(format!(
                "{} became read-only",
                path.display()
            )));
        }

        self.inventory.partitions(path).map_err(|e| {
            ProvisionError::plan_stale(format!(
                "cannot list partitions of {}: {:#}",
                path.display(),
                e
            ))
        })
    }

    fn run(&mut self, schedule: &Schedule) -> Result<()> {
        for stage_ops in schedule.stages() {
            let stage = stage_ops.stage;
            self.context.check_transition(stage)?;
            note_active_stage(stage);
            info!("Entering stage '{}' ({} operations)", stage, stage_ops.ops.len());

            for op in &stage_ops.ops {
                info!("  {}", op);
                if let Err(e) = op.apply(&mut *self.backend) {
                    return Err(self.halt(stage, op, e));
                }
                match op {
                    StorageOp::Mount { entry } => self.tree.record_mount(entry.clone()),
                    StorageOp::Unmount { target } => self.tree.record_unmount(target),
                    _ => {}
                }
            }

            self.context.transition_to(stage)?;
        }
        Ok(())
    }

    fn halt(&mut self, stage: ProvisionStage, op: &StorageOp, cause: anyhow::Error) -> ProvisionError {
        error!(
            "Step {} failed while entering '{}': {:#}",
            op.step_name(),
            stage,
            cause
        );
        warn!("The device is partially provisioned and needs manual recovery");
        for entry in self.tree.entries() {
            warn!("Still mounted: {} ({})", entry.path.display(), entry.source.device().display());
        }
        if let Err(e) = self.context.fail() {
            warn!("Could not record failure: {}", e);
        }
        ProvisionError::ProvisioningFailed {
            stage,
            step: op.step_name(),
            operation: op.to_string(),
            message: format!("{:#}", cause),
            mounted: self.tree.clone(),
        }
    }
}

/// Probe, plan and provision in one call.
///
/// Planning errors (`InvalidDevice`, `InvalidPolicy`, `InsufficientCapacity`)
/// are returned before the backend sees a single call.
pub fn provision_device(
    request: &ProvisionRequest,
    backend: &mut dyn StorageBackend,
    inventory: &dyn DeviceInventory,
) -> Result<(LayoutPlan, MountTree)> {
    let device = inventory.probe(&request.device).map_err(|e| {
        ProvisionError::invalid_device(format!("{}: {:#}", request.device.display(), e))
    })?;

    let plan = plan_with_options(
        &device,
        request.filesystem,
        request.policy,
        &request.planner,
    )?;
    info!("\n{}", plan.summary());

    let mut provisioner = Provisioner::new(backend, inventory, request.options.clone());
    let tree = provisioner.provision(plan.clone())?;
    Ok((plan, tree))
}

/// Unmount every entry of `tree`, deepest first.
///
/// Entries are dropped from the tree as they are unmounted, so after a failure
/// the tree still describes what is mounted.
pub fn release(tree: &mut MountTree, backend: &mut dyn StorageBackend) -> Result<()> {
    let paths: Vec<PathBuf> = tree
        .unmount_order()
        .into_iter()
        .map(|e| e.path.clone())
        .collect();

    for path in paths {
        info!("Unmounting {}", path.display());
        backend
            .unmount(&path)
            .map_err(|e| ProvisionError::ReleaseFailed {
                target: path.clone(),
                message: format!("{:#}", e),
            })?;
        tree.record_unmount(&path);
    }
    Ok(())
}
