//! Provisioning State Machine
//!
//! The order in which a device is wiped, partitioned, formatted and mounted is
//! enforced here instead of being implied by the order of statements in the
//! engine. A stage can only be entered from the one before it.
//!
//! # Stage Flow
//!
//! ```text
//! Unwiped
//!     ↓   wipe signatures
//! Wiped
//!     ↓   write GPT, create partitions
//! PartitionsCreated
//!     ↓   mkfs per partition
//! Formatted
//!     ↓   subvolumes, mounts
//! Mounted
//!
//! (Any non-terminal stage can transition to Failed)
//! ```
//!
//! Leaving `Unwiped` additionally requires that the plan's preconditions were
//! checked against the live device.

use std::fmt;
use thiserror::Error;

/// Provisioning stages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProvisionStage {
    /// Nothing has been written to the device
    Unwiped = 0,

    /// Old filesystem and partition-table signatures are gone
    Wiped = 1,

    /// A fresh GPT holds every partition of the plan
    PartitionsCreated = 2,

    /// Every partition carries its filesystem
    Formatted = 3,

    /// The mount tree is in place (terminal state)
    Mounted = 4,

    /// A step failed; the device is in whatever state that step left it (terminal state)
    Failed = 255,
}

impl ProvisionStage {
    /// Returns the numeric order of this stage (0-4, 255 for Failed)
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Inverse of `order`.
    pub const fn from_order(order: u8) -> Option<Self> {
        match order {
            0 => Some(Self::Unwiped),
            1 => Some(Self::Wiped),
            2 => Some(Self::PartitionsCreated),
            3 => Some(Self::Formatted),
            4 => Some(Self::Mounted),
            255 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true if this is a terminal state (Mounted or Failed)
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Mounted | Self::Failed)
    }

    /// Returns true if entering this stage destroys data on the device
    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Wiped | Self::PartitionsCreated | Self::Formatted)
    }

    /// Returns the next stage in the sequence, or None if at a terminal state
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Unwiped => Some(Self::Wiped),
            Self::Wiped => Some(Self::PartitionsCreated),
            Self::PartitionsCreated => Some(Self::Formatted),
            Self::Formatted => Some(Self::Mounted),
            Self::Mounted | Self::Failed => None,
        }
    }

    /// Returns a human-readable description of this stage
    pub const fn description(self) -> &'static str {
        match self {
            Self::Unwiped => "unwiped",
            Self::Wiped => "wiped",
            Self::PartitionsCreated => "partitions created",
            Self::Formatted => "formatted",
            Self::Mounted => "mounted",
            Self::Failed => "failed",
        }
    }

    /// Returns all stages in order (excluding Failed)
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::Unwiped,
            Self::Wiped,
            Self::PartitionsCreated,
            Self::Formatted,
            Self::Mounted,
        ]
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// Attempted to skip one or more stages
    #[error("Cannot skip from {from} to {to} (must transition through intermediate stages)")]
    SkippedStage {
        from: ProvisionStage,
        to: ProvisionStage,
    },

    /// Attempted to go backwards
    #[error("Cannot go backwards from {from} to {to} (provisioning is forward-only)")]
    BackwardTransition {
        from: ProvisionStage,
        to: ProvisionStage,
    },

    /// Attempted to transition from a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: ProvisionStage },

    /// Attempted a destructive stage before the plan was checked against the device
    #[error("Stage {stage} requires the plan to be verified against the device first")]
    PreconditionsUnchecked { stage: ProvisionStage },

    /// Attempted to transition to the same state
    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: ProvisionStage },
}

/// Tracks the provisioning stage of one device.
///
/// # Example
///
/// ```
/// use archprov::provision_state::{ProvisionContext, ProvisionStage};
///
/// let mut ctx = ProvisionContext::new();
/// assert!(ctx.advance().is_err()); // preconditions not verified yet
///
/// ctx.mark_preconditions_verified();
/// assert_eq!(ctx.advance().unwrap(), ProvisionStage::Wiped);
///
/// // Cannot skip stages
/// assert!(ctx.transition_to(ProvisionStage::Formatted).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ProvisionContext {
    /// Current stage
    current: ProvisionStage,

    /// Stage that was current when failure occurred (if any)
    failed_at: Option<ProvisionStage>,

    /// (stage, unix timestamp) for every stage entered
    stage_history: Vec<(ProvisionStage, u64)>,

    /// Whether the plan was checked against the live device
    preconditions_verified: bool,
}

impl Default for ProvisionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisionContext {
    /// Create a new context in the Unwiped state.
    pub fn new() -> Self {
        Self {
            current: ProvisionStage::Unwiped,
            failed_at: None,
            stage_history: Vec::with_capacity(ProvisionStage::all_stages().len()),
            preconditions_verified: false,
        }
    }

    /// Returns the current stage
    #[inline]
    pub fn current_stage(&self) -> ProvisionStage {
        self.current
    }

    /// Returns the stage at which failure occurred, if any
    #[inline]
    pub fn failed_at(&self) -> Option<ProvisionStage> {
        self.failed_at
    }

    /// Returns true once the mount tree is in place
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current == ProvisionStage::Mounted
    }

    /// Returns true if provisioning has failed
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == ProvisionStage::Failed
    }

    /// Returns the stage history as a slice of (stage, timestamp) pairs
    pub fn stage_history(&self) -> &[(ProvisionStage, u64)] {
        &self.stage_history
    }

    /// Record that the plan's assumptions hold for the live device.
    ///
    /// One-way flag; destructive stages cannot be entered without it.
    pub fn mark_preconditions_verified(&mut self) {
        self.preconditions_verified = true;
    }

    /// Advance to the next stage in sequence.
    pub fn advance(&mut self) -> Result<ProvisionStage, TransitionError> {
        match self.current.next() {
            Some(next) => self.transition_to(next),
            None => Err(TransitionError::FromTerminalState { from: self.current }),
        }
    }

    /// Transition to a specific stage (must be the next stage in sequence).
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if current is Mounted or Failed
    /// - `AlreadyAtStage` if target is the current stage
    /// - `BackwardTransition` if target is before current
    /// - `SkippedStage` if target is not the immediate next stage
    /// - `PreconditionsUnchecked` if entering a destructive stage unverified
    pub fn transition_to(
        &mut self,
        target: ProvisionStage,
    ) -> Result<ProvisionStage, TransitionError> {
        self.check_transition(target)?;

        self.record_stage_transition(target);
        self.current = target;

        Ok(target)
    }

    /// Check that `target` could be entered now, without entering it.
    ///
    /// The engine calls this before running a stage's operations so an
    /// illegal transition is caught before anything touches the device.
    pub fn check_transition(&self, target: ProvisionStage) -> Result<(), TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.current });
        }

        if target == self.current {
            return Err(TransitionError::AlreadyAtStage { stage: target });
        }

        // Failed is only reachable through fail()
        if target == ProvisionStage::Failed {
            return Err(TransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        if target.order() < self.current.order() {
            return Err(TransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }

        if self.current.next() != Some(target) {
            return Err(TransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        if target.is_destructive() && !self.preconditions_verified {
            return Err(TransitionError::PreconditionsUnchecked { stage: target });
        }

        Ok(())
    }

    /// Mark provisioning as failed.
    pub fn fail(&mut self) -> Result<(), TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.current });
        }

        self.failed_at = Some(self.current);
        self.record_stage_transition(ProvisionStage::Failed);
        self.current = ProvisionStage::Failed;

        Ok(())
    }

    fn record_stage_transition(&mut self, stage: ProvisionStage) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.stage_history.push((stage, timestamp));
    }
}
