//! Run state tracking.
//!
//! The scheduler owns the run state machine and the terminal state of every
//! execution unit:
//! - `Pending` until the driver starts
//! - `Running` while any unit is live
//! - `Succeeded`, `Failed` or `Cancelled` once every unit has reported
//!
//! Unit bookkeeping uses ordered sets so reports are reproducible in logs.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sluice_core::{CancelReason, FlowError, NodeId};
use std::collections::BTreeSet;

/// Run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Bound but not started
    Pending,
    /// Units are executing
    Running,
    /// Every unit drained its inputs
    Succeeded,
    /// A unit reported an unrecovered error
    Failed,
    /// Cancellation stopped the run
    Cancelled,
}

impl RunStatus {
    /// Whether the run has finished
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Scheduler error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Unit not registered with this scheduler
    #[error("unit not found: {node_id}")]
    UnitNotFound {
        /// Unknown unit
        node_id: NodeId,
    },
    /// Unit already reported a terminal state
    #[error("unit {node_id} already finished")]
    AlreadyFinished {
        /// Finished unit
        node_id: NodeId,
    },
    /// Transition not allowed from the current run state
    #[error("cannot {action} a run that is {status}")]
    InvalidState {
        /// Attempted transition
        action: &'static str,
        /// Current state
        status: RunStatus,
    },
}

/// Run state machine
///
/// Uses `BTreeSet` for terminal unit sets so iteration order is stable.
#[derive(Debug)]
pub struct Scheduler {
    /// Registered units by instance id, with their names
    units: IndexMap<NodeId, String>,
    /// Units that drained their inputs
    completed: BTreeSet<NodeId>,
    /// Units that failed
    failed: BTreeSet<NodeId>,
    /// Units stopped by cancellation
    cancelled: BTreeSet<NodeId>,
    /// First unrecovered error
    error: Option<FlowError>,
    /// Output collection stopped early because of cancellation
    interrupted: bool,
    finished: bool,
    status: RunStatus,
}

impl Scheduler {
    /// Create a new scheduler
    #[must_use]
    pub fn new() -> Self {
        Self {
            units: IndexMap::new(),
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            cancelled: BTreeSet::new(),
            error: None,
            interrupted: false,
            finished: false,
            status: RunStatus::Pending,
        }
    }

    /// Register a unit
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` once the run has started
    pub fn add_unit(&mut self, node_id: NodeId, name: impl Into<String>) -> Result<(), ScheduleError> {
        if self.status != RunStatus::Pending {
            return Err(ScheduleError::InvalidState {
                action: "add units to",
                status: self.status,
            });
        }
        self.units.insert(node_id, name.into());
        Ok(())
    }

    /// Move from `Pending` to `Running`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the run is not pending
    pub fn start(&mut self) -> Result<RunStatus, ScheduleError> {
        if self.status != RunStatus::Pending {
            return Err(ScheduleError::InvalidState {
                action: "start",
                status: self.status,
            });
        }
        self.status = RunStatus::Running;
        Ok(self.status)
    }

    fn finish_unit(&mut self, node_id: NodeId) -> Result<(), ScheduleError> {
        if !self.units.contains_key(&node_id) {
            return Err(ScheduleError::UnitNotFound { node_id });
        }
        if self.is_finished(node_id) {
            return Err(ScheduleError::AlreadyFinished { node_id });
        }
        Ok(())
    }

    /// Mark a unit as completed
    ///
    /// # Errors
    ///
    /// Returns error if the unit is unknown or already finished
    pub fn mark_complete(&mut self, node_id: NodeId) -> Result<(), ScheduleError> {
        self.finish_unit(node_id)?;
        self.completed.insert(node_id);
        Ok(())
    }

    /// Mark a unit as failed. Returns `true` if this is the run's first error.
    ///
    /// The first error moves a running run to `Failed` straight away; units
    /// still draining keep reporting until `finish`.
    ///
    /// # Errors
    ///
    /// Returns error if the unit is unknown or already finished
    pub fn mark_failed(&mut self, node_id: NodeId, error: FlowError) -> Result<bool, ScheduleError> {
        self.finish_unit(node_id)?;
        self.failed.insert(node_id);
        if self.error.is_none() {
            self.error = Some(error);
            if self.status == RunStatus::Running {
                self.status = RunStatus::Failed;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark a unit as stopped by cancellation
    ///
    /// # Errors
    ///
    /// Returns error if the unit is unknown or already finished
    pub fn mark_cancelled(&mut self, node_id: NodeId) -> Result<(), ScheduleError> {
        self.finish_unit(node_id)?;
        self.cancelled.insert(node_id);
        Ok(())
    }

    /// Record that cancellation cut the run short outside of any unit
    pub fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    /// Whether the unit reported a terminal state
    #[must_use]
    pub fn is_finished(&self, node_id: NodeId) -> bool {
        self.completed.contains(&node_id)
            || self.failed.contains(&node_id)
            || self.cancelled.contains(&node_id)
    }

    /// Decide the terminal state.
    ///
    /// A recorded error wins; otherwise any unit stopped by cancellation, or
    /// an interrupted run, is `Cancelled`; otherwise it succeeded.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the run is running or failed and not yet finished
    pub fn finish(&mut self, cancel_reason: Option<CancelReason>) -> Result<RunStatus, ScheduleError> {
        let open = matches!(self.status, RunStatus::Running | RunStatus::Failed);
        if !open || self.finished {
            return Err(ScheduleError::InvalidState {
                action: "finish",
                status: self.status,
            });
        }
        self.status = if self.error.is_some() {
            RunStatus::Failed
        } else if !self.cancelled.is_empty() || self.interrupted {
            self.error = Some(FlowError::Cancelled {
                reason: cancel_reason.unwrap_or(CancelReason::Requested),
            });
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        };
        self.finished = true;
        Ok(self.status)
    }

    /// Current state
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// First error, or the cancellation error once finished as `Cancelled`
    #[must_use]
    pub fn error(&self) -> Option<&FlowError> {
        self.error.as_ref()
    }

    /// Take the terminal error
    pub fn take_error(&mut self) -> Option<FlowError> {
        self.error.take()
    }

    /// Name of a registered unit
    #[must_use]
    pub fn unit_name(&self, node_id: NodeId) -> Option<&str> {
        self.units.get(&node_id).map(String::as_str)
    }

    /// Get number of registered units
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Get number of completed units
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Get number of failed units
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Get number of cancelled units
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.len()
    }

    /// Whether every registered unit has reported
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed.len() + self.failed.len() + self.cancelled.len() == self.units.len()
    }

    /// Check if any unit failed
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Get failed units
    #[must_use]
    pub fn failed_units(&self) -> &BTreeSet<NodeId> {
        &self.failed
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
