//! Workflow events for persistence

use serde::{Deserialize, Serialize};

use super::{ActivityOptions, ParentClosePolicy, WorkflowError, WorkflowSignal};
use crate::activity::ActivityError;

/// Events stored in a workflow run's history
///
/// These events form the append-only log for a workflow run. They are used for:
/// - Persisting workflow progress
/// - Replaying workflows to rebuild state (advances and queries)
/// - Auditing and debugging
///
/// Events are immutable once written. The workflow state is reconstructed
/// by replaying all events in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow was started with the given input
    WorkflowStarted {
        /// The input provided when starting the workflow
        input: serde_json::Value,
    },

    /// Workflow completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed with an error
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow was cancelled (via signal or parent close policy)
    WorkflowCancelled {
        /// Reason for cancellation
        reason: String,
    },

    /// Workflow was terminated (id reuse or parent close policy, admin action)
    WorkflowTerminated {
        /// Reason for termination
        reason: String,
    },

    /// Run closed and a new run was started with this input
    WorkflowContinuedAsNew {
        /// Input of the next run
        input: serde_json::Value,
    },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Unique activity identifier within the workflow run
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Execution options
        options: ActivityOptions,

        /// Whether the activity runs inline in the executor
        #[serde(default)]
        local: bool,
    },

    /// Activity completed successfully
    ActivityCompleted {
        /// Activity identifier
        activity_id: String,

        /// Result returned by the activity
        result: serde_json::Value,
    },

    /// Activity failed for good (retries exhausted or non-retryable)
    ///
    /// Intermediate attempt failures are not recorded in the history.
    ActivityFailed {
        /// Activity identifier
        activity_id: String,

        /// Error of the last attempt
        error: ActivityError,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Timer was started
    TimerStarted {
        /// Timer identifier
        timer_id: String,

        /// Duration in milliseconds
        duration_ms: u64,
    },

    /// Timer fired (duration elapsed)
    TimerFired {
        /// Timer identifier
        timer_id: String,
    },

    // =========================================================================
    // Signal Events
    // =========================================================================
    /// External signal was received
    SignalReceived {
        /// The signal that was received
        signal: WorkflowSignal,
    },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    /// Child workflow start was requested
    ChildWorkflowInitiated {
        /// Workflow id of the child
        workflow_id: String,

        /// Type of the child workflow
        workflow_type: String,

        /// What happens to the child when this run closes
        parent_close_policy: ParentClosePolicy,
    },
}

impl WorkflowEvent {
    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
                | Self::WorkflowTerminated { .. }
                | Self::WorkflowContinuedAsNew { .. }
        )
    }

    /// Short event type name (used as a column value by the PostgreSQL store)
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::WorkflowTerminated { .. } => "workflow_terminated",
            Self::WorkflowContinuedAsNew { .. } => "workflow_continued_as_new",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::SignalReceived { .. } => "signal_received",
            Self::ChildWorkflowInitiated { .. } => "child_workflow_initiated",
        }
    }
}
