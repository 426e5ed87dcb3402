//! WorkflowEventStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::{error_types, ActivityError};
use crate::workflow::{
    ActivityOptions, ChildWorkflow, ParentClosePolicy, WorkflowError, WorkflowEvent,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow run not found
    #[error("workflow run not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Another open run already uses this workflow id
    #[error("workflow id already in use by an open run: {0}")]
    WorkflowIdInUse(String),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i32, actual: i32 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Workflow run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Run created but not started
    Pending,

    /// Run is in progress
    Running,

    /// Run completed successfully
    Completed,

    /// Run failed
    Failed,

    /// Run was cancelled
    Cancelled,

    /// Run was terminated
    Terminated,

    /// Run closed and handed over to a new run
    ContinuedAsNew,
}

impl WorkflowStatus {
    /// Whether the run is closed
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Database/wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Terminated => "terminated",
            Self::ContinuedAsNew => "continued_as_new",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "terminated" => Ok(Self::Terminated),
            "continued_as_new" => Ok(Self::ContinuedAsNew),
            other => Err(StoreError::Serialization(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// Task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

/// A workflow run to create
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub parent_run_id: Option<Uuid>,
    pub parent_close_policy: ParentClosePolicy,
}

/// Workflow run information stored in the database
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub parent_run_id: Option<Uuid>,
    pub parent_close_policy: ParentClosePolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Definition of a task to be enqueued
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// A task that has been claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Which tasks a worker may claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFilter {
    /// Queue to claim from
    pub task_queue: String,

    /// Activity types the worker has handlers for
    pub activity_types: Vec<String>,

    /// If set, only tasks owned by these workflow types
    pub workflow_types: Option<Vec<String>>,
}

impl TaskFilter {
    /// Filter for a queue and a set of activity types
    pub fn new(task_queue: impl Into<String>, activity_types: Vec<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            activity_types,
            workflow_types: None,
        }
    }

    /// Restrict to tasks owned by the given workflow types
    pub fn with_workflow_types(mut self, workflow_types: Vec<String>) -> Self {
        self.workflow_types = Some(workflow_types);
        self
    }

    /// Check whether a task matches
    pub fn matches(&self, task: &TaskDefinition) -> bool {
        task.task_queue == self.task_queue
            && self.activity_types.contains(&task.activity_type)
            && self
                .workflow_types
                .as_ref()
                .map_or(true, |types| types.contains(&task.workflow_type))
    }
}

/// Response from heartbeat operation
#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
    /// Whether the heartbeat was accepted
    pub accepted: bool,

    /// Whether cancellation was requested
    pub should_cancel: bool,
}

/// Outcome of failing a task attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailureOutcome {
    /// Task was requeued and becomes claimable after `delay`
    WillRetry { next_attempt: u32, delay: Duration },

    /// Error was not retryable
    NonRetryable,

    /// Attempt ceiling reached
    ExhaustedRetries,

    /// Next attempt would start after the schedule-to-close deadline
    DeadlineExceeded,

    /// Task was no longer claimed (cancelled or reclaimed); result dropped
    Discarded,
}

impl TaskFailureOutcome {
    /// Decide what to do with a failed attempt
    ///
    /// Shared by the stores and the executor's local activity loop.
    pub fn decide(
        options: &ActivityOptions,
        attempt: u32,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
        error: &ActivityError,
    ) -> Self {
        if !error.retryable {
            return Self::NonRetryable;
        }

        let Some(delay) = options.retry_policy.next_retry(attempt) else {
            return Self::ExhaustedRetries;
        };
        if let Some(limit) = options.schedule_to_close_timeout {
            let elapsed = (now - scheduled_at).to_std().unwrap_or_default();
            if elapsed + delay > limit {
                return Self::DeadlineExceeded;
            }
        }

        Self::WillRetry {
            next_attempt: attempt + 1,
            delay,
        }
    }

    /// Whether the activity is finished failing and the workflow must be told
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::NonRetryable | Self::ExhaustedRetries | Self::DeadlineExceeded
        )
    }

    /// The error to report to the workflow for a final outcome
    pub fn final_error(&self, error: &ActivityError) -> ActivityError {
        match self {
            Self::DeadlineExceeded => ActivityError::non_retryable(format!(
                "schedule-to-close timeout exceeded: {}",
                error.message
            ))
            .with_type(error_types::SCHEDULE_TO_CLOSE),
            _ => error.clone(),
        }
    }
}

/// A durable timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRecord {
    pub run_id: Uuid,
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
}

/// Follow-up work the executor owes a run once a write has committed
///
/// Effects are stored in the same write that makes them necessary and
/// removed with [`complete_effect`](WorkflowEventStore::complete_effect)
/// once applied. Applying an effect twice has no further consequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingEffect {
    /// Deliver `WorkflowStarted` to a freshly created run
    Start,

    /// Deliver an activity result recorded by the task queue
    Deliver { event: WorkflowEvent },

    /// Start a child workflow; `sequence` is the position of its
    /// `ChildWorkflowInitiated` event in the parent's history
    StartChild {
        sequence: i32,
        parent_task_queue: String,
        child: ChildWorkflow,
    },

    /// Run a local activity and deliver its outcome
    RunLocal {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Create the next run of a workflow that continued as new
    ContinueAsNew { input: serde_json::Value },

    /// Drop a closed run's tasks and timers and apply parent close policies
    Close,
}

impl PendingEffect {
    /// Identifies the effect within its run
    pub fn key(&self) -> String {
        match self {
            Self::Start => "start".to_string(),
            Self::Deliver { event } => match event {
                WorkflowEvent::ActivityCompleted { activity_id, .. }
                | WorkflowEvent::ActivityFailed { activity_id, .. } => {
                    format!("deliver:{activity_id}")
                }
                other => format!("deliver:{}", other.type_name()),
            },
            Self::StartChild { sequence, .. } => format!("child:{sequence}"),
            Self::RunLocal { activity_id, .. } => format!("local:{activity_id}"),
            Self::ContinueAsNew { .. } => "continue".to_string(),
            Self::Close => "close".to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Deliver { .. } => "deliver",
            Self::StartChild { .. } => "start_child",
            Self::RunLocal { .. } => "run_local",
            Self::ContinueAsNew { .. } => "continue_as_new",
            Self::Close => "close",
        }
    }
}

/// A stored effect handed out for recovery
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRecord {
    pub run_id: Uuid,
    pub effect: PendingEffect,

    /// Recovery claims so far, this one included
    pub attempts: u32,
}

/// Everything committed by one workflow advance
///
/// Events, tasks, timers and pending effects are written atomically. The
/// run's status follows from the events (see [`status_change`]).
#[derive(Debug, Clone, Default)]
pub struct HistoryAppend {
    pub events: Vec<WorkflowEvent>,
    pub tasks: Vec<TaskDefinition>,
    pub timers: Vec<TimerRecord>,
    pub effects: Vec<PendingEffect>,
}

impl HistoryAppend {
    /// Append events only
    pub fn events(events: Vec<WorkflowEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }
}

/// Status update implied by appended events
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: WorkflowStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
}

/// Compute the status a batch of events moves a run to, if any
pub fn status_change(events: &[WorkflowEvent]) -> Option<StatusChange> {
    events.iter().rev().find_map(|event| {
        let (status, result, error) = match event {
            WorkflowEvent::WorkflowStarted { .. } => (WorkflowStatus::Running, None, None),
            WorkflowEvent::WorkflowCompleted { result } => {
                (WorkflowStatus::Completed, Some(result.clone()), None)
            }
            WorkflowEvent::WorkflowFailed { error } => {
                (WorkflowStatus::Failed, None, Some(error.clone()))
            }
            WorkflowEvent::WorkflowCancelled { reason } => (
                WorkflowStatus::Cancelled,
                None,
                Some(WorkflowError::new(reason.clone()).with_code("CANCELLED")),
            ),
            WorkflowEvent::WorkflowTerminated { reason } => (
                WorkflowStatus::Terminated,
                None,
                Some(WorkflowError::new(reason.clone()).with_code("TERMINATED")),
            ),
            WorkflowEvent::WorkflowContinuedAsNew { .. } => {
                (WorkflowStatus::ContinuedAsNew, None, None)
            }
            _ => return None,
        };
        Some(StatusChange {
            status,
            result,
            error,
        })
    })
}

/// Store for workflow runs, their event history, the task queue and timers
///
/// This trait defines the interface for persisting workflow state.
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create a new workflow run in `pending` status
    ///
    /// Records [`PendingEffect::Start`] for the run in the same write.
    /// Fails with [`StoreError::WorkflowIdInUse`] if another open run has
    /// the same workflow id.
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<(), StoreError>;

    /// Get full run info
    async fn get_workflow_info(&self, run_id: Uuid) -> Result<WorkflowInfo, StoreError>;

    /// Latest run for a workflow id (open or closed)
    async fn find_current_run(&self, workflow_id: &str)
        -> Result<Option<WorkflowInfo>, StoreError>;

    /// Runs started by the given parent run
    async fn list_children(&self, parent_run_id: Uuid) -> Result<Vec<WorkflowInfo>, StoreError>;

    /// Append events, tasks, timers and effects atomically (with optimistic concurrency)
    ///
    /// Returns the new sequence number after appending.
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: i32,
        append: HistoryAppend,
    ) -> Result<i32, StoreError>;

    /// Load all events for a run (for replay)
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<(i32, WorkflowEvent)>, StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Claim claimable tasks matching the filter
    ///
    /// PostgreSQL uses SELECT FOR UPDATE SKIP LOCKED for concurrent claiming.
    async fn claim_tasks(
        &self,
        worker_id: &str,
        filter: &TaskFilter,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Record task heartbeat
    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError>;

    /// Complete a task successfully
    ///
    /// Records the result as a [`PendingEffect::Deliver`] for the run.
    /// Returns `false` if the task was no longer claimed and the result was dropped.
    async fn complete_task(&self, task_id: Uuid, result: serde_json::Value)
        -> Result<bool, StoreError>;

    /// Fail a task attempt (may requeue it)
    ///
    /// A final outcome records the failure as a [`PendingEffect::Deliver`].
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// Cancel every open task of a run, returning how many were cancelled
    async fn cancel_tasks(&self, run_id: Uuid) -> Result<u64, StoreError>;

    /// Requeue claimed tasks whose worker stopped heartbeating
    async fn reclaim_stale_tasks(&self, stale_threshold: Duration)
        -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Timer Operations
    // =========================================================================

    /// Claim timers due at `now`
    ///
    /// Claimed timers are pushed back by `lease` so that a timer whose
    /// delivery is never confirmed with [`delete_timer`](Self::delete_timer)
    /// fires again.
    async fn claim_due_timers(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError>;

    /// Remove a delivered timer
    async fn delete_timer(&self, run_id: Uuid, timer_id: &str) -> Result<(), StoreError>;

    /// Drop every pending timer of a run
    async fn cancel_timers(&self, run_id: Uuid) -> Result<u64, StoreError>;

    // =========================================================================
    // Effect Operations
    // =========================================================================

    /// Claim effects left untouched for `stale_after`
    ///
    /// Claimed effects are touched again, so another recovery pass skips
    /// them for `stale_after`.
    async fn claim_stale_effects(
        &self,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<EffectRecord>, StoreError>;

    /// Remove an applied effect (no-op if already gone)
    async fn complete_effect(&self, run_id: Uuid, key: &str) -> Result<(), StoreError>;
}
