//! Workflow actions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{IdReusePolicy, ParentClosePolicy, WorkflowError};
use crate::reliability::RetryPolicy;
use crate::serde_duration::{millis, option_millis};

/// Actions a workflow can request
///
/// These are the commands a workflow issues in response to events.
/// Each action is persisted as a [`WorkflowEvent`](super::WorkflowEvent) in the
/// same append as the event that produced it, then carried out by the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity on a task queue for a worker to pick up
    ScheduleActivity {
        /// Unique identifier for this activity within the workflow run
        activity_id: String,

        /// Type of activity to execute (used to look up the handler)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts, etc.)
        options: ActivityOptions,
    },

    /// Run an activity inline in the executor, without a task queue round-trip
    ScheduleLocalActivity {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Start a timer that fires after the specified duration
    StartTimer {
        /// Unique identifier for this timer within the workflow run
        timer_id: String,

        /// Duration to wait before firing
        #[serde(with = "millis")]
        duration: Duration,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflow {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    FailWorkflow {
        /// Error details
        error: WorkflowError,
    },

    /// Start a child workflow; the parent does not wait for it
    StartChildWorkflow(ChildWorkflow),

    /// Close this run and start a fresh run of the same workflow id
    ContinueAsNew {
        /// Input for the new run
        input: serde_json::Value,
    },
}

impl WorkflowAction {
    /// Create a schedule activity action with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    /// Create a schedule activity action with explicit options
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Create a local activity action
    pub fn schedule_local_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleLocalActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Create a complete workflow action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    /// Create a fail workflow action
    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    /// Create a timer action
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Create a child workflow action
    pub fn start_child(child: ChildWorkflow) -> Self {
        Self::StartChildWorkflow(child)
    }

    /// Create a continue-as-new action
    pub fn continue_as_new(input: serde_json::Value) -> Self {
        Self::ContinueAsNew { input }
    }

    /// Whether this action closes the workflow run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. } | Self::ContinueAsNew { .. }
        )
    }
}

/// A child workflow to start
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildWorkflow {
    /// Workflow id of the child
    pub workflow_id: String,

    /// Type of workflow to start
    pub workflow_type: String,

    /// Input for the child workflow
    pub input: serde_json::Value,

    /// Task queue for the child's activities (defaults to the parent's)
    #[serde(default)]
    pub task_queue: Option<String>,

    /// What to do if a run with the same workflow id exists
    #[serde(default)]
    pub id_reuse_policy: IdReusePolicy,

    /// What happens to the child when the parent closes
    #[serde(default)]
    pub parent_close_policy: ParentClosePolicy,
}

impl ChildWorkflow {
    /// Create a child workflow with default policies
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            input,
            task_queue: None,
            id_reuse_policy: IdReusePolicy::default(),
            parent_close_policy: ParentClosePolicy::default(),
        }
    }

    /// Set the task queue
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    /// Set the id reuse policy
    pub fn with_id_reuse_policy(mut self, policy: IdReusePolicy) -> Self {
        self.id_reuse_policy = policy;
        self
    }

    /// Set the parent close policy
    pub fn with_parent_close_policy(mut self, policy: ParentClosePolicy) -> Self {
        self.parent_close_policy = policy;
        self
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time for a single attempt (from start to completion)
    #[serde(with = "millis")]
    pub start_to_close_timeout: Duration,

    /// Maximum time across all attempts, including retry delays
    #[serde(default, with = "option_millis")]
    pub schedule_to_close_timeout: Option<Duration>,

    /// Heartbeat interval for long-running activities
    /// If set, workers must send heartbeats within this interval
    #[serde(default, with = "option_millis")]
    pub heartbeat_timeout: Option<Duration>,

    /// Priority (higher values = higher priority, claimed first)
    pub priority: i32,

    /// Task queue override (defaults to the workflow's task queue)
    #[serde(default)]
    pub task_queue: Option<String>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
            schedule_to_close_timeout: None,
            heartbeat_timeout: None,
            priority: 0,
            task_queue: None,
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Set the schedule-to-close timeout
    pub fn with_schedule_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_close_timeout = Some(timeout);
        self
    }

    /// Enable heartbeating with the specified timeout
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Route the activity to a specific task queue
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_activity_action() {
        let action =
            WorkflowAction::schedule_activity("step-1", "my_activity", json!({"key": "value"}));

        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                ..
            } => {
                assert_eq!(activity_id, "step-1");
                assert_eq!(activity_type, "my_activity");
                assert_eq!(input, json!({"key": "value"}));
            }
            _ => panic!("Expected ScheduleActivity"),
        }
    }

    #[test]
    fn test_activity_options_serialization() {
        let options = ActivityOptions::default()
            .with_priority(10)
            .with_heartbeat(Duration::from_secs(30))
            .with_schedule_to_close_timeout(Duration::from_secs(10));

        let json = serde_json::to_string(&options).unwrap();
        let parsed: ActivityOptions = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.priority, 10);
        assert_eq!(parsed.heartbeat_timeout, Some(Duration::from_secs(30)));
        assert_eq!(parsed.schedule_to_close_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_child_workflow_action_serialization() {
        let action = WorkflowAction::start_child(
            ChildWorkflow::new("child-1", "child_type", json!({"n": 1}))
                .with_task_queue("rack-1")
                .with_id_reuse_policy(IdReusePolicy::TerminateIfRunning)
                .with_parent_close_policy(ParentClosePolicy::Abandon),
        );

        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"start_child_workflow\""));

        let parsed: WorkflowAction = serde_json::from_str(&json).unwrap();
        assert_eq!(action, parsed);
    }

    #[test]
    fn test_terminal_actions() {
        assert!(WorkflowAction::complete(json!(null)).is_terminal());
        assert!(WorkflowAction::fail(WorkflowError::new("boom")).is_terminal());
        assert!(WorkflowAction::continue_as_new(json!({})).is_terminal());
        assert!(!WorkflowAction::timer("t", Duration::from_secs(1)).is_terminal());
    }

    #[test]
    fn test_timer_action() {
        let action = WorkflowAction::timer("delay", Duration::from_secs(60));

        match action {
            WorkflowAction::StartTimer { timer_id, duration } => {
                assert_eq!(timer_id, "delay");
                assert_eq!(duration, Duration::from_secs(60));
            }
            _ => panic!("Expected StartTimer"),
        }
    }
}
