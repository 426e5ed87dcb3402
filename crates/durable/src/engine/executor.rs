//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting workflows by type name under a caller-chosen workflow id
//! - Advancing runs: replaying the history, then delivering one new event
//! - Turning workflow actions into events, tasks and timers
//! - Running local activities, starting child workflows, continuing as new
//! - Cancelling, terminating and querying runs
//!
//! Every advance is a replay followed by a single atomic append guarded by
//! the history length. A concurrent advance makes the append fail with a
//! conflict, in which case the advance is replayed again.
//!
//! Work an append makes necessary (starting children, running local
//! activities, closing the run) is committed with it as pending effects.
//! Effects are applied right after the append and removed once applied;
//! [`WorkflowExecutor::recover_effects`] applies the ones left behind.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
use crate::persistence::{
    HistoryAppend, NewWorkflow, PendingEffect, StoreError, TaskDefinition, TaskFailureOutcome,
    TimerRecord, WorkflowEventStore, WorkflowInfo,
};
use crate::workflow::{
    ActivityOptions, ChildWorkflow, IdReusePolicy, ParentClosePolicy, Workflow, WorkflowAction,
    WorkflowError, WorkflowEvent, WorkflowSignal,
};

use super::registry::{RegistryError, WorkflowRegistry};

/// Error code of the failure recorded when a run outgrows its history limit
pub const HISTORY_LIMIT_CODE: &str = "HISTORY_LIMIT";

/// Error code of the failure recorded when a timer cannot be scheduled
pub const INVALID_TIMER_CODE: &str = "INVALID_TIMER";

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per run; a run that would exceed it is failed
    pub max_events_per_workflow: usize,

    /// How many times a conflicting advance is replayed before giving up
    pub max_advance_retries: u32,

    /// Task queue for workflows started without one
    pub default_task_queue: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_workflow: 10000,
            max_advance_retries: 16,
            default_task_queue: "default".to_string(),
        }
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The id reuse policy forbids starting another run
    #[error("workflow {0} already exists")]
    WorkflowAlreadyExists(String),

    /// No run for the workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The current run of the workflow id is closed
    #[error("workflow {0} is already closed")]
    WorkflowClosed(String),

    /// The workflow does not answer this query
    #[error("workflow {workflow_id} does not support query {query_type}")]
    UnknownQuery {
        workflow_id: String,
        query_type: String,
    },

    /// Concurrent advances kept winning the race
    #[error("too many concurrent updates to run {0}")]
    TooManyConflicts(Uuid),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutorError {
    /// Whether the same operation may succeed later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TooManyConflicts(_)
                | Self::Store(StoreError::Database(_) | StoreError::ConcurrencyConflict { .. })
        )
    }
}

/// How to start a workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    /// Caller-chosen workflow id
    pub workflow_id: String,

    /// Task queue for the workflow's activities (executor default if unset)
    pub task_queue: Option<String>,

    /// What to do if a run with the same workflow id exists
    pub id_reuse_policy: IdReusePolicy,
}

impl StartOptions {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_queue: None,
            id_reuse_policy: IdReusePolicy::default(),
        }
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn with_id_reuse_policy(mut self, policy: IdReusePolicy) -> Self {
        self.id_reuse_policy = policy;
        self
    }
}

/// The run a start request resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedRun {
    pub run_id: Uuid,
    pub workflow_id: String,

    /// `true` if an open run was joined instead of starting a new one
    pub existing: bool,
}

/// Work for [`WorkflowExecutor::drive`]
#[derive(Debug)]
enum Effect {
    /// Deliver an event to a run
    Advance { run_id: Uuid, event: WorkflowEvent },

    /// Apply an effect committed for a run, then remove it from the store
    Pending { run_id: Uuid, effect: PendingEffect },
}

fn pending(run_id: Uuid, effects: &[PendingEffect]) -> Vec<Effect> {
    effects
        .iter()
        .map(|effect| Effect::Pending {
            run_id,
            effect: effect.clone(),
        })
        .collect()
}

/// Workflow executor
///
/// The executor drives workflow state machines by replaying events and
/// processing actions. It uses optimistic concurrency control to handle
/// concurrent updates.
///
/// # Example
///
/// ```ignore
/// use maas_durable::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowEventStore::new());
/// let mut executor = WorkflowExecutor::new(store);
/// executor.register::<MyWorkflow>();
///
/// let run = executor
///     .start_workflow::<MyWorkflow>(StartOptions::new("my-workflow"), input)
///     .await?;
///
/// // Called by the worker pool when the activity finishes
/// executor.on_activity_completed(run.run_id, "step-1", json!({})).await?;
/// ```
pub struct WorkflowExecutor {
    store: Arc<dyn WorkflowEventStore>,
    registry: WorkflowRegistry,
    local_activities: ActivityRegistry,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    /// Create a new executor with the given store
    pub fn new(store: Arc<dyn WorkflowEventStore>) -> Self {
        Self::with_config(store, ExecutorConfig::default())
    }

    /// Create a new executor with custom config
    pub fn with_config(store: Arc<dyn WorkflowEventStore>, config: ExecutorConfig) -> Self {
        Self {
            store,
            registry: WorkflowRegistry::new(),
            local_activities: ActivityRegistry::new(),
            config,
        }
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    /// Register an activity that workflows may run as a local activity
    pub fn register_local_activity<A: Activity>(&mut self, activity: A) {
        self.local_activities.register(activity);
        info!(activity_type = A::TYPE, "registered local activity");
    }

    /// Replace the local activity registry
    pub fn with_local_activities(mut self, activities: ActivityRegistry) -> Self {
        self.local_activities = activities;
        self
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        &self.store
    }

    /// Registered workflow types
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    // =========================================================================
    // Control Surface
    // =========================================================================

    /// Start a workflow with a typed input
    pub async fn start_workflow<W: Workflow>(
        &self,
        options: StartOptions,
        input: W::Input,
    ) -> Result<StartedRun, ExecutorError> {
        let input = serde_json::to_value(&input)?;
        self.start_workflow_by_name(W::TYPE, input, options).await
    }

    /// Start a workflow by type name
    ///
    /// Applies the id reuse policy against the latest run of the workflow
    /// id, creates the run, and drives it until it waits on something
    /// external (an activity task, a timer or a signal) or closes.
    #[instrument(skip(self, input, options), fields(workflow_id = %options.workflow_id))]
    pub async fn start_workflow_by_name(
        &self,
        workflow_type: &str,
        input: Value,
        options: StartOptions,
    ) -> Result<StartedRun, ExecutorError> {
        let (started, effects) = self.prepare_start(workflow_type, input, options, None).await?;
        self.drive(effects).await?;
        Ok(started)
    }

    /// Deliver a successful activity result
    ///
    /// Called by the worker pool when an activity completes successfully.
    #[instrument(skip(self, result))]
    pub async fn on_activity_completed(
        &self,
        run_id: Uuid,
        activity_id: &str,
        result: Value,
    ) -> Result<(), ExecutorError> {
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: activity_id.to_string(),
            result,
        };
        self.drive(vec![Effect::Pending {
            run_id,
            effect: PendingEffect::Deliver { event },
        }])
        .await
    }

    /// Deliver the final failure of an activity (retries are over)
    #[instrument(skip(self, error))]
    pub async fn on_activity_failed(
        &self,
        run_id: Uuid,
        activity_id: &str,
        error: ActivityError,
    ) -> Result<(), ExecutorError> {
        let event = WorkflowEvent::ActivityFailed {
            activity_id: activity_id.to_string(),
            error,
        };
        self.drive(vec![Effect::Pending {
            run_id,
            effect: PendingEffect::Deliver { event },
        }])
        .await
    }

    /// Deliver a fired timer
    #[instrument(skip(self))]
    pub async fn on_timer_fired(&self, run_id: Uuid, timer_id: &str) -> Result<(), ExecutorError> {
        self.drive(vec![Effect::Advance {
            run_id,
            event: WorkflowEvent::TimerFired {
                timer_id: timer_id.to_string(),
            },
        }])
        .await
    }

    /// Send a signal to the open run of a workflow id
    ///
    /// A cancel signal cancels the run instead of reaching the workflow.
    #[instrument(skip(self, signal), fields(signal_type = %signal.signal_type))]
    pub async fn send_signal(
        &self,
        workflow_id: &str,
        signal: WorkflowSignal,
    ) -> Result<(), ExecutorError> {
        if signal.is_cancel() {
            let reason = signal
                .cancel_reason()
                .unwrap_or("cancelled by signal")
                .to_string();
            return self.cancel_workflow(workflow_id, reason).await;
        }

        let run = self.open_run(workflow_id).await?;
        self.drive(vec![Effect::Advance {
            run_id: run.run_id,
            event: WorkflowEvent::SignalReceived { signal },
        }])
        .await?;

        info!(%workflow_id, run_id = %run.run_id, "signal delivered");
        Ok(())
    }

    /// Cancel the open run of a workflow id
    ///
    /// Its pending activity tasks and timers are dropped, running attempts
    /// observe the cancellation at their next heartbeat, and children are
    /// handled according to their parent close policy.
    #[instrument(skip(self, reason))]
    pub async fn cancel_workflow(
        &self,
        workflow_id: &str,
        reason: impl Into<String>,
    ) -> Result<(), ExecutorError> {
        let run = self.open_run(workflow_id).await?;
        let reason = reason.into();
        info!(%workflow_id, run_id = %run.run_id, %reason, "cancelling workflow");

        self.drive(vec![Effect::Advance {
            run_id: run.run_id,
            event: WorkflowEvent::WorkflowCancelled { reason },
        }])
        .await
    }

    /// Terminate the open run of a workflow id
    #[instrument(skip(self, reason))]
    pub async fn terminate_workflow(
        &self,
        workflow_id: &str,
        reason: impl Into<String>,
    ) -> Result<(), ExecutorError> {
        let run = self.open_run(workflow_id).await?;
        let reason = reason.into();
        warn!(%workflow_id, run_id = %run.run_id, %reason, "terminating workflow");

        self.drive(vec![Effect::Advance {
            run_id: run.run_id,
            event: WorkflowEvent::WorkflowTerminated { reason },
        }])
        .await
    }

    /// Query the latest run of a workflow id
    ///
    /// The state is rebuilt by replaying the history; nothing is written.
    /// Closed runs can be queried too.
    #[instrument(skip(self))]
    pub async fn query_workflow(
        &self,
        workflow_id: &str,
        query_type: &str,
    ) -> Result<Value, ExecutorError> {
        let run = self.describe_workflow(workflow_id).await?;
        let history = self.store.load_events(run.run_id).await?;

        let workflow = self.registry.replay(
            &run.workflow_type,
            run.input,
            history.iter().map(|(_, event)| event),
        )?;

        workflow
            .query(query_type)
            .ok_or_else(|| ExecutorError::UnknownQuery {
                workflow_id: workflow_id.to_string(),
                query_type: query_type.to_string(),
            })
    }

    /// Latest run of a workflow id
    pub async fn describe_workflow(&self, workflow_id: &str) -> Result<WorkflowInfo, ExecutorError> {
        self.store
            .find_current_run(workflow_id)
            .await?
            .ok_or_else(|| ExecutorError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// A specific run
    pub async fn describe_run(&self, run_id: Uuid) -> Result<WorkflowInfo, ExecutorError> {
        Ok(self.store.get_workflow_info(run_id).await?)
    }

    /// Event history of a run
    pub async fn history(&self, run_id: Uuid) -> Result<Vec<WorkflowEvent>, ExecutorError> {
        let events = self.store.load_events(run_id).await?;
        Ok(events.into_iter().map(|(_, event)| event).collect())
    }

    /// Apply committed effects that nobody applied within `stale_after`
    ///
    /// Covers a process that died between an append and its effects, and
    /// effects whose application failed. Returns how many were claimed.
    #[instrument(skip(self))]
    pub async fn recover_effects(
        &self,
        stale_after: Duration,
        limit: usize,
    ) -> Result<usize, ExecutorError> {
        let records = self.store.claim_stale_effects(stale_after, limit).await?;
        if records.is_empty() {
            return Ok(0);
        }

        let claimed = records.len();
        let effects = records
            .into_iter()
            .map(|record| {
                info!(
                    run_id = %record.run_id,
                    effect = record.effect.kind(),
                    attempts = record.attempts,
                    "recovering effect"
                );
                Effect::Pending {
                    run_id: record.run_id,
                    effect: record.effect,
                }
            })
            .collect();

        self.drive(effects).await?;
        Ok(claimed)
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    async fn open_run(&self, workflow_id: &str) -> Result<WorkflowInfo, ExecutorError> {
        let run = self.describe_workflow(workflow_id).await?;
        if run.status.is_terminal() {
            return Err(ExecutorError::WorkflowClosed(workflow_id.to_string()));
        }
        Ok(run)
    }

    /// Resolve the id reuse policy and create the run
    ///
    /// Returns the run plus the effects that get it going.
    async fn prepare_start(
        &self,
        workflow_type: &str,
        input: Value,
        options: StartOptions,
        parent: Option<(Uuid, ParentClosePolicy)>,
    ) -> Result<(StartedRun, Vec<Effect>), ExecutorError> {
        // Reject unknown types and malformed input before anything is persisted
        self.registry.create(workflow_type, input.clone())?;

        let workflow_id = options.workflow_id;
        let mut effects = Vec::new();

        if let Some(current) = self.store.find_current_run(&workflow_id).await? {
            let open = !current.status.is_terminal();

            match options.id_reuse_policy {
                IdReusePolicy::RejectDuplicate => {
                    return Err(ExecutorError::WorkflowAlreadyExists(workflow_id));
                }
                IdReusePolicy::AllowDuplicate if open => {
                    return Err(ExecutorError::WorkflowAlreadyExists(workflow_id));
                }
                IdReusePolicy::UseExisting if open => {
                    debug!(%workflow_id, run_id = %current.run_id, "joining open run");
                    return Ok((
                        StartedRun {
                            run_id: current.run_id,
                            workflow_id,
                            existing: true,
                        },
                        effects,
                    ));
                }
                IdReusePolicy::TerminateIfRunning if open => {
                    info!(%workflow_id, run_id = %current.run_id, "terminating previous run");
                    effects.extend(
                        self.advance(
                            current.run_id,
                            WorkflowEvent::WorkflowTerminated {
                                reason: "replaced by a new run".to_string(),
                            },
                        )
                        .await?,
                    );
                }
                _ => {}
            }
        }

        let run_id = Uuid::now_v7();
        let task_queue = options
            .task_queue
            .unwrap_or_else(|| self.config.default_task_queue.clone());
        let (parent_run_id, parent_close_policy) = match parent {
            Some((id, policy)) => (Some(id), policy),
            None => (None, ParentClosePolicy::default()),
        };

        let created = self
            .store
            .create_workflow(NewWorkflow {
                run_id,
                workflow_id: workflow_id.clone(),
                workflow_type: workflow_type.to_string(),
                task_queue,
                input,
                parent_run_id,
                parent_close_policy,
            })
            .await;

        match created {
            Ok(()) => {}
            Err(StoreError::WorkflowIdInUse(id)) => {
                return Err(ExecutorError::WorkflowAlreadyExists(id));
            }
            Err(e) => return Err(e.into()),
        }

        info!(%workflow_id, %run_id, workflow_type, "started workflow run");

        effects.push(Effect::Pending {
            run_id,
            effect: PendingEffect::Start,
        });

        Ok((
            StartedRun {
                run_id,
                workflow_id,
                existing: false,
            },
            effects,
        ))
    }

    /// Process effects until none are left
    ///
    /// Every effect is attempted and the first error among `initial` is
    /// returned. Effects that follow from them are committed, so their
    /// failures are logged and left to [`recover_effects`](Self::recover_effects).
    async fn drive(&self, initial: Vec<Effect>) -> Result<(), ExecutorError> {
        let mut queue: VecDeque<(Effect, bool)> =
            initial.into_iter().map(|effect| (effect, true)).collect();
        let mut first_error = None;

        while let Some((effect, requested)) = queue.pop_front() {
            match self.apply(effect).await {
                Ok(more) => queue.extend(more.into_iter().map(|effect| (effect, false))),
                Err(e) if requested => {
                    warn!(error = %e, "workflow effect failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => warn!(error = %e, "workflow effect failed, left for recovery"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn apply(&self, effect: Effect) -> Result<Vec<Effect>, ExecutorError> {
        match effect {
            Effect::Advance { run_id, event } => self.advance(run_id, event).await,
            Effect::Pending { run_id, effect } => {
                let more = self.apply_pending(run_id, &effect).await?;
                self.store.complete_effect(run_id, &effect.key()).await?;
                Ok(more)
            }
        }
    }

    /// Carry out a committed effect
    ///
    /// Everything returned is itself committed, so the effect may be
    /// removed once this succeeds. Applying an effect again is harmless.
    async fn apply_pending(
        &self,
        run_id: Uuid,
        effect: &PendingEffect,
    ) -> Result<Vec<Effect>, ExecutorError> {
        match effect {
            PendingEffect::Start => {
                let info = self.store.get_workflow_info(run_id).await?;
                self.advance(run_id, WorkflowEvent::WorkflowStarted { input: info.input })
                    .await
            }

            PendingEffect::Deliver { event } => self.advance(run_id, event.clone()).await,

            PendingEffect::StartChild {
                sequence,
                parent_task_queue,
                child,
            } => {
                self.start_child(run_id, *sequence, parent_task_queue, child)
                    .await
            }

            PendingEffect::RunLocal {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                let info = self.store.get_workflow_info(run_id).await?;
                if info.status.is_terminal() {
                    debug!(%run_id, %activity_id, "run is closed, skipping local activity");
                    return Ok(vec![]);
                }
                let history = self.store.load_events(run_id).await?;
                if is_resolved(&history, activity_id) {
                    debug!(%run_id, %activity_id, "local activity already resolved");
                    return Ok(vec![]);
                }

                let event = self
                    .run_local(
                        run_id,
                        &info.workflow_id,
                        activity_id,
                        activity_type,
                        input.clone(),
                        options,
                    )
                    .await;
                self.advance(run_id, event).await
            }

            PendingEffect::ContinueAsNew { input } => self.continue_as_new(run_id, input).await,

            PendingEffect::Close => self.close(run_id).await,
        }
    }

    /// Start the child a parent initiated at `sequence` in its history
    ///
    /// Store failures are returned so the effect is retried. Starts the
    /// child can never make (unknown type, bad input, id taken under its
    /// reuse policy) are logged and dropped; the parent does not wait on
    /// its children.
    async fn start_child(
        &self,
        parent_run_id: Uuid,
        sequence: i32,
        parent_task_queue: &str,
        child: &ChildWorkflow,
    ) -> Result<Vec<Effect>, ExecutorError> {
        let parent = self.store.get_workflow_info(parent_run_id).await?;
        if parent.status.is_terminal() && child.parent_close_policy != ParentClosePolicy::Abandon {
            debug!(
                %parent_run_id,
                child_workflow_id = %child.workflow_id,
                "parent closed before its child started"
            );
            return Ok(vec![]);
        }

        // Initiations of this workflow id up to and including this one,
        // against children already created under it
        let history = self.store.load_events(parent_run_id).await?;
        let initiated = history
            .iter()
            .filter(|(position, event)| {
                *position <= sequence
                    && matches!(
                        event,
                        WorkflowEvent::ChildWorkflowInitiated { workflow_id, .. }
                            if *workflow_id == child.workflow_id
                    )
            })
            .count();
        let created = self
            .store
            .list_children(parent_run_id)
            .await?
            .iter()
            .filter(|run| run.workflow_id == child.workflow_id)
            .count();
        if created >= initiated {
            debug!(
                %parent_run_id,
                child_workflow_id = %child.workflow_id,
                "child workflow already started"
            );
            return Ok(vec![]);
        }

        let options = StartOptions {
            workflow_id: child.workflow_id.clone(),
            task_queue: Some(
                child
                    .task_queue
                    .clone()
                    .unwrap_or_else(|| parent_task_queue.to_string()),
            ),
            id_reuse_policy: child.id_reuse_policy,
        };

        match self
            .prepare_start(
                &child.workflow_type,
                child.input.clone(),
                options,
                Some((parent_run_id, child.parent_close_policy)),
            )
            .await
        {
            Ok((started, effects)) => {
                debug!(
                    %parent_run_id,
                    child_workflow_id = %started.workflow_id,
                    child_run_id = %started.run_id,
                    existing = started.existing,
                    "child workflow dispatched"
                );
                Ok(effects)
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                warn!(
                    %parent_run_id,
                    child_workflow_id = %child.workflow_id,
                    error = %e,
                    "child workflow not started"
                );
                Ok(vec![])
            }
        }
    }

    /// Create the run that follows `previous_run_id`
    async fn continue_as_new(
        &self,
        previous_run_id: Uuid,
        input: &Value,
    ) -> Result<Vec<Effect>, ExecutorError> {
        let previous = self.store.get_workflow_info(previous_run_id).await?;
        if let Some(current) = self.store.find_current_run(&previous.workflow_id).await? {
            if current.run_id != previous.run_id {
                debug!(workflow_id = %previous.workflow_id, "next run already exists");
                return Ok(vec![]);
            }
        }

        let run_id = Uuid::now_v7();
        let created = self
            .store
            .create_workflow(NewWorkflow {
                run_id,
                workflow_id: previous.workflow_id.clone(),
                workflow_type: previous.workflow_type.clone(),
                task_queue: previous.task_queue.clone(),
                input: input.clone(),
                parent_run_id: previous.parent_run_id,
                parent_close_policy: previous.parent_close_policy,
            })
            .await;

        match created {
            Ok(()) => {}
            Err(StoreError::WorkflowIdInUse(workflow_id)) => {
                debug!(%workflow_id, "workflow id taken before the next run was created");
                return Ok(vec![]);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            workflow_id = %previous.workflow_id,
            %previous_run_id,
            %run_id,
            "continued as new"
        );

        Ok(vec![Effect::Pending {
            run_id,
            effect: PendingEffect::Start,
        }])
    }

    /// Deliver one event to a run, replaying on concurrency conflicts
    async fn advance(&self, run_id: Uuid, event: WorkflowEvent) -> Result<Vec<Effect>, ExecutorError> {
        for attempt in 0..=self.config.max_advance_retries {
            match self.try_advance(run_id, &event).await {
                Err(ExecutorError::Store(StoreError::ConcurrencyConflict { expected, actual })) => {
                    debug!(%run_id, attempt, expected, actual, "concurrent advance, replaying");
                }
                other => return other,
            }
        }

        Err(ExecutorError::TooManyConflicts(run_id))
    }

    #[instrument(skip(self, event), fields(event = event.type_name()))]
    async fn try_advance(
        &self,
        run_id: Uuid,
        event: &WorkflowEvent,
    ) -> Result<Vec<Effect>, ExecutorError> {
        let info = self.store.get_workflow_info(run_id).await?;
        if info.status.is_terminal() {
            debug!(%run_id, status = %info.status, "run is closed, dropping event");
            return Ok(vec![]);
        }

        let history = self.store.load_events(run_id).await?;
        let sequence = history.len() as i32;

        // Cancellation and termination close the run without consulting it
        if event.is_terminal() {
            let append = HistoryAppend {
                events: vec![event.clone()],
                effects: vec![PendingEffect::Close],
                ..Default::default()
            };
            self.store.append_events(run_id, sequence, append).await?;
            return Ok(pending(run_id, &[PendingEffect::Close]));
        }

        if !accepts(&history, event) {
            debug!(%run_id, "duplicate or unexpected event, dropping");
            return Ok(vec![]);
        }

        let mut workflow = self.registry.replay(
            &info.workflow_type,
            info.input.clone(),
            history.iter().map(|(_, past)| past),
        )?;
        let actions = workflow.handle(event);

        let mut append = plan(&info, sequence, event.clone(), actions);

        if history.len() + append.events.len() > self.config.max_events_per_workflow {
            warn!(
                %run_id,
                limit = self.config.max_events_per_workflow,
                "history limit exceeded, failing run"
            );
            let error = WorkflowError::new(format!(
                "history exceeds {} events",
                self.config.max_events_per_workflow
            ))
            .with_code(HISTORY_LIMIT_CODE);
            append = HistoryAppend {
                events: vec![event.clone(), WorkflowEvent::WorkflowFailed { error }],
                effects: vec![PendingEffect::Close],
                ..Default::default()
            };
        }

        let effects = pending(run_id, &append.effects);
        let events = append.events.len();
        let tasks = append.tasks.len();
        self.store.append_events(run_id, sequence, append).await?;
        debug!(%run_id, events, tasks, effects = effects.len(), "advanced run");

        Ok(effects)
    }

    /// Run a local activity to its final outcome
    #[instrument(skip(self, input, options))]
    async fn run_local(
        &self,
        run_id: Uuid,
        workflow_id: &str,
        activity_id: &str,
        activity_type: &str,
        input: Value,
        options: &ActivityOptions,
    ) -> WorkflowEvent {
        let scheduled_at = Utc::now();
        let mut attempt = 1;

        loop {
            let ctx = ActivityContext::new(
                run_id,
                workflow_id,
                activity_id,
                attempt,
                options.retry_policy.max_attempts,
            );

            let result = match tokio::time::timeout(
                options.start_to_close_timeout,
                self.local_activities.execute(activity_type, input.clone(), ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ActivityError::timeout(options.start_to_close_timeout)),
            };

            let error = match result {
                Ok(result) => {
                    return WorkflowEvent::ActivityCompleted {
                        activity_id: activity_id.to_string(),
                        result,
                    }
                }
                Err(error) => error,
            };

            let outcome =
                TaskFailureOutcome::decide(options, attempt, scheduled_at, Utc::now(), &error);
            match outcome {
                TaskFailureOutcome::WillRetry {
                    next_attempt,
                    delay,
                } => {
                    debug!(attempt, ?delay, error = %error, "local activity failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt = next_attempt;
                }
                outcome => {
                    warn!(attempt, error = %error, "local activity failed");
                    return WorkflowEvent::ActivityFailed {
                        activity_id: activity_id.to_string(),
                        error: outcome.final_error(&error),
                    };
                }
            }
        }
    }

    /// Drop a closed run's work and apply parent close policies
    ///
    /// Children are closed here rather than through returned effects, so
    /// that a failure leaves the close pending.
    async fn close(&self, run_id: Uuid) -> Result<Vec<Effect>, ExecutorError> {
        let tasks = self.store.cancel_tasks(run_id).await?;
        let timers = self.store.cancel_timers(run_id).await?;
        debug!(%run_id, tasks, timers, "closed run");

        let mut effects = Vec::new();
        for child in self.store.list_children(run_id).await? {
            if child.status.is_terminal() {
                continue;
            }

            let reason = format!("parent run {run_id} closed");
            let event = match child.parent_close_policy {
                ParentClosePolicy::Terminate => WorkflowEvent::WorkflowTerminated { reason },
                ParentClosePolicy::RequestCancel => WorkflowEvent::WorkflowCancelled { reason },
                ParentClosePolicy::Abandon => continue,
            };

            info!(
                %run_id,
                child_workflow_id = %child.workflow_id,
                policy = child.parent_close_policy.as_str(),
                "closing child with parent"
            );
            effects.extend(self.advance(child.run_id, event).await?);
        }

        Ok(effects)
    }
}

/// Whether an event should be delivered to a run with this history
///
/// Activity results and fired timers are delivered at most once, and only
/// for activities and timers the run actually scheduled.
fn accepts(history: &[(i32, WorkflowEvent)], event: &WorkflowEvent) -> bool {
    let past = history.iter().map(|(_, e)| e);

    match event {
        WorkflowEvent::WorkflowStarted { .. } => history.is_empty(),

        WorkflowEvent::ActivityCompleted { activity_id, .. }
        | WorkflowEvent::ActivityFailed { activity_id, .. } => {
            let mut scheduled = false;
            for e in past {
                match e {
                    WorkflowEvent::ActivityScheduled { activity_id: id, .. } if id == activity_id => {
                        scheduled = true;
                    }
                    WorkflowEvent::ActivityCompleted { activity_id: id, .. }
                    | WorkflowEvent::ActivityFailed { activity_id: id, .. }
                        if id == activity_id =>
                    {
                        return false;
                    }
                    _ => {}
                }
            }
            scheduled
        }

        WorkflowEvent::TimerFired { timer_id } => {
            let mut started = false;
            for e in past {
                match e {
                    WorkflowEvent::TimerStarted { timer_id: id, .. } if id == timer_id => {
                        started = true;
                    }
                    WorkflowEvent::TimerFired { timer_id: id } if id == timer_id => return false,
                    _ => {}
                }
            }
            started
        }

        _ => !history.is_empty(),
    }
}

/// Whether the history already holds the outcome of an activity
fn is_resolved(history: &[(i32, WorkflowEvent)], activity_id: &str) -> bool {
    history.iter().any(|(_, event)| {
        matches!(
            event,
            WorkflowEvent::ActivityCompleted { activity_id: id, .. }
                | WorkflowEvent::ActivityFailed { activity_id: id, .. }
                if id == activity_id
        )
    })
}

/// Turn the actions produced by `event` into the append that records them
///
/// `sequence` is the history length before the append. Actions after the
/// first terminal action are dropped.
fn plan(
    info: &WorkflowInfo,
    sequence: i32,
    event: WorkflowEvent,
    actions: Vec<WorkflowAction>,
) -> HistoryAppend {
    let run_id = info.run_id;
    let now = Utc::now();
    let mut append = HistoryAppend::events(vec![event]);

    for action in actions {
        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                debug!(%run_id, %activity_id, %activity_type, "scheduling activity");

                append.events.push(WorkflowEvent::ActivityScheduled {
                    activity_id: activity_id.clone(),
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    options: options.clone(),
                    local: false,
                });
                append.tasks.push(TaskDefinition {
                    run_id,
                    workflow_id: info.workflow_id.clone(),
                    workflow_type: info.workflow_type.clone(),
                    task_queue: options
                        .task_queue
                        .clone()
                        .unwrap_or_else(|| info.task_queue.clone()),
                    activity_id,
                    activity_type,
                    input,
                    options,
                });
            }

            WorkflowAction::ScheduleLocalActivity {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                debug!(%run_id, %activity_id, %activity_type, "scheduling local activity");

                append.events.push(WorkflowEvent::ActivityScheduled {
                    activity_id: activity_id.clone(),
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    options: options.clone(),
                    local: true,
                });
                append.effects.push(PendingEffect::RunLocal {
                    activity_id,
                    activity_type,
                    input,
                    options,
                });
            }

            WorkflowAction::StartTimer { timer_id, duration } => {
                let fire_at = chrono::Duration::from_std(duration)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay));
                let Some(fire_at) = fire_at else {
                    warn!(%run_id, %timer_id, ?duration, "timer out of range, failing workflow");
                    let error = WorkflowError::new(format!(
                        "timer {timer_id} duration {duration:?} is out of range"
                    ))
                    .with_code(INVALID_TIMER_CODE);
                    append.events.push(WorkflowEvent::WorkflowFailed { error });
                    append.effects.push(PendingEffect::Close);
                    break;
                };

                debug!(%run_id, %timer_id, ?duration, "starting timer");
                append.events.push(WorkflowEvent::TimerStarted {
                    timer_id: timer_id.clone(),
                    duration_ms: duration.as_millis() as u64,
                });
                append.timers.push(TimerRecord {
                    run_id,
                    timer_id,
                    fire_at,
                });
            }

            WorkflowAction::StartChildWorkflow(child) => {
                debug!(%run_id, child_workflow_id = %child.workflow_id, "starting child workflow");

                let position = sequence + append.events.len() as i32;
                append.events.push(WorkflowEvent::ChildWorkflowInitiated {
                    workflow_id: child.workflow_id.clone(),
                    workflow_type: child.workflow_type.clone(),
                    parent_close_policy: child.parent_close_policy,
                });
                append.effects.push(PendingEffect::StartChild {
                    sequence: position,
                    parent_task_queue: info.task_queue.clone(),
                    child,
                });
            }

            WorkflowAction::CompleteWorkflow { result } => {
                info!(%run_id, "completing workflow");
                append.events.push(WorkflowEvent::WorkflowCompleted { result });
                append.effects.push(PendingEffect::Close);
                break;
            }

            WorkflowAction::FailWorkflow { error } => {
                warn!(%run_id, error = %error, "failing workflow");
                append.events.push(WorkflowEvent::WorkflowFailed { error });
                append.effects.push(PendingEffect::Close);
                break;
            }

            WorkflowAction::ContinueAsNew { input } => {
                info!(%run_id, "continuing as new");
                append.events.push(WorkflowEvent::WorkflowContinuedAsNew {
                    input: input.clone(),
                });
                append.effects.push(PendingEffect::Close);
                append.effects.push(PendingEffect::ContinueAsNew { input });
                break;
            }
        }
    }

    append
}
