//! In-memory implementation of WorkflowEventStore for testing

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::WorkflowEvent;

/// Internal task state
struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    claimed_by: Option<String>,
    scheduled_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
}

/// Internal run state
struct RunState {
    info: WorkflowInfo,
    events: Vec<WorkflowEvent>,
}

/// Internal effect state
struct EffectState {
    effect: PendingEffect,
    attempts: u32,
    touched_at: DateTime<Utc>,
}

impl EffectState {
    fn new(effect: PendingEffect, now: DateTime<Utc>) -> Self {
        Self {
            effect,
            attempts: 0,
            touched_at: now,
        }
    }
}

/// In-memory implementation of WorkflowEventStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation, plus a few
/// inspection helpers for assertions.
///
/// # Example
///
/// ```
/// use maas_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowEventStore {
    runs: RwLock<HashMap<Uuid, RunState>>,
    tasks: RwLock<HashMap<Uuid, TaskState>>,
    timers: RwLock<Vec<TimerRecord>>,
    effects: RwLock<BTreeMap<(Uuid, String), EffectState>>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of workflow runs
    pub fn workflow_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Get the number of pending tasks
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Make every pending task claimable now, skipping retry backoff
    pub fn expedite_retries(&self) -> usize {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let mut expedited = 0;
        for task in tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Pending && t.available_at > now)
        {
            task.available_at = now;
            expedited += 1;
        }
        expedited
    }

    /// Tasks that are pending or claimed, oldest first
    pub fn open_tasks(&self) -> Vec<TaskDefinition> {
        let tasks = self.tasks.read();
        let mut open: Vec<_> = tasks
            .iter()
            .filter(|(_, t)| matches!(t.status, TaskStatus::Pending | TaskStatus::Claimed))
            .collect();
        open.sort_by_key(|(id, _)| **id);
        open.into_iter().map(|(_, t)| t.definition.clone()).collect()
    }

    /// Status of a task
    pub fn task_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.tasks.read().get(&task_id).map(|t| t.status)
    }

    /// Timers not yet fired, in firing order
    pub fn pending_timers(&self) -> Vec<TimerRecord> {
        let mut timers = self.timers.read().clone();
        timers.sort_by_key(|t| t.fire_at);
        timers
    }

    /// Every run of a workflow id, oldest first
    pub fn runs_for(&self, workflow_id: &str) -> Vec<WorkflowInfo> {
        let runs = self.runs.read();
        let mut found: Vec<_> = runs
            .values()
            .filter(|r| r.info.workflow_id == workflow_id)
            .map(|r| r.info.clone())
            .collect();
        found.sort_by_key(|r| r.run_id);
        found
    }

    /// Every run, oldest first
    pub fn all_runs(&self) -> Vec<WorkflowInfo> {
        let runs = self.runs.read();
        let mut found: Vec<_> = runs.values().map(|r| r.info.clone()).collect();
        found.sort_by_key(|r| r.run_id);
        found
    }

    /// Effects not yet applied, by run then key
    pub fn pending_effects(&self) -> Vec<EffectRecord> {
        self.effects
            .read()
            .iter()
            .map(|((run_id, _), state)| EffectRecord {
                run_id: *run_id,
                effect: state.effect.clone(),
                attempts: state.attempts,
            })
            .collect()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.runs.write().clear();
        self.tasks.write().clear();
        self.timers.write().clear();
        self.effects.write().clear();
    }

    fn record_effect(&self, run_id: Uuid, effect: PendingEffect, now: DateTime<Utc>) {
        self.effects
            .write()
            .entry((run_id, effect.key()))
            .or_insert_with(|| EffectState::new(effect, now));
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<(), StoreError> {
        let mut runs = self.runs.write();

        let in_use = runs
            .values()
            .any(|r| r.info.workflow_id == workflow.workflow_id && !r.info.status.is_terminal());
        if in_use {
            return Err(StoreError::WorkflowIdInUse(workflow.workflow_id));
        }

        let now = Utc::now();
        runs.insert(
            workflow.run_id,
            RunState {
                info: WorkflowInfo {
                    run_id: workflow.run_id,
                    workflow_id: workflow.workflow_id,
                    workflow_type: workflow.workflow_type,
                    task_queue: workflow.task_queue,
                    status: WorkflowStatus::Pending,
                    input: workflow.input,
                    result: None,
                    error: None,
                    parent_run_id: workflow.parent_run_id,
                    parent_close_policy: workflow.parent_close_policy,
                    created_at: now,
                    updated_at: now,
                },
                events: vec![],
            },
        );
        drop(runs);

        self.record_effect(workflow.run_id, PendingEffect::Start, now);
        Ok(())
    }

    async fn get_workflow_info(&self, run_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .map(|r| r.info.clone())
            .ok_or(StoreError::WorkflowNotFound(run_id))
    }

    async fn find_current_run(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowInfo>, StoreError> {
        // v7 run ids sort by creation time
        Ok(self.runs_for(workflow_id).pop())
    }

    async fn list_children(&self, parent_run_id: Uuid) -> Result<Vec<WorkflowInfo>, StoreError> {
        let runs = self.runs.read();
        let mut children: Vec<_> = runs
            .values()
            .filter(|r| r.info.parent_run_id == Some(parent_run_id))
            .map(|r| r.info.clone())
            .collect();
        children.sort_by_key(|r| r.run_id);
        Ok(children)
    }

    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: i32,
        append: HistoryAppend,
    ) -> Result<i32, StoreError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::WorkflowNotFound(run_id))?;

        let current_sequence = run.events.len() as i32;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let now = Utc::now();
        if let Some(change) = status_change(&append.events) {
            run.info.status = change.status;
            run.info.result = change.result;
            run.info.error = change.error;
        }
        run.info.updated_at = now;
        run.events.extend(append.events);
        let sequence = run.events.len() as i32;
        drop(runs);

        let mut tasks = self.tasks.write();
        for definition in append.tasks {
            tasks.insert(
                Uuid::now_v7(),
                TaskState {
                    definition,
                    status: TaskStatus::Pending,
                    attempt: 0,
                    claimed_by: None,
                    scheduled_at: now,
                    available_at: now,
                    last_heartbeat_at: None,
                    cancel_requested: false,
                },
            );
        }
        drop(tasks);

        self.timers.write().extend(append.timers);

        for effect in append.effects {
            self.record_effect(run_id, effect, now);
        }
        Ok(sequence)
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<(i32, WorkflowEvent)>, StoreError> {
        let runs = self.runs.read();
        let run = runs.get(&run_id).ok_or(StoreError::WorkflowNotFound(run_id))?;

        Ok(run
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (i as i32, e.clone()))
            .collect())
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        filter: &TaskFilter,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();

        let mut candidates: Vec<(Uuid, i32)> = tasks
            .iter()
            .filter(|(_, t)| {
                t.status == TaskStatus::Pending
                    && t.available_at <= now
                    && filter.matches(&t.definition)
            })
            .map(|(id, t)| (*id, t.definition.options.priority))
            .collect();
        // Higher priority first, then oldest
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut claimed = vec![];
        for (task_id, _) in candidates.into_iter().take(max_tasks) {
            let Some(task) = tasks.get_mut(&task_id) else {
                continue;
            };
            task.status = TaskStatus::Claimed;
            task.claimed_by = Some(worker_id.to_string());
            task.attempt += 1;
            task.last_heartbeat_at = Some(now);

            let def = &task.definition;
            claimed.push(ClaimedTask {
                id: task_id,
                run_id: def.run_id,
                workflow_id: def.workflow_id.clone(),
                workflow_type: def.workflow_type.clone(),
                task_queue: def.task_queue.clone(),
                activity_id: def.activity_id.clone(),
                activity_type: def.activity_type.clone(),
                input: def.input.clone(),
                options: def.options.clone(),
                attempt: task.attempt,
                max_attempts: def.options.retry_policy.max_attempts,
            });
        }

        Ok(claimed)
    }

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        _details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let owned = task.status == TaskStatus::Claimed
            && task.claimed_by.as_deref() == Some(worker_id);
        if owned {
            task.last_heartbeat_at = Some(Utc::now());
        }

        Ok(HeartbeatResponse {
            accepted: owned,
            should_cancel: task.cancel_requested || !owned,
        })
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Claimed {
            return Ok(false);
        }

        task.status = TaskStatus::Completed;
        let run_id = task.definition.run_id;
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: task.definition.activity_id.clone(),
            result,
        };
        self.record_effect(run_id, PendingEffect::Deliver { event }, Utc::now());
        Ok(true)
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Claimed {
            return Ok(TaskFailureOutcome::Discarded);
        }

        let now = Utc::now();
        let outcome = TaskFailureOutcome::decide(
            &task.definition.options,
            task.attempt,
            task.scheduled_at,
            now,
            error,
        );

        match &outcome {
            TaskFailureOutcome::WillRetry { delay, .. } => {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.available_at =
                    now + chrono::Duration::from_std(*delay).unwrap_or_else(|_| chrono::Duration::zero());
            }
            _ => {
                task.status = TaskStatus::Failed;
                let event = WorkflowEvent::ActivityFailed {
                    activity_id: task.definition.activity_id.clone(),
                    error: outcome.final_error(error),
                };
                self.record_effect(task.definition.run_id, PendingEffect::Deliver { event }, now);
            }
        }

        Ok(outcome)
    }

    async fn cancel_tasks(&self, run_id: Uuid) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.write();
        let mut cancelled = 0;
        for task in tasks.values_mut() {
            if task.definition.run_id != run_id {
                continue;
            }
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Claimed) {
                task.status = TaskStatus::Cancelled;
                task.cancel_requested = true;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tasks = self.tasks.write();
        let mut reclaimed = vec![];

        for (task_id, task) in tasks.iter_mut() {
            let stale = task.status == TaskStatus::Claimed
                && task.last_heartbeat_at.map_or(true, |at| at < cutoff);
            if stale {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                reclaimed.push(*task_id);
            }
        }

        Ok(reclaimed)
    }

    async fn claim_due_timers(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError> {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
        let mut timers = self.timers.write();
        timers.sort_by_key(|t| t.fire_at);

        let mut due = vec![];
        for timer in timers.iter_mut().filter(|t| t.fire_at <= now).take(limit) {
            due.push(timer.clone());
            timer.fire_at = now + lease;
        }
        Ok(due)
    }

    async fn delete_timer(&self, run_id: Uuid, timer_id: &str) -> Result<(), StoreError> {
        self.timers
            .write()
            .retain(|t| !(t.run_id == run_id && t.timer_id == timer_id));
        Ok(())
    }

    async fn cancel_timers(&self, run_id: Uuid) -> Result<u64, StoreError> {
        let mut timers = self.timers.write();
        let before = timers.len();
        timers.retain(|t| t.run_id != run_id);
        Ok((before - timers.len()) as u64)
    }

    async fn claim_stale_effects(
        &self,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<EffectRecord>, StoreError> {
        let now = Utc::now();
        let cutoff =
            now - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let mut effects = self.effects.write();

        let mut stale: Vec<_> = effects
            .iter_mut()
            .filter(|(_, state)| state.touched_at <= cutoff)
            .collect();
        stale.sort_by_key(|(_, state)| state.touched_at);

        Ok(stale
            .into_iter()
            .take(limit)
            .map(|((run_id, _), state)| {
                state.attempts += 1;
                state.touched_at = now;
                EffectRecord {
                    run_id: *run_id,
                    effect: state.effect.clone(),
                    attempts: state.attempts,
                }
            })
            .collect())
    }

    async fn complete_effect(&self, run_id: Uuid, key: &str) -> Result<(), StoreError> {
        self.effects.write().remove(&(run_id, key.to_string()));
        Ok(())
    }
}
