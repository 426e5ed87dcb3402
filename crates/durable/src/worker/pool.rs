//! Worker pool for task execution
//!
//! Claims activity tasks from one task queue, runs them with bounded
//! concurrency and reports the outcome to the store and the executor.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{ActivityContext, ActivityError, ActivityRegistry, CancellationHandle};
use crate::engine::WorkflowExecutor;
use crate::persistence::{
    ClaimedTask, StoreError, TaskFailureOutcome, TaskFilter, WorkflowEventStore,
};
use crate::serde_duration::millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Task queue to claim from
    pub task_queue: String,

    /// If set, only run activities owned by these workflow types
    #[serde(default)]
    pub workflow_types: Option<Vec<String>>,

    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    /// Delay between polls when the queue is empty
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Heartbeat interval for claimed tasks
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    /// Stale task reclamation interval
    #[serde(with = "millis")]
    pub stale_reclaim_interval: Duration,

    /// How long before a task is considered stale
    #[serde(with = "millis")]
    pub stale_threshold: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "default".to_string(),
            workflow_types: None,
            max_concurrency: 10,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration for a task queue
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Restrict the pool to activities of the given workflow types
    pub fn with_workflow_types(mut self, workflow_types: Vec<String>) -> Self {
        self.workflow_types = Some(workflow_types);
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the stale threshold
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// No activity handlers registered
    #[error("worker pool for task queue {0} has no activities")]
    NoActivities(String),

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// State shared with spawned loops and task executions
struct PoolShared {
    store: Arc<dyn WorkflowEventStore>,
    executor: Arc<WorkflowExecutor>,
    activities: ActivityRegistry,
    config: WorkerPoolConfig,
}

/// Worker pool for executing activities
///
/// # Example
///
/// ```ignore
/// use maas_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let mut activities = ActivityRegistry::new();
/// activities.register(SendHeartbeat::new(client));
///
/// let config = WorkerPoolConfig::new("region").with_max_concurrency(10);
/// let pool = WorkerPool::new(executor, activities, config);
///
/// pool.start().await?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        activities: ActivityRegistry,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let active_tasks = Arc::new(Semaphore::new(config.max_concurrency));

        Self {
            shared: Arc::new(PoolShared {
                store: Arc::clone(executor.store()),
                executor,
                activities,
                config,
            }),
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            active_tasks,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(worker_id = %self.shared.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        let config = &self.shared.config;

        if self.shared.activities.is_empty() {
            return Err(WorkerPoolError::NoActivities(config.task_queue.clone()));
        }

        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            task_queue = %config.task_queue,
            activity_types = ?self.shared.activities.activity_types(),
            workflow_types = ?config.workflow_types,
            max_concurrency = config.max_concurrency,
            "Starting worker pool"
        );

        self.shutdown_tx.send_replace(false);

        let mut handles = self.handles.lock();
        handles.push(self.spawn_poll_loop());
        handles.push(self.spawn_reclaim_loop());

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops claiming, then waits for running attempts up to the shutdown
    /// timeout.
    #[instrument(skip(self), fields(worker_id = %self.shared.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker loop ended abnormally: {}", e);
            }
        }

        let max = self.shared.config.max_concurrency;
        let deadline = tokio::time::Instant::now() + self.shared.config.shutdown_timeout;

        loop {
            let available = self.active_tasks.available_permits();
            if available == max {
                debug!("All tasks completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_tasks = max - available, "Shutdown timeout reached");
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("Worker pool stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of attempts currently running
    pub fn current_load(&self) -> usize {
        self.shared.config.max_concurrency - self.active_tasks.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    /// Task queue this pool claims from
    pub fn task_queue(&self) -> &str {
        &self.shared.config.task_queue
    }

    /// Claim and run one batch of tasks, waiting for them to finish
    ///
    /// Returns how many tasks were run. Useful to drive a pool step by step.
    pub async fn run_once(&self) -> Result<usize, WorkerPoolError> {
        let shared = &self.shared;
        let tasks = shared
            .store
            .claim_tasks(
                &shared.config.worker_id,
                &task_filter(shared),
                shared.config.max_concurrency,
            )
            .await?;

        let count = tasks.len();
        futures::future::join_all(
            tasks
                .into_iter()
                .map(|task| execute_task(Arc::clone(shared), task)),
        )
        .await;

        Ok(count)
    }

    /// Start the polling loop
    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let active_tasks = Arc::clone(&self.active_tasks);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let filter = task_filter(&shared);
            let interval = shared.config.poll_interval;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let available = active_tasks.available_permits();
                let mut claimed = 0;

                if available > 0 {
                    match shared
                        .store
                        .claim_tasks(&shared.config.worker_id, &filter, available)
                        .await
                    {
                        Ok(tasks) => {
                            claimed = tasks.len();
                            for task in tasks {
                                // Only this loop takes permits, so one is free for every claimed task
                                let Ok(permit) = Arc::clone(&active_tasks).acquire_owned().await
                                else {
                                    break;
                                };

                                let shared = Arc::clone(&shared);
                                tokio::spawn(async move {
                                    execute_task(shared, task).await;
                                    drop(permit);
                                });
                            }
                        }
                        Err(e) => {
                            error!("Poll error: {}", e);
                        }
                    }
                }

                // Poll again right away while the queue keeps filling every slot
                if claimed > 0 && claimed == available {
                    continue;
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            debug!("Poll loop exited");
        })
    }

    /// Start the stale task reclamation loop
    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.shared.store);
        let interval = self.shared.config.stale_reclaim_interval;
        let threshold = self.shared.config.stale_threshold;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.reclaim_stale_tasks(threshold).await {
                            Ok(reclaimed) => {
                                if !reclaimed.is_empty() {
                                    info!(count = reclaimed.len(), "Reclaimed stale tasks");
                                }
                            }
                            Err(e) => {
                                error!("Stale task reclamation failed: {}", e);
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Reclaim loop exited");
        })
    }
}

fn task_filter(shared: &PoolShared) -> TaskFilter {
    let filter = TaskFilter::new(
        shared.config.task_queue.clone(),
        shared.activities.activity_types(),
    );
    match &shared.config.workflow_types {
        Some(types) => filter.with_workflow_types(types.clone()),
        None => filter,
    }
}

/// Run one claimed attempt and report its outcome
#[instrument(
    skip(shared, task),
    fields(task_id = %task.id, run_id = %task.run_id, activity_type = %task.activity_type, attempt = task.attempt)
)]
async fn execute_task(shared: Arc<PoolShared>, task: ClaimedTask) {
    let ctx = ActivityContext::new(
        task.run_id,
        task.workflow_id.clone(),
        task.activity_id.clone(),
        task.attempt,
        task.max_attempts,
    );
    let cancellation = ctx.cancellation_handle();

    let pump = tokio::spawn(heartbeat_pump(
        Arc::clone(&shared.store),
        task.id,
        shared.config.worker_id.clone(),
        shared.config.heartbeat_interval,
        cancellation.clone(),
    ));

    let timeout = task.options.start_to_close_timeout;
    let result = tokio::select! {
        outcome = tokio::time::timeout(
            timeout,
            shared.activities.execute(&task.activity_type, task.input.clone(), ctx),
        ) => match outcome {
            Ok(result) => result,
            Err(_) => Err(ActivityError::timeout(timeout)),
        },
        _ = cancellation.cancelled() => Err(ActivityError::cancelled()),
    };
    pump.abort();

    match result {
        Ok(output) => match shared.store.complete_task(task.id, output.clone()).await {
            Ok(true) => {
                debug!("Activity completed");
                if let Err(e) = shared
                    .executor
                    .on_activity_completed(task.run_id, &task.activity_id, output)
                    .await
                {
                    error!("Failed to deliver activity result: {}", e);
                }
            }
            Ok(false) => debug!("Task no longer claimed, result dropped"),
            Err(e) => error!("Failed to complete task: {}", e),
        },
        Err(activity_error) => match shared.store.fail_task(task.id, &activity_error).await {
            Ok(TaskFailureOutcome::WillRetry {
                next_attempt,
                delay,
            }) => {
                debug!(next_attempt, ?delay, error = %activity_error, "Activity failed, will retry");
            }
            Ok(TaskFailureOutcome::Discarded) => {
                debug!(error = %activity_error, "Task no longer claimed, failure dropped");
            }
            Ok(outcome) => {
                warn!(?outcome, error = %activity_error, "Activity failed");
                if let Err(e) = shared
                    .executor
                    .on_activity_failed(
                        task.run_id,
                        &task.activity_id,
                        outcome.final_error(&activity_error),
                    )
                    .await
                {
                    error!("Failed to deliver activity failure: {}", e);
                }
            }
            Err(e) => error!("Failed to fail task: {}", e),
        },
    }
}

/// Keep a claimed task alive and watch for cancellation
///
/// Beats once per interval. A rejected heartbeat means the task was
/// cancelled or reclaimed.
async fn heartbeat_pump(
    store: Arc<dyn WorkflowEventStore>,
    task_id: Uuid,
    worker_id: String,
    interval: Duration,
    cancellation: CancellationHandle,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match store.heartbeat_task(task_id, &worker_id, None).await {
            Ok(response) if response.should_cancel => {
                info!(%task_id, "Task cancelled, stopping attempt");
                cancellation.cancel();
                break;
            }
            Ok(_) => {}
            Err(e) => warn!(%task_id, "Heartbeat failed: {}", e),
        }
    }
}
