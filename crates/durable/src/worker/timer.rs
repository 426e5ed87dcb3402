//! Durable timer delivery
//!
//! Timers are rows in the store. The service claims due timers under a
//! lease, delivers them to the executor, and deletes them once delivered.
//! A timer whose delivery fails fires again when its lease runs out.
//!
//! The same loop re-applies workflow effects that were committed but never
//! carried out, such as a child start lost to a failed write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::WorkflowExecutor;
use crate::engine::ExecutorError;
use crate::persistence::StoreError;

/// Timer service configuration
#[derive(Debug, Clone)]
pub struct TimerServiceConfig {
    /// How often to look for due timers
    pub poll_interval: Duration,

    /// How long a claimed timer stays invisible to other services
    pub lease: Duration,

    /// Maximum timers fired, and effects recovered, per poll
    pub batch_size: usize,

    /// Age after which an unapplied effect is re-applied
    pub effect_stale_after: Duration,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(30),
            batch_size: 100,
            effect_stale_after: Duration::from_secs(60),
        }
    }
}

/// Fires durable timers
pub struct TimerService {
    executor: Arc<WorkflowExecutor>,
    config: TimerServiceConfig,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new(executor: Arc<WorkflowExecutor>, config: TimerServiceConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            executor,
            config,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Fire every timer due at `now`, returning how many were delivered
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        fire_due(&self.executor, &self.config, now).await
    }

    /// Re-apply effects left unapplied for longer than `effect_stale_after`
    pub async fn recover_effects(&self) -> Result<usize, ExecutorError> {
        self.executor
            .recover_effects(self.config.effect_stale_after, self.config.batch_size)
            .await
    }

    /// Start the background loop (no-op if already started)
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        self.shutdown_tx.send_replace(false);
        let executor = Arc::clone(&self.executor);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(poll_interval = ?config.poll_interval, "Starting timer service");

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = fire_due(&executor, &config, Utc::now()).await {
                            error!("Timer poll failed: {}", e);
                        }
                        if let Err(e) = executor
                            .recover_effects(config.effect_stale_after, config.batch_size)
                            .await
                        {
                            error!("Effect recovery failed: {}", e);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Timer loop exited");
        }));
    }

    /// Stop the background loop
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Timer loop ended abnormally: {}", e);
            }
        }
    }
}

async fn fire_due(
    executor: &WorkflowExecutor,
    config: &TimerServiceConfig,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let store = executor.store();
    let due = store
        .claim_due_timers(now, config.lease, config.batch_size)
        .await?;

    let mut delivered = 0;
    for timer in due {
        match executor.on_timer_fired(timer.run_id, &timer.timer_id).await {
            Ok(()) => {
                store.delete_timer(timer.run_id, &timer.timer_id).await?;
                delivered += 1;
            }
            Err(e) => {
                warn!(
                    run_id = %timer.run_id,
                    timer_id = %timer.timer_id,
                    "Timer delivery failed, will retry after lease: {}", e
                );
            }
        }
    }

    if delivered > 0 {
        debug!(delivered, "Fired timers");
    }

    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use crate::engine::StartOptions;
    use crate::persistence::{
        InMemoryWorkflowEventStore, NewWorkflow, WorkflowEventStore, WorkflowStatus,
    };
    use crate::workflow::{ParentClosePolicy, Workflow, WorkflowAction};
    use uuid::Uuid;
    use serde_json::{json, Value};

    /// Waits twice, then completes with the number of naps taken
    struct NapWorkflow {
        naps: u32,
    }

    impl Workflow for NapWorkflow {
        const TYPE: &'static str = "nap";
        type Input = ();
        type Output = u32;

        fn new(_input: Self::Input) -> Self {
            Self { naps: 0 }
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            vec![WorkflowAction::timer("nap-0", Duration::from_secs(30))]
        }

        fn on_activity_completed(&mut self, _: &str, _: Value) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(&mut self, _: &str, _: &ActivityError) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_timer_fired(&mut self, _timer_id: &str) -> Vec<WorkflowAction> {
            self.naps += 1;
            if self.naps == 2 {
                vec![WorkflowAction::complete(json!(self.naps))]
            } else {
                vec![WorkflowAction::timer(
                    format!("nap-{}", self.naps),
                    Duration::from_secs(30),
                )]
            }
        }

        fn is_completed(&self) -> bool {
            self.naps == 2
        }

        fn result(&self) -> Option<Self::Output> {
            self.is_completed().then_some(self.naps)
        }
    }

    #[tokio::test]
    async fn test_fires_only_due_timers() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut executor = WorkflowExecutor::new(store.clone());
        executor.register::<NapWorkflow>();
        let executor = Arc::new(executor);

        let run = executor
            .start_workflow::<NapWorkflow>(StartOptions::new("napper"), ())
            .await
            .expect("should start workflow");
        let service = TimerService::new(executor.clone(), TimerServiceConfig::default());

        let fired = service.fire_due(Utc::now()).await.expect("should poll");
        assert_eq!(fired, 0);

        let later = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(service.fire_due(later).await.expect("should poll"), 1);

        let timers = store.pending_timers();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].timer_id, "nap-1");

        let much_later = later + chrono::Duration::seconds(31);
        assert_eq!(service.fire_due(much_later).await.expect("should poll"), 1);
        assert!(store.pending_timers().is_empty());

        let info = executor.describe_run(run.run_id).await.expect("should describe");
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let executor = Arc::new(WorkflowExecutor::new(store));
        let service = TimerService::new(
            executor,
            TimerServiceConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        service.start();
        service.start();
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_secs(1), service.shutdown())
            .await
            .expect("should stop promptly");
    }

    /// Commit a run without starting it, as a lost start leaves it
    async fn unstarted_run(store: &InMemoryWorkflowEventStore) -> Uuid {
        let run_id = Uuid::now_v7();
        store
            .create_workflow(NewWorkflow {
                run_id,
                workflow_id: "napper".to_string(),
                workflow_type: NapWorkflow::TYPE.to_string(),
                task_queue: "default".to_string(),
                input: json!(null),
                parent_run_id: None,
                parent_close_policy: ParentClosePolicy::default(),
            })
            .await
            .expect("should create run");
        run_id
    }

    #[tokio::test]
    async fn test_recovers_only_stale_effects() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut executor = WorkflowExecutor::new(store.clone());
        executor.register::<NapWorkflow>();
        let executor = Arc::new(executor);
        let run_id = unstarted_run(&store).await;

        let patient = TimerService::new(executor.clone(), TimerServiceConfig::default());
        assert_eq!(patient.recover_effects().await.expect("should recover"), 0);

        let eager = TimerService::new(
            executor.clone(),
            TimerServiceConfig {
                effect_stale_after: Duration::ZERO,
                ..Default::default()
            },
        );
        assert_eq!(eager.recover_effects().await.expect("should recover"), 1);

        let info = executor.describe_run(run_id).await.expect("should describe");
        assert_eq!(info.status, WorkflowStatus::Running);
        assert_eq!(store.pending_timers().len(), 1);
        assert!(store.pending_effects().is_empty());
    }

    #[tokio::test]
    async fn test_loop_recovers_effects() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut executor = WorkflowExecutor::new(store.clone());
        executor.register::<NapWorkflow>();
        let executor = Arc::new(executor);
        let run_id = unstarted_run(&store).await;

        let service = TimerService::new(
            executor.clone(),
            TimerServiceConfig {
                poll_interval: Duration::from_millis(10),
                effect_stale_after: Duration::ZERO,
                ..Default::default()
            },
        );
        service.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.shutdown().await;

        let info = executor.describe_run(run_id).await.expect("should describe");
        assert_eq!(info.status, WorkflowStatus::Running);
    }
}
