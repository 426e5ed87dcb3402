//! Worker process wiring
//!
//! Connects the collaborators, registers every workflow and activity with
//! the engine, and runs one worker pool per configured task queue next to
//! the timer service.

use std::sync::Arc;
use std::time::Duration;

use maas_durable::{
    ActivityRegistry, ExecutorConfig, InMemoryWorkflowEventStore, PostgresWorkflowEventStore,
    StoreError, TimerService, TimerServiceConfig, WorkerPool, WorkerPoolConfig, WorkerPoolError,
    WorkflowEventStore, WorkflowExecutor,
};
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::error::CollaboratorError;
use crate::machines::{InMemoryMachineStatusSource, MachineStatusSource, PostgresMachineStatusSource};
use crate::msm::{register_msm_activities, MsmClient, MsmEnrolSiteWorkflow, MsmHeartbeatWorkflow};
use crate::rack::{HttpRackControllerSource, RackControllerSource};
use crate::secrets::{InMemorySecretStore, PostgresSecretStore, SecretStore};
use crate::worker_pool::{
    register_worker_pool_activities, AddWorkerWorkflow, ConfigureWorkerPoolWorkflow,
    GetRackControllerActivity, PoolProvisioner,
};

/// Timeout of MAAS API requests
const MAAS_API_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("worker pool error: {0}")]
    Pool(#[from] WorkerPoolError),
}

/// Everything the workflows talk to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn WorkflowEventStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub machines: Arc<dyn MachineStatusSource>,
    pub racks: Arc<dyn RackControllerSource>,
    pub msm: Arc<MsmClient>,
}

impl Collaborators {
    /// PostgreSQL-backed collaborators, or in-memory ones without `DATABASE_URL`
    pub async fn connect(config: &WorkerConfig) -> Result<Self, RuntimeError> {
        if config.maas_api_key.is_none() {
            warn!("MAAS_API_KEY not set, MAAS API requests are unauthenticated");
        }
        let racks = Arc::new(
            HttpRackControllerSource::new(config.maas_url.clone(), MAAS_API_TIMEOUT)?
                .with_api_key(config.maas_api_key.clone()),
        );
        let msm = Arc::new(MsmClient::new(config.msm_request_timeout)?);

        let Some(database_url) = config.database_url.as_deref() else {
            warn!("DATABASE_URL not set, using in-memory stores");
            return Ok(Self::in_memory(racks, msm));
        };

        let store = PostgresWorkflowEventStore::connect(database_url).await?;
        store.migrate().await?;
        let pool = store.pool().clone();
        info!("connected to PostgreSQL");

        Ok(Self {
            store: Arc::new(store),
            secrets: Arc::new(PostgresSecretStore::new(pool.clone())),
            machines: Arc::new(PostgresMachineStatusSource::new(pool)),
            racks,
            msm,
        })
    }

    /// In-memory stores with the given rack source and MSM client
    pub fn in_memory(racks: Arc<dyn RackControllerSource>, msm: Arc<MsmClient>) -> Self {
        Self {
            store: Arc::new(InMemoryWorkflowEventStore::new()),
            secrets: Arc::new(InMemorySecretStore::new()),
            machines: Arc::new(InMemoryMachineStatusSource::default()),
            racks,
            msm,
        }
    }
}

/// Executor with every MAAS workflow registered
pub fn build_executor(collaborators: &Collaborators, default_task_queue: &str) -> WorkflowExecutor {
    let config = ExecutorConfig {
        default_task_queue: default_task_queue.to_string(),
        ..Default::default()
    };
    let mut executor = WorkflowExecutor::with_config(collaborators.store.clone(), config);

    executor.register::<MsmEnrolSiteWorkflow>();
    executor.register::<MsmHeartbeatWorkflow>();
    executor.register::<ConfigureWorkerPoolWorkflow>();
    executor.register::<AddWorkerWorkflow>();
    executor.register_local_activity(GetRackControllerActivity::new(collaborators.racks.clone()));

    executor
}

/// Activities run by worker pools, without `add-worker`
pub fn base_activities(collaborators: &Collaborators) -> ActivityRegistry {
    let mut registry = ActivityRegistry::new();
    register_msm_activities(
        &mut registry,
        collaborators.msm.clone(),
        collaborators.secrets.clone(),
        collaborators.machines.clone(),
    );
    registry
}

/// A running `maas-temporal-worker`
pub struct WorkerRuntime {
    executor: Arc<WorkflowExecutor>,
    pools: Vec<Arc<WorkerPool>>,
    timers: TimerService,
    provisioner: Arc<PoolProvisioner>,
}

impl WorkerRuntime {
    pub fn new(config: &WorkerConfig, collaborators: &Collaborators) -> Self {
        let default_queue = config
            .task_queues
            .first()
            .map(String::as_str)
            .unwrap_or(crate::config::DEFAULT_TASK_QUEUE);
        let executor = Arc::new(build_executor(collaborators, default_queue));

        let base = base_activities(collaborators);
        let template = pool_config(config, "").with_worker_id(config.worker_id.clone());
        let provisioner = Arc::new(PoolProvisioner::new(executor.clone(), base.clone(), template));

        let mut activities = base;
        register_worker_pool_activities(&mut activities, provisioner.clone());

        let pools = config
            .task_queues
            .iter()
            .map(|queue| {
                Arc::new(WorkerPool::new(
                    executor.clone(),
                    activities.clone(),
                    pool_config(config, queue),
                ))
            })
            .collect();

        let timers = TimerService::new(executor.clone(), TimerServiceConfig::default());

        Self {
            executor,
            pools,
            timers,
            provisioner,
        }
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    pub fn pools(&self) -> &[Arc<WorkerPool>] {
        &self.pools
    }

    pub fn provisioner(&self) -> &Arc<PoolProvisioner> {
        &self.provisioner
    }

    /// Start the worker pools and the timer service
    pub async fn start(&self) -> Result<(), RuntimeError> {
        for pool in &self.pools {
            pool.start().await?;
        }
        self.timers.start();
        info!(
            task_queues = ?self.pools.iter().map(|p| p.task_queue()).collect::<Vec<_>>(),
            "worker runtime started"
        );
        Ok(())
    }

    /// Stop everything, provisioned pools included
    pub async fn shutdown(&self) {
        self.timers.shutdown().await;
        for pool in &self.pools {
            if let Err(e) = pool.shutdown().await {
                warn!(task_queue = %pool.task_queue(), "worker pool did not stop cleanly: {}", e);
            }
        }
        self.provisioner.shutdown().await;
        info!("worker runtime stopped");
    }
}

fn pool_config(config: &WorkerConfig, task_queue: &str) -> WorkerPoolConfig {
    WorkerPoolConfig::new(task_queue)
        .with_worker_id(format!("{}:{}", config.worker_id, task_queue))
        .with_max_concurrency(config.max_concurrent_tasks)
        .with_poll_interval(config.poll_interval)
}
