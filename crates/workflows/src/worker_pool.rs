//! Worker pools for MAAS agents
//!
//! `configure_worker_pool` looks up a rack controller and starts one
//! `add_worker` child per VLAN the controller is attached to. Each
//! `add_worker` runs on the controller's own task queue and asks a
//! [`WorkerProvisioner`] to bring up a worker pool for `vlan-<id>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maas_durable::{
    Activity, ActivityContext, ActivityError, ActivityOptions, ActivityRegistry, ChildWorkflow,
    IdReusePolicy, ParentClosePolicy, RetryPolicy, WorkerPool, WorkerPoolConfig, Workflow,
    WorkflowAction, WorkflowError, WorkflowExecutor,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::CollaboratorError;
use crate::rack::{RackController, RackControllerSource};

/// Workflow types a VLAN worker may run
pub const VLAN_WORKER_WORKFLOWS: &[&str] = &["check_ip"];

const GET_RACK_CONTROLLER: &str = "get-rack-controller";

// =============================================================================
// Inputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureWorkerPoolInput {
    pub system_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRackControllerInput {
    pub system_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddWorkerInput {
    pub task_queue: String,
    pub workflows: Vec<String>,
}

/// Workflow id of the `add_worker` child for a controller VLAN
pub fn add_worker_id(system_id: &str, vlan_id: i64) -> String {
    format!("add-worker:{system_id}:task_queue:vlan-{vlan_id}")
}

// =============================================================================
// configure_worker_pool
// =============================================================================

pub struct ConfigureWorkerPoolWorkflow {
    input: ConfigureWorkerPoolInput,
    children: Option<Vec<String>>,
    failure: Option<WorkflowError>,
}

impl ConfigureWorkerPoolWorkflow {
    fn lookup_options() -> ActivityOptions {
        ActivityOptions::default()
            .with_start_to_close_timeout(Duration::from_secs(10))
            .with_schedule_to_close_timeout(Duration::from_secs(10))
            .with_retry(
                RetryPolicy::exponential()
                    .with_backoff_coefficient(2.0)
                    .with_max_attempts(5)
                    .with_initial_interval(Duration::from_secs(1))
                    .with_max_interval(Duration::from_secs(2)),
            )
    }

    fn dispatch(&mut self, controller: RackController) -> Vec<WorkflowAction> {
        let system_id = &self.input.system_id;
        let mut actions = Vec::new();
        let mut children = Vec::new();

        for vlan_id in controller.vlan_ids() {
            let workflow_id = add_worker_id(system_id, vlan_id);
            let input = AddWorkerInput {
                task_queue: format!("vlan-{vlan_id}"),
                workflows: VLAN_WORKER_WORKFLOWS.iter().map(|w| w.to_string()).collect(),
            };
            actions.push(WorkflowAction::start_child(
                ChildWorkflow::new(workflow_id.clone(), AddWorkerWorkflow::TYPE, json!(input))
                    .with_task_queue(system_id.clone())
                    .with_id_reuse_policy(IdReusePolicy::UseExisting)
                    .with_parent_close_policy(ParentClosePolicy::Abandon),
            ));
            children.push(workflow_id);
        }

        info!(%system_id, workers = children.len(), "dispatched add_worker workflows");
        actions.push(WorkflowAction::complete(json!(children)));
        self.children = Some(children);
        actions
    }

    fn fail(&mut self, error: WorkflowError) -> Vec<WorkflowAction> {
        self.failure = Some(error.clone());
        vec![WorkflowAction::fail(error)]
    }
}

impl Workflow for ConfigureWorkerPoolWorkflow {
    const TYPE: &'static str = "configure_worker_pool";
    type Input = ConfigureWorkerPoolInput;
    /// Workflow ids of the dispatched children
    type Output = Vec<String>;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            children: None,
            failure: None,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_local_activity(
            GET_RACK_CONTROLLER,
            GetRackControllerActivity::TYPE,
            json!(GetRackControllerInput {
                system_id: self.input.system_id.clone(),
            }),
            Self::lookup_options(),
        )]
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        if activity_id != GET_RACK_CONTROLLER {
            return vec![];
        }
        match serde_json::from_value::<RackController>(result) {
            Ok(controller) => self.dispatch(controller),
            Err(e) => self.fail(WorkflowError::new(format!("invalid rack controller: {e}"))),
        }
    }

    fn on_activity_failed(&mut self, _activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        self.fail(WorkflowError::from(error))
    }

    fn is_completed(&self) -> bool {
        self.children.is_some() || self.failure.is_some()
    }

    fn result(&self) -> Option<Self::Output> {
        self.children.clone()
    }

    fn error(&self) -> Option<WorkflowError> {
        self.failure.clone()
    }
}

// =============================================================================
// add_worker
// =============================================================================

pub struct AddWorkerWorkflow {
    input: AddWorkerInput,
    outcome: Option<Result<(), WorkflowError>>,
}

impl Workflow for AddWorkerWorkflow {
    const TYPE: &'static str = "add_worker";
    type Input = AddWorkerInput;
    type Output = ();

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            outcome: None,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_activity_with(
            "add-worker",
            AddWorkerActivity::TYPE,
            json!(self.input),
            ActivityOptions::default().with_start_to_close_timeout(Duration::from_secs(60)),
        )]
    }

    fn on_activity_completed(&mut self, _activity_id: &str, _result: Value) -> Vec<WorkflowAction> {
        self.outcome = Some(Ok(()));
        vec![WorkflowAction::complete(Value::Null)]
    }

    fn on_activity_failed(&mut self, _activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        let error = WorkflowError::from(error);
        self.outcome = Some(Err(error.clone()));
        vec![WorkflowAction::fail(error)]
    }

    fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }

    fn result(&self) -> Option<Self::Output> {
        self.outcome.as_ref().and_then(|o| o.clone().ok())
    }

    fn error(&self) -> Option<WorkflowError> {
        self.outcome.as_ref().and_then(|o| o.clone().err())
    }
}

// =============================================================================
// Activities
// =============================================================================

/// Local activity: read a rack controller and its interfaces
pub struct GetRackControllerActivity {
    source: Arc<dyn RackControllerSource>,
}

impl GetRackControllerActivity {
    pub fn new(source: Arc<dyn RackControllerSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Activity for GetRackControllerActivity {
    const TYPE: &'static str = GET_RACK_CONTROLLER;
    type Input = GetRackControllerInput;
    type Output = RackController;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        Ok(self.source.get_rack_controller(&input.system_id).await?)
    }
}

/// Starts worker pools on demand
#[async_trait]
pub trait WorkerProvisioner: Send + Sync {
    /// Ensure a worker pool serves `task_queue`, limited to `workflow_types`
    ///
    /// Returns `true` if a new pool was started.
    async fn ensure_worker(
        &self,
        task_queue: &str,
        workflow_types: &[String],
    ) -> Result<bool, CollaboratorError>;
}

pub struct AddWorkerActivity {
    provisioner: Arc<dyn WorkerProvisioner>,
}

impl AddWorkerActivity {
    pub fn new(provisioner: Arc<dyn WorkerProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Activity for AddWorkerActivity {
    const TYPE: &'static str = "add-worker";
    type Input = AddWorkerInput;
    type Output = ();

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let started = self
            .provisioner
            .ensure_worker(&input.task_queue, &input.workflows)
            .await?;
        info!(task_queue = %input.task_queue, started, "worker ensured");
        Ok(())
    }
}

// =============================================================================
// In-process provisioner
// =============================================================================

/// Provisions [`WorkerPool`]s inside this process
pub struct PoolProvisioner {
    executor: Arc<WorkflowExecutor>,
    activities: ActivityRegistry,
    template: WorkerPoolConfig,
    pools: Mutex<HashMap<String, Arc<WorkerPool>>>,
}

impl PoolProvisioner {
    /// `template` supplies everything but the task queue and allow-list
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        activities: ActivityRegistry,
        template: WorkerPoolConfig,
    ) -> Self {
        Self {
            executor,
            activities,
            template,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Task queues with a running pool, sorted
    pub async fn task_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.pools.lock().await.keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Stop every provisioned pool
    pub async fn shutdown(&self) {
        let pools: Vec<_> = self.pools.lock().await.drain().collect();
        for (task_queue, pool) in pools {
            if let Err(e) = pool.shutdown().await {
                warn!(%task_queue, "worker pool did not stop cleanly: {}", e);
            }
        }
    }
}

#[async_trait]
impl WorkerProvisioner for PoolProvisioner {
    async fn ensure_worker(
        &self,
        task_queue: &str,
        workflow_types: &[String],
    ) -> Result<bool, CollaboratorError> {
        let mut pools = self.pools.lock().await;
        if pools.contains_key(task_queue) {
            return Ok(false);
        }

        let config = WorkerPoolConfig {
            worker_id: format!("{}:{}", self.template.worker_id, task_queue),
            task_queue: task_queue.to_string(),
            ..self.template.clone()
        }
        .with_workflow_types(workflow_types.to_vec());

        let pool = Arc::new(WorkerPool::new(
            self.executor.clone(),
            self.activities.clone(),
            config,
        ));
        pool.start()
            .await
            .map_err(|e| CollaboratorError::Other(e.to_string()))?;

        pools.insert(task_queue.to_string(), pool);
        Ok(true)
    }
}

/// Register the activities of the worker-pool workflows
pub fn register_worker_pool_activities(
    registry: &mut ActivityRegistry,
    provisioner: Arc<dyn WorkerProvisioner>,
) {
    registry.register(AddWorkerActivity::new(provisioner));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rack::{Interface, Vlan};

    fn controller(vlans: &[i64]) -> RackController {
        RackController {
            system_id: "abc123".into(),
            interface_set: vlans
                .iter()
                .enumerate()
                .map(|(i, id)| Interface {
                    name: format!("eth{i}"),
                    vlan: Some(Vlan { id: *id }),
                })
                .collect(),
        }
    }

    #[test]
    fn test_lookup_is_local_with_tight_budget() {
        let mut workflow = ConfigureWorkerPoolWorkflow::new(ConfigureWorkerPoolInput {
            system_id: "abc123".into(),
        });

        match &workflow.on_start()[..] {
            [WorkflowAction::ScheduleLocalActivity {
                activity_type,
                options,
                input,
                ..
            }] => {
                assert_eq!(activity_type, GET_RACK_CONTROLLER);
                assert_eq!(input, &json!({"system_id": "abc123"}));
                assert_eq!(options.start_to_close_timeout, Duration::from_secs(10));
                assert_eq!(options.schedule_to_close_timeout, Some(Duration::from_secs(10)));
                assert_eq!(options.retry_policy.max_attempts, 5);
                assert_eq!(options.retry_policy.max_interval, Duration::from_secs(2));
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn test_one_child_per_distinct_vlan() {
        let mut workflow = ConfigureWorkerPoolWorkflow::new(ConfigureWorkerPoolInput {
            system_id: "abc123".into(),
        });
        workflow.on_start();

        let actions =
            workflow.on_activity_completed(GET_RACK_CONTROLLER, json!(controller(&[5, 5, 7])));

        let children: Vec<&ChildWorkflow> = actions
            .iter()
            .filter_map(|a| match a {
                WorkflowAction::StartChildWorkflow(child) => Some(child),
                _ => None,
            })
            .collect();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].workflow_id, "add-worker:abc123:task_queue:vlan-5");
        assert_eq!(children[1].workflow_id, "add-worker:abc123:task_queue:vlan-7");
        for child in &children {
            assert_eq!(child.workflow_type, "add_worker");
            assert_eq!(child.task_queue.as_deref(), Some("abc123"));
            assert_eq!(child.parent_close_policy, ParentClosePolicy::Abandon);
            assert_eq!(child.id_reuse_policy, IdReusePolicy::UseExisting);
        }
        assert_eq!(
            children[1].input,
            json!({"task_queue": "vlan-7", "workflows": ["check_ip"]})
        );
        assert!(matches!(
            actions.last(),
            Some(WorkflowAction::CompleteWorkflow { .. })
        ));
    }

    #[test]
    fn test_no_vlans_completes_without_children() {
        let mut workflow = ConfigureWorkerPoolWorkflow::new(ConfigureWorkerPoolInput {
            system_id: "abc123".into(),
        });

        let actions = workflow.on_activity_completed(GET_RACK_CONTROLLER, json!(controller(&[])));

        assert!(matches!(&actions[..], [WorkflowAction::CompleteWorkflow { .. }]));
        assert_eq!(workflow.result(), Some(vec![]));
    }
}
