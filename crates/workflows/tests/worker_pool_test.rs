//! `configure_worker_pool` and `add_worker` over the in-memory store

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maas_durable::prelude::*;
use maas_workflows::msm::MsmClient;
use maas_workflows::rack::{InMemoryRackControllerSource, Interface, RackController, Vlan};
use maas_workflows::runtime::{base_activities, build_executor, Collaborators};
use maas_workflows::worker_pool::{add_worker_id, register_worker_pool_activities};
use maas_workflows::{
    CollaboratorError, ConfigureWorkerPoolInput, ConfigureWorkerPoolWorkflow, PoolProvisioner,
    WorkerProvisioner,
};
use parking_lot::Mutex;
use serde_json::json;

/// Records every request instead of starting pools
#[derive(Default)]
struct RecordingProvisioner {
    requests: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl WorkerProvisioner for RecordingProvisioner {
    async fn ensure_worker(
        &self,
        task_queue: &str,
        workflow_types: &[String],
    ) -> Result<bool, CollaboratorError> {
        let mut requests = self.requests.lock();
        let new = !requests.iter().any(|(q, _)| q == task_queue);
        requests.push((task_queue.to_string(), workflow_types.to_vec()));
        Ok(new)
    }
}

fn controller(system_id: &str, vlans: &[i64]) -> RackController {
    RackController {
        system_id: system_id.to_string(),
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

fn collaborators(racks: Arc<InMemoryRackControllerSource>) -> Collaborators {
    Collaborators::in_memory(
        racks,
        Arc::new(MsmClient::new(Duration::from_secs(1)).expect("should build client")),
    )
}

async fn configure(executor: &WorkflowExecutor, system_id: &str) -> StartedRun {
    executor
        .start_workflow::<ConfigureWorkerPoolWorkflow>(
            StartOptions::new(format!("configure-worker-pool:{system_id}")),
            ConfigureWorkerPoolInput {
                system_id: system_id.to_string(),
            },
        )
        .await
        .expect("should start configure_worker_pool")
}

#[test_log::test(tokio::test)]
async fn test_one_add_worker_per_distinct_vlan() {
    let racks = Arc::new(InMemoryRackControllerSource::new());
    racks.insert(controller("abc123", &[5, 5, 7]));
    let collaborators = collaborators(racks);
    let executor = Arc::new(build_executor(&collaborators, "region"));

    let provisioner = Arc::new(RecordingProvisioner::default());
    let mut activities = base_activities(&collaborators);
    register_worker_pool_activities(&mut activities, provisioner.clone());
    let rack_pool = WorkerPool::new(
        executor.clone(),
        activities,
        WorkerPoolConfig::new("abc123").with_worker_id("rack-agent"),
    );

    let run = configure(&executor, "abc123").await;

    let info = executor
        .describe_run(run.run_id)
        .await
        .expect("should describe run");
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert_eq!(
        info.result,
        Some(json!([
            "add-worker:abc123:task_queue:vlan-5",
            "add-worker:abc123:task_queue:vlan-7",
        ]))
    );

    for vlan in [5, 7] {
        let child = executor
            .describe_workflow(&add_worker_id("abc123", vlan))
            .await
            .expect("should describe child");
        assert_eq!(child.workflow_type, "add_worker");
        assert_eq!(child.task_queue, "abc123");
        assert_eq!(child.parent_run_id, Some(run.run_id));
        assert_eq!(child.parent_close_policy, ParentClosePolicy::Abandon);
    }

    // Both add-worker tasks wait on the controller's own queue
    assert_eq!(rack_pool.run_once().await.expect("should run"), 2);

    let mut requests = provisioner.requests.lock().clone();
    requests.sort();
    assert_eq!(
        requests,
        vec![
            ("vlan-5".to_string(), vec!["check_ip".to_string()]),
            ("vlan-7".to_string(), vec!["check_ip".to_string()]),
        ]
    );
    for vlan in [5, 7] {
        let child = executor
            .describe_workflow(&add_worker_id("abc123", vlan))
            .await
            .expect("should describe child");
        assert_eq!(child.status, WorkflowStatus::Completed);
    }
}

#[test_log::test(tokio::test)]
async fn test_unknown_controller_fails_run() {
    let collaborators = collaborators(Arc::new(InMemoryRackControllerSource::new()));
    let executor = build_executor(&collaborators, "region");

    let run = configure(&executor, "missing").await;

    let info = executor
        .describe_run(run.run_id)
        .await
        .expect("should describe run");
    assert_eq!(info.status, WorkflowStatus::Failed);
    assert_eq!(info.error.and_then(|e| e.code), Some("NOT_FOUND".to_string()));
}

#[test_log::test(tokio::test)]
async fn test_pool_provisioner_starts_each_queue_once() {
    let collaborators = collaborators(Arc::new(InMemoryRackControllerSource::new()));
    let executor = Arc::new(build_executor(&collaborators, "region"));
    let provisioner = PoolProvisioner::new(
        executor,
        base_activities(&collaborators),
        WorkerPoolConfig::new("").with_worker_id("region-1"),
    );
    let workflows = vec!["check_ip".to_string()];

    assert!(provisioner
        .ensure_worker("vlan-5", &workflows)
        .await
        .expect("should start pool"));
    assert!(!provisioner
        .ensure_worker("vlan-5", &workflows)
        .await
        .expect("should reuse pool"));
    assert!(provisioner
        .ensure_worker("vlan-7", &workflows)
        .await
        .expect("should start pool"));

    assert_eq!(provisioner.task_queues().await, vec!["vlan-5", "vlan-7"]);

    provisioner.shutdown().await;
    assert!(provisioner.task_queues().await.is_empty());
}
