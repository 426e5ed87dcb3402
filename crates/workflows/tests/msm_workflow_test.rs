//! MSM enrolment and heartbeat against a mock MSM
//!
//! Runs the real activities on a worker pool over the in-memory store,
//! stepping the pool and the timer service by hand. Faults are injected by
//! wrapping the machine source and the workflow store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maas_durable::persistence::{
    EffectRecord, HeartbeatResponse, HistoryAppend, NewWorkflow, TaskFailureOutcome, TaskFilter,
    TimerRecord,
};
use maas_durable::prelude::*;
use maas_workflows::error::CollaboratorError;
use maas_workflows::machines::{node_status, InMemoryMachineStatusSource, MachineStatusSource};
use maas_workflows::msm::enrol::queries as enrol_queries;
use maas_workflows::msm::heartbeat::queries as heartbeat_queries;
use maas_workflows::msm::types::{ENROL_WORKFLOW_ID, HEARTBEAT_INTERVAL_HEADER, HEARTBEAT_WORKFLOW_ID};
use maas_workflows::msm::{
    MsmClient, MsmEnrolParam, MsmEnrolSiteWorkflow, MsmHeartbeatParam, MsmHeartbeatWorkflow,
};
use maas_workflows::rack::InMemoryRackControllerSource;
use maas_workflows::runtime::{base_activities, build_executor, Collaborators};
use maas_workflows::secrets::InMemorySecretStore;
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ENROL_PATH: &str = "/site/v1/enrol";

/// Machine counts that fail a number of times before succeeding
struct FlakyMachines {
    inner: Arc<InMemoryMachineStatusSource>,
    failures_left: AtomicU32,
}

#[async_trait]
impl MachineStatusSource for FlakyMachines {
    async fn count_by_status(&self) -> Result<Vec<(i32, i64)>, CollaboratorError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CollaboratorError::Other("database unavailable".to_string()));
        }
        self.inner.count_by_status().await
    }
}

/// Store whose first run creation for one workflow id is lost
struct FlakyStore {
    inner: Arc<InMemoryWorkflowEventStore>,
    lost_create: Mutex<Option<&'static str>>,
}

#[async_trait]
impl WorkflowEventStore for FlakyStore {
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<(), StoreError> {
        {
            let mut lost = self.lost_create.lock();
            if *lost == Some(workflow.workflow_id.as_str()) {
                lost.take();
                return Err(StoreError::Database("connection reset".to_string()));
            }
        }
        self.inner.create_workflow(workflow).await
    }

    async fn get_workflow_info(&self, run_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        self.inner.get_workflow_info(run_id).await
    }

    async fn find_current_run(&self, workflow_id: &str) -> Result<Option<WorkflowInfo>, StoreError> {
        self.inner.find_current_run(workflow_id).await
    }

    async fn list_children(&self, parent_run_id: Uuid) -> Result<Vec<WorkflowInfo>, StoreError> {
        self.inner.list_children(parent_run_id).await
    }

    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: i32,
        append: HistoryAppend,
    ) -> Result<i32, StoreError> {
        self.inner.append_events(run_id, expected_sequence, append).await
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<(i32, WorkflowEvent)>, StoreError> {
        self.inner.load_events(run_id).await
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        filter: &TaskFilter,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        self.inner.claim_tasks(worker_id, filter, max_tasks).await
    }

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError> {
        self.inner.heartbeat_task(task_id, worker_id, details).await
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.inner.complete_task(task_id, result).await
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        self.inner.fail_task(task_id, error).await
    }

    async fn cancel_tasks(&self, run_id: Uuid) -> Result<u64, StoreError> {
        self.inner.cancel_tasks(run_id).await
    }

    async fn reclaim_stale_tasks(&self, stale: Duration) -> Result<Vec<Uuid>, StoreError> {
        self.inner.reclaim_stale_tasks(stale).await
    }

    async fn claim_due_timers(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError> {
        self.inner.claim_due_timers(now, lease, limit).await
    }

    async fn delete_timer(&self, run_id: Uuid, timer_id: &str) -> Result<(), StoreError> {
        self.inner.delete_timer(run_id, timer_id).await
    }

    async fn cancel_timers(&self, run_id: Uuid) -> Result<u64, StoreError> {
        self.inner.cancel_timers(run_id).await
    }

    async fn claim_stale_effects(
        &self,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<EffectRecord>, StoreError> {
        self.inner.claim_stale_effects(stale_after, limit).await
    }

    async fn complete_effect(&self, run_id: Uuid, key: &str) -> Result<(), StoreError> {
        self.inner.complete_effect(run_id, key).await
    }
}

#[derive(Default)]
struct Faults {
    machine_failures: u32,
    lost_create: Option<&'static str>,
}

struct Harness {
    server: MockServer,
    store: Arc<InMemoryWorkflowEventStore>,
    secrets: Arc<InMemorySecretStore>,
    machines: Arc<InMemoryMachineStatusSource>,
    executor: Arc<WorkflowExecutor>,
    pool: WorkerPool,
    timers: TimerService,
}

impl Harness {
    async fn new() -> Self {
        Self::with_faults(Faults::default()).await
    }

    async fn with_faults(faults: Faults) -> Self {
        let server = MockServer::start().await;
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let secrets = Arc::new(InMemorySecretStore::new());
        let machines = Arc::new(InMemoryMachineStatusSource::new(vec![
            node_status::ALLOCATED,
            node_status::DEPLOYED,
            node_status::READY,
            node_status::READY,
        ]));

        let collaborators = Collaborators {
            store: Arc::new(FlakyStore {
                inner: store.clone(),
                lost_create: Mutex::new(faults.lost_create),
            }),
            secrets: secrets.clone(),
            machines: Arc::new(FlakyMachines {
                inner: machines.clone(),
                failures_left: AtomicU32::new(faults.machine_failures),
            }),
            racks: Arc::new(InMemoryRackControllerSource::new()),
            msm: Arc::new(MsmClient::new(Duration::from_secs(5)).expect("should build client")),
        };

        let executor = Arc::new(build_executor(&collaborators, "region"));
        let pool = WorkerPool::new(
            executor.clone(),
            base_activities(&collaborators),
            WorkerPoolConfig::new("region").with_worker_id("msm-test"),
        );
        let timers = TimerService::new(
            executor.clone(),
            TimerServiceConfig {
                effect_stale_after: Duration::ZERO,
                ..Default::default()
            },
        );

        Self {
            server,
            store,
            secrets,
            machines,
            executor,
            pool,
            timers,
        }
    }

    fn enrol_param(&self) -> MsmEnrolParam {
        MsmEnrolParam {
            site_name: "site-a".to_string(),
            site_url: "https://maas.example.com".to_string(),
            url: format!("{}{}", self.server.uri(), ENROL_PATH),
            jwt: "enrol-token".to_string(),
            cluster_uuid: "cluster-1".to_string(),
            metainfo: Some("country: DE\ncity: Berlin\n".to_string()),
        }
    }

    async fn start_enrolment(&self) -> StartedRun {
        self.executor
            .start_workflow::<MsmEnrolSiteWorkflow>(
                StartOptions::new(ENROL_WORKFLOW_ID),
                self.enrol_param(),
            )
            .await
            .expect("should start enrolment")
    }

    async fn step(&self) -> usize {
        self.pool.run_once().await.expect("should run tasks")
    }

    async fn status(&self, run: &StartedRun) -> WorkflowStatus {
        self.executor
            .describe_run(run.run_id)
            .await
            .expect("should describe run")
            .status
    }

    async fn query(&self, workflow_id: &str, query_type: &str) -> serde_json::Value {
        self.executor
            .query_workflow(workflow_id, query_type)
            .await
            .expect("should answer query")
    }
}

async fn mount_send_enrol(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path(ENROL_PATH))
        .and(header("authorization", "bearer enrol-token"))
        .and(body_partial_json(json!({
            "name": "site-a",
            "url": "https://maas.example.com",
            "cluster_uuid": "cluster-1",
            "country": "DE",
            "city": "Berlin",
        })))
        .respond_with(ResponseTemplate::new(status))
        .expect(1)
        .mount(server)
        .await;
}

// =============================================================================
// Enrolment
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_rejected_enrolment_writes_no_secret() {
    let h = Harness::new().await;
    mount_send_enrol(&h.server, 404).await;

    let run = h.start_enrolment().await;
    assert_eq!(h.query(ENROL_WORKFLOW_ID, enrol_queries::IS_PENDING).await, json!(true));

    assert_eq!(h.step().await, 1);

    assert_eq!(h.status(&run).await, WorkflowStatus::Completed);
    assert_eq!(h.secrets.writes(), 0);
    assert_eq!(h.query(ENROL_WORKFLOW_ID, enrol_queries::IS_PENDING).await, json!(false));
    assert_eq!(
        h.query(ENROL_WORKFLOW_ID, enrol_queries::ENROLMENT_ERROR).await,
        json!({"status": 404, "reason": "Not Found"})
    );
    assert!(h.store.runs_for(HEARTBEAT_WORKFLOW_ID).is_empty());
}

#[test_log::test(tokio::test)]
async fn test_accepted_enrolment_stores_credentials_and_starts_heartbeat() {
    let h = Harness::new().await;
    mount_send_enrol(&h.server, 202).await;
    Mock::given(method("GET"))
        .and(path(ENROL_PATH))
        .respond_with(ResponseTemplate::new(204))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(ENROL_PATH))
        .and(header("authorization", "bearer enrol-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"access_token": "site-token"})),
        )
        .mount(&h.server)
        .await;

    let run = h.start_enrolment().await;

    // send-enrol, store-initial-credentials, first check-enrol
    for _ in 0..3 {
        assert_eq!(h.step().await, 1);
    }
    assert_eq!(h.secrets.writes(), 1);
    assert_eq!(h.query(ENROL_WORKFLOW_ID, enrol_queries::IS_PENDING).await, json!(true));
    assert_eq!(
        h.query(ENROL_WORKFLOW_ID, enrol_queries::ENROLMENT_ERROR).await,
        json!({})
    );

    // Pending enrolment is polled again after the poll interval
    assert_eq!(h.step().await, 0);
    assert_eq!(h.store.expedite_retries(), 1);

    // check-enrol approved, store-upgraded-credentials
    assert_eq!(h.step().await, 1);
    assert_eq!(h.step().await, 1);

    assert_eq!(h.status(&run).await, WorkflowStatus::Completed);
    assert_eq!(h.query(ENROL_WORKFLOW_ID, enrol_queries::IS_PENDING).await, json!(false));
    assert_eq!(h.secrets.writes(), 2);
    assert_eq!(
        h.secrets.snapshot().get("global/msm-connector"),
        Some(&json!({
            "url": format!("{}/site/v1/details", h.server.uri()),
            "jwt": "site-token",
        }))
    );

    let heartbeats = h.store.runs_for(HEARTBEAT_WORKFLOW_ID);
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].workflow_type, MsmHeartbeatWorkflow::TYPE);
    assert_eq!(heartbeats[0].parent_run_id, Some(run.run_id));
    assert_eq!(heartbeats[0].parent_close_policy, ParentClosePolicy::Abandon);
    assert_eq!(heartbeats[0].status, WorkflowStatus::Running);
    assert_eq!(heartbeats[0].input["jwt"], "site-token");
}

#[test_log::test(tokio::test)]
async fn test_cancelled_enrolment_starts_no_heartbeat() {
    let h = Harness::new().await;
    mount_send_enrol(&h.server, 202).await;
    Mock::given(method("GET"))
        .and(path(ENROL_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h.server)
        .await;

    let run = h.start_enrolment().await;
    for _ in 0..3 {
        assert_eq!(h.step().await, 1);
    }

    assert_eq!(h.status(&run).await, WorkflowStatus::Completed);
    assert_eq!(h.secrets.writes(), 1);
    assert!(h.store.runs_for(HEARTBEAT_WORKFLOW_ID).is_empty());
    assert_eq!(h.query(ENROL_WORKFLOW_ID, enrol_queries::IS_PENDING).await, json!(false));
}

#[test_log::test(tokio::test)]
async fn test_unexpected_status_fails_enrolment() {
    let h = Harness::new().await;
    mount_send_enrol(&h.server, 500).await;

    let run = h.start_enrolment().await;
    assert_eq!(h.step().await, 1);

    let info = h
        .executor
        .describe_run(run.run_id)
        .await
        .expect("should describe run");
    assert_eq!(info.status, WorkflowStatus::Failed);
    assert_eq!(
        info.error.map(|e| e.message),
        Some("got unexpected return code: HTTP 500".to_string())
    );
    assert_eq!(h.query(ENROL_WORKFLOW_ID, enrol_queries::IS_PENDING).await, json!(false));
    assert_eq!(h.secrets.writes(), 0);
}

#[test_log::test(tokio::test)]
async fn test_lost_heartbeat_start_is_recovered() {
    let h = Harness::with_faults(Faults {
        lost_create: Some(HEARTBEAT_WORKFLOW_ID),
        ..Default::default()
    })
    .await;
    mount_send_enrol(&h.server, 202).await;
    Mock::given(method("GET"))
        .and(path(ENROL_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "site-token"})))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/site/v1/details"))
        .and(header("authorization", "bearer site-token"))
        .respond_with(ResponseTemplate::new(200).insert_header(HEARTBEAT_INTERVAL_HEADER, "30"))
        .expect(1)
        .mount(&h.server)
        .await;

    let run = h.start_enrolment().await;
    // send-enrol, store-initial-credentials, check-enrol, store-upgraded-credentials
    for _ in 0..4 {
        assert_eq!(h.step().await, 1);
    }

    assert_eq!(h.status(&run).await, WorkflowStatus::Completed);
    assert!(h.store.runs_for(HEARTBEAT_WORKFLOW_ID).is_empty());
    assert_eq!(h.store.pending_effects().len(), 1);

    assert_eq!(h.timers.recover_effects().await.expect("should recover"), 1);

    let heartbeats = h.store.runs_for(HEARTBEAT_WORKFLOW_ID);
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].status, WorkflowStatus::Running);
    assert_eq!(heartbeats[0].parent_run_id, Some(run.run_id));
    assert_eq!(heartbeats[0].input["jwt"], "site-token");
    assert!(h.store.pending_effects().is_empty());

    // The recovered heartbeat reports like any other
    assert_eq!(h.step().await, 1);
    assert_eq!(h.step().await, 1);
    assert_eq!(h.store.pending_timers().len(), 1);
}

// =============================================================================
// Heartbeat
// =============================================================================

fn heartbeat_param(server: &MockServer) -> MsmHeartbeatParam {
    MsmHeartbeatParam {
        sm_url: format!("{}/site/v1/details", server.uri()),
        jwt: "site-token".to_string(),
        site_name: "site-a".to_string(),
        site_url: "https://maas.example.com".to_string(),
        status: None,
    }
}

#[test_log::test(tokio::test)]
async fn test_heartbeat_runs_until_revoked() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/site/v1/details"))
        .and(header("authorization", "bearer site-token"))
        .and(body_partial_json(json!({
            "name": "site-a",
            "machines_by_status": {"allocated": 1, "deployed": 1, "ready": 2, "error": 0, "other": 0},
        })))
        .respond_with(ResponseTemplate::new(200).insert_header(HEARTBEAT_INTERVAL_HEADER, "30"))
        .up_to_n_times(2)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/site/v1/details"))
        .respond_with(ResponseTemplate::new(200).insert_header(HEARTBEAT_INTERVAL_HEADER, "-1"))
        .mount(&h.server)
        .await;

    let run = h
        .executor
        .start_workflow::<MsmHeartbeatWorkflow>(
            StartOptions::new(HEARTBEAT_WORKFLOW_ID),
            heartbeat_param(&h.server).into(),
        )
        .await
        .expect("should start heartbeat");
    assert_eq!(
        h.query(HEARTBEAT_WORKFLOW_ID, heartbeat_queries::IS_RUNNING).await,
        json!(true)
    );

    for cycle in 0..3 {
        // collect, then send
        assert_eq!(h.step().await, 1, "collect in cycle {cycle}");
        assert_eq!(h.step().await, 1, "send in cycle {cycle}");
        if cycle < 2 {
            assert_eq!(h.step().await, 0, "sleeping in cycle {cycle}");
            let fired = h
                .timers
                .fire_due(Utc::now() + chrono::Duration::seconds(31))
                .await
                .expect("should fire timers");
            assert_eq!(fired, 1);
        }
    }

    assert_eq!(h.machines.calls(), 3);
    let requests = h.server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 3);

    let history = h.executor.history(run.run_id).await.expect("should load history");
    let sleeps = history
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::TimerStarted { .. }))
        .count();
    assert_eq!(sleeps, 2);

    assert_eq!(h.status(&run).await, WorkflowStatus::Completed);
    assert_eq!(
        h.query(HEARTBEAT_WORKFLOW_ID, heartbeat_queries::IS_RUNNING).await,
        json!(false)
    );
    assert!(h.store.pending_timers().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_heartbeat_revoked_by_status_code() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/site/v1/details"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&h.server)
        .await;

    let run = h
        .executor
        .start_workflow::<MsmHeartbeatWorkflow>(
            StartOptions::new(HEARTBEAT_WORKFLOW_ID),
            heartbeat_param(&h.server).into(),
        )
        .await
        .expect("should start heartbeat");

    assert_eq!(h.step().await, 1);
    assert_eq!(h.step().await, 1);

    assert_eq!(h.status(&run).await, WorkflowStatus::Completed);
    assert_eq!(h.machines.calls(), 1);
}

#[test_log::test(tokio::test)]
async fn test_enrolment_replaces_running_heartbeat() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/site/v1/details"))
        .respond_with(ResponseTemplate::new(200).insert_header(HEARTBEAT_INTERVAL_HEADER, "3600"))
        .mount(&h.server)
        .await;
    let previous = h
        .executor
        .start_workflow::<MsmHeartbeatWorkflow>(
            StartOptions::new(HEARTBEAT_WORKFLOW_ID),
            heartbeat_param(&h.server).into(),
        )
        .await
        .expect("should start heartbeat");

    mount_send_enrol(&h.server, 202).await;
    Mock::given(method("GET"))
        .and(path(ENROL_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "fresh"})))
        .mount(&h.server)
        .await;

    h.start_enrolment().await;
    // The old heartbeat shares the queue and goes to sleep meanwhile
    let mut ran = 0;
    for _ in 0..10 {
        ran += h.step().await;
        let runs = h.store.runs_for(HEARTBEAT_WORKFLOW_ID);
        if runs.len() == 2 {
            break;
        }
    }
    assert!(ran >= 4);

    let previous = h
        .executor
        .describe_run(previous.run_id)
        .await
        .expect("should describe previous run");
    assert_eq!(previous.status, WorkflowStatus::Terminated);

    let current = h
        .executor
        .describe_workflow(HEARTBEAT_WORKFLOW_ID)
        .await
        .expect("should describe heartbeat");
    assert_eq!(current.status, WorkflowStatus::Running);
    assert_eq!(current.input["jwt"], "fresh");
}

#[test_log::test(tokio::test)]
async fn test_heartbeat_outlasts_failing_machine_counts() {
    let h = Harness::with_faults(Faults {
        machine_failures: 3,
        ..Default::default()
    })
    .await;
    Mock::given(method("POST"))
        .and(path("/site/v1/details"))
        .respond_with(ResponseTemplate::new(200).insert_header(HEARTBEAT_INTERVAL_HEADER, "30"))
        .expect(1)
        .mount(&h.server)
        .await;

    let run = h
        .executor
        .start_workflow::<MsmHeartbeatWorkflow>(
            StartOptions::new(HEARTBEAT_WORKFLOW_ID),
            heartbeat_param(&h.server).into(),
        )
        .await
        .expect("should start heartbeat");

    for attempt in 1..=3 {
        assert_eq!(h.step().await, 1, "failed collect {attempt}");
        assert_eq!(h.step().await, 0, "backing off after collect {attempt}");
        assert_eq!(h.status(&run).await, WorkflowStatus::Running);
        assert_eq!(h.store.expedite_retries(), 1);
    }

    // collect succeeds, then send
    assert_eq!(h.step().await, 1);
    assert_eq!(h.step().await, 1);

    assert_eq!(h.machines.calls(), 1);
    assert_eq!(h.status(&run).await, WorkflowStatus::Running);
    assert_eq!(
        h.query(HEARTBEAT_WORKFLOW_ID, heartbeat_queries::IS_RUNNING).await,
        json!(true)
    );
    assert_eq!(h.store.pending_timers().len(), 1);
}
