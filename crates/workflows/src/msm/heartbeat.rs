//! `msm-heartbeat`: report machine counts to MSM until revoked
//!
//! Each cycle collects machine counts, sends them, then sleeps for the
//! interval MSM returned. A negative interval ends the workflow. After
//! `cycles_per_run` cycles the workflow continues as new so its history
//! stays bounded.

use std::time::Duration;

use maas_durable::{
    ActivityError, ActivityOptions, RetryPolicy, Workflow, WorkflowAction, WorkflowError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::activities::names;
use super::types::{
    msm_retry_policy, MachineStatsByStatus, MsmHeartbeatParam, MAX_HEARTBEAT_INTERVAL, MSM_TIMEOUT,
};

/// Query names
pub mod queries {
    pub const IS_RUNNING: &str = "is-running";
}

/// Cycles per run before continuing as new
pub const DEFAULT_CYCLES_PER_RUN: u32 = 1000;

/// Input of a heartbeat run
///
/// Accepts a bare [`MsmHeartbeatParam`]; the extra fields carry state
/// across continue-as-new.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatWorkflowInput {
    #[serde(flatten)]
    pub param: MsmHeartbeatParam,

    /// Last interval MSM asked for, in seconds
    #[serde(default)]
    pub next_update: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles_per_run: Option<u32>,
}

impl From<MsmHeartbeatParam> for HeartbeatWorkflowInput {
    fn from(param: MsmHeartbeatParam) -> Self {
        Self {
            param,
            next_update: 0,
            cycles_per_run: None,
        }
    }
}

pub struct MsmHeartbeatWorkflow {
    input: HeartbeatWorkflowInput,
    running: bool,
    cycle: u32,
    next_update: i64,
    done: bool,
    failure: Option<WorkflowError>,
}

impl MsmHeartbeatWorkflow {
    fn collect_id(&self) -> String {
        format!("heartbeat-data-{}", self.cycle)
    }

    fn send_id(&self) -> String {
        format!("send-heartbeat-{}", self.cycle)
    }

    fn sleep_id(&self) -> String {
        format!("sleep-{}", self.cycle)
    }

    fn collect(&self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_activity_with(
            self.collect_id(),
            names::GET_HEARTBEAT_DATA,
            Value::Null,
            ActivityOptions::default()
                .with_start_to_close_timeout(MSM_TIMEOUT)
                .with_retry(msm_retry_policy()),
        )]
    }

    /// Retries back off at the last cadence MSM asked for
    fn send_options(&self) -> ActivityOptions {
        let interval = seconds(self.next_update.max(1));
        ActivityOptions::default()
            .with_start_to_close_timeout(MSM_TIMEOUT)
            .with_retry(RetryPolicy::fixed(interval, 0))
    }

    fn send(&self, stats: MachineStatsByStatus) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_activity_with(
            self.send_id(),
            names::SEND_HEARTBEAT,
            json!(self.input.param.with_status(stats)),
            self.send_options(),
        )]
    }

    fn after_send(&mut self, next_update: i64) -> Vec<WorkflowAction> {
        debug!(next_update, "next refresh in seconds");
        self.next_update = next_update;

        if next_update < 0 {
            info!("heartbeat revoked by MSM, stopping");
            self.running = false;
            self.done = true;
            return vec![WorkflowAction::complete(Value::Null)];
        }

        if next_update > 0 {
            return vec![WorkflowAction::timer(self.sleep_id(), seconds(next_update))];
        }

        self.next_cycle()
    }

    fn next_cycle(&mut self) -> Vec<WorkflowAction> {
        self.cycle += 1;

        let limit = self.input.cycles_per_run.unwrap_or(DEFAULT_CYCLES_PER_RUN);
        if self.cycle >= limit {
            info!(cycles = self.cycle, "continuing heartbeat as new");
            self.done = true;
            let next = HeartbeatWorkflowInput {
                param: self.input.param.clone(),
                next_update: self.next_update,
                cycles_per_run: self.input.cycles_per_run,
            };
            return vec![WorkflowAction::continue_as_new(json!(next))];
        }

        self.collect()
    }

    fn fail(&mut self, error: WorkflowError) -> Vec<WorkflowAction> {
        self.running = false;
        self.done = true;
        self.failure = Some(error.clone());
        vec![WorkflowAction::fail(error)]
    }
}

/// A positive interval from MSM, capped at [`MAX_HEARTBEAT_INTERVAL`]
fn seconds(interval: i64) -> Duration {
    let interval = Duration::from_secs(interval.unsigned_abs());
    if interval > MAX_HEARTBEAT_INTERVAL {
        warn!(?interval, cap = ?MAX_HEARTBEAT_INTERVAL, "heartbeat interval capped");
        return MAX_HEARTBEAT_INTERVAL;
    }
    interval
}

impl Workflow for MsmHeartbeatWorkflow {
    const TYPE: &'static str = "msm-heartbeat";
    type Input = HeartbeatWorkflowInput;
    type Output = ();

    fn new(input: Self::Input) -> Self {
        let next_update = input.next_update;
        Self {
            input,
            running: false,
            cycle: 0,
            next_update,
            done: false,
            failure: None,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        self.running = true;
        self.collect()
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        if activity_id == self.collect_id() {
            match serde_json::from_value::<MachineStatsByStatus>(result) {
                Ok(stats) => self.send(stats),
                Err(e) => self.fail(WorkflowError::new(format!("invalid machine counts: {e}"))),
            }
        } else if activity_id == self.send_id() {
            match serde_json::from_value::<i64>(result) {
                Ok(next_update) => self.after_send(next_update),
                Err(e) => self.fail(WorkflowError::new(format!("invalid heartbeat interval: {e}"))),
            }
        } else {
            vec![]
        }
    }

    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        error!(activity_id, error = %error, "heartbeat step failed");
        self.fail(WorkflowError::from(error))
    }

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        if timer_id == self.sleep_id() {
            self.next_cycle()
        } else {
            vec![]
        }
    }

    fn query(&self, query_type: &str) -> Option<Value> {
        match query_type {
            queries::IS_RUNNING => Some(json!(self.running)),
            _ => None,
        }
    }

    fn is_completed(&self) -> bool {
        self.done
    }

    fn result(&self) -> Option<Self::Output> {
        (self.done && self.failure.is_none()).then_some(())
    }

    fn error(&self) -> Option<WorkflowError> {
        self.failure.clone()
    }
}
