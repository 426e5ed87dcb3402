//! `msm-enrol-site`: enrol this site with MSM
//!
//! ```text
//! send-enrol ──rejected──▶ aborted
//!     │ accepted
//!     ▼
//! set-enrol (initial token)
//!     ▼
//! check-enrol (polled every minute) ──cancelled──▶ aborted
//!     │ new token
//!     ▼
//! set-enrol (site details URL, new token)
//!     ▼
//! start msm-heartbeat (abandoned) ──▶ enrolled
//! ```

use maas_durable::{
    ActivityError, ActivityOptions, ChildWorkflow, IdReusePolicy, ParentClosePolicy, RetryPolicy,
    Workflow, WorkflowAction, WorkflowError,
};
use serde_json::{json, Map, Value};
use tracing::{error, info};

use super::activities::names;
use super::client::site_details_url;
use super::heartbeat::MsmHeartbeatWorkflow;
use super::types::{
    msm_retry_policy, MsmConnectorParam, MsmEnrolParam, MsmHeartbeatParam, SendEnrolOutcome,
    HEARTBEAT_WORKFLOW_ID, MSM_POLL_INTERVAL, MSM_TIMEOUT,
};

/// Query names
pub mod queries {
    pub const IS_PENDING: &str = "is-pending";
    pub const ENROLMENT_ERROR: &str = "enrolment-error";
}

const SEND_ENROL: &str = "send-enrol";
const STORE_INITIAL: &str = "store-initial-credentials";
const CHECK_ENROL: &str = "check-enrol";
const STORE_UPGRADED: &str = "store-upgraded-credentials";

/// Terminal outcome of an enrolment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrolOutcome {
    Enrolled,
    /// MSM rejected the request or cancelled the enrolment
    Aborted,
    Failed(WorkflowError),
}

/// Enrolment state machine
pub struct MsmEnrolSiteWorkflow {
    input: MsmEnrolParam,
    pending: bool,
    /// `None` until the request is sent, empty once accepted, populated on rejection
    enrolment_error: Option<Map<String, Value>>,
    upgraded: Option<MsmConnectorParam>,
    outcome: Option<EnrolOutcome>,
}

impl MsmEnrolSiteWorkflow {
    fn msm_options() -> ActivityOptions {
        ActivityOptions::default()
            .with_start_to_close_timeout(MSM_TIMEOUT)
            .with_retry(msm_retry_policy())
    }

    fn poll_options() -> ActivityOptions {
        Self::msm_options().with_retry(RetryPolicy::fixed(MSM_POLL_INTERVAL, 0))
    }

    fn finish(&mut self, outcome: EnrolOutcome) -> Vec<WorkflowAction> {
        self.pending = false;
        let action = match &outcome {
            EnrolOutcome::Failed(error) => WorkflowAction::fail(error.clone()),
            _ => WorkflowAction::complete(Value::Null),
        };
        self.outcome = Some(outcome);
        vec![action]
    }

    fn fail(&mut self, message: String) -> Vec<WorkflowAction> {
        error!(url = %self.input.url, "{}", message);
        self.finish(EnrolOutcome::Failed(WorkflowError::new(message)))
    }

    fn on_sent(&mut self, outcome: SendEnrolOutcome) -> Vec<WorkflowAction> {
        if !outcome.sent {
            error!(url = %self.input.url, "failed to enrol, aborting");
            self.enrolment_error = Some(outcome.error.map(|e| e.to_map()).unwrap_or_default());
            return self.finish(EnrolOutcome::Aborted);
        }

        // Empty, not None: the request went out without error
        self.enrolment_error = Some(Map::new());
        vec![WorkflowAction::schedule_activity_with(
            STORE_INITIAL,
            names::SET_ENROL,
            json!(self.input.connector()),
            Self::msm_options(),
        )]
    }

    fn on_checked(&mut self, token: Option<String>) -> Vec<WorkflowAction> {
        let Some(jwt) = token else {
            error!("enrolment cancelled by MSM");
            return self.finish(EnrolOutcome::Aborted);
        };

        let url = match site_details_url(&self.input.url) {
            Ok(url) => url,
            Err(e) => return self.fail(format!("invalid enrolment URL: {e}")),
        };

        let upgraded = MsmConnectorParam { url, jwt };
        let action = WorkflowAction::schedule_activity_with(
            STORE_UPGRADED,
            names::SET_ENROL,
            json!(upgraded),
            Self::msm_options(),
        );
        self.upgraded = Some(upgraded);
        vec![action]
    }

    fn start_heartbeat(&mut self) -> Vec<WorkflowAction> {
        let Some(upgraded) = self.upgraded.clone() else {
            return self.fail("upgraded credentials missing".to_string());
        };

        let heartbeat = MsmHeartbeatParam {
            sm_url: upgraded.url,
            jwt: upgraded.jwt,
            site_name: self.input.site_name.clone(),
            site_url: self.input.site_url.clone(),
            status: None,
        };
        let child = ChildWorkflow::new(
            HEARTBEAT_WORKFLOW_ID,
            MsmHeartbeatWorkflow::TYPE,
            json!(heartbeat),
        )
        .with_id_reuse_policy(IdReusePolicy::TerminateIfRunning)
        .with_parent_close_policy(ParentClosePolicy::Abandon);

        info!(url = %self.input.url, "enrolment complete, starting heartbeat");
        let mut actions = vec![WorkflowAction::start_child(child)];
        actions.extend(self.finish(EnrolOutcome::Enrolled));
        actions
    }
}

fn decode<T: serde::de::DeserializeOwned>(activity_id: &str, result: Value) -> Result<T, String> {
    serde_json::from_value(result).map_err(|e| format!("invalid result from {activity_id}: {e}"))
}

impl Workflow for MsmEnrolSiteWorkflow {
    const TYPE: &'static str = "msm-enrol-site";
    type Input = MsmEnrolParam;
    type Output = ();

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            pending: false,
            enrolment_error: None,
            upgraded: None,
            outcome: None,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        info!(url = %self.input.url, "enrolling");
        self.pending = true;
        vec![WorkflowAction::schedule_activity_with(
            SEND_ENROL,
            names::SEND_ENROL,
            json!(self.input),
            Self::msm_options(),
        )]
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        match activity_id {
            SEND_ENROL => match decode(activity_id, result) {
                Ok(outcome) => self.on_sent(outcome),
                Err(message) => self.fail(message),
            },
            STORE_INITIAL => vec![WorkflowAction::schedule_activity_with(
                CHECK_ENROL,
                names::CHECK_ENROL,
                json!(self.input),
                Self::poll_options(),
            )],
            CHECK_ENROL => match decode(activity_id, result) {
                Ok(token) => self.on_checked(token),
                Err(message) => self.fail(message),
            },
            STORE_UPGRADED => self.start_heartbeat(),
            _ => vec![],
        }
    }

    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        error!(activity_id, error = %error, "enrolment step failed");
        self.finish(EnrolOutcome::Failed(WorkflowError::from(error)))
    }

    fn query(&self, query_type: &str) -> Option<Value> {
        match query_type {
            queries::IS_PENDING => Some(json!(self.pending)),
            queries::ENROLMENT_ERROR => Some(json!(self.enrolment_error)),
            _ => None,
        }
    }

    fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }

    fn result(&self) -> Option<Self::Output> {
        match self.outcome {
            Some(EnrolOutcome::Enrolled | EnrolOutcome::Aborted) => Some(()),
            _ => None,
        }
    }

    fn error(&self) -> Option<WorkflowError> {
        match &self.outcome {
            Some(EnrolOutcome::Failed(error)) => Some(error.clone()),
            _ => None,
        }
    }
}
