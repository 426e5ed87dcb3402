//! MSM data contracts

use std::time::Duration;

use maas_durable::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub use crate::machines::MachineStatsByStatus;

/// Name of the secret holding the connector endpoint and token
pub const MSM_SECRET: &str = "msm-connector";

/// Start-to-close budget of every MSM activity
pub const MSM_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Cadence of enrolment status polls
pub const MSM_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// First wait before a failed MSM call is retried
pub const MSM_RETRY_INITIAL: Duration = Duration::from_secs(1);

/// Longest wait between retries of a failed MSM call
pub const MSM_RETRY_MAX: Duration = Duration::from_secs(100);

/// Longest sleep between heartbeats, whatever interval MSM returns
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Retries for MSM steps that must eventually go through
pub fn msm_retry_policy() -> RetryPolicy {
    RetryPolicy::unlimited(MSM_RETRY_INITIAL, MSM_RETRY_MAX)
}

/// Response header carrying the next heartbeat interval
pub const HEARTBEAT_INTERVAL_HEADER: &str = "MSM-Heartbeat-Interval-Seconds";

/// Path of the site details endpoint the connector switches to once enrolled
pub const SITE_DETAILS_PATH: &str = "/site/v1/details";

/// Workflow id of the region's heartbeat workflow
pub const HEARTBEAT_WORKFLOW_ID: &str = "msm-heartbeat:region";

/// Workflow id used by the CLI for enrolment
pub const ENROL_WORKFLOW_ID: &str = "msm-enrol-site:region";

/// Everything needed to enrol this site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsmEnrolParam {
    pub site_name: String,
    pub site_url: String,
    /// Enrolment endpoint
    pub url: String,
    /// Enrolment token
    pub jwt: String,
    pub cluster_uuid: String,
    /// Optional YAML mapping merged into the enrolment body
    #[serde(default)]
    pub metainfo: Option<String>,
}

impl MsmEnrolParam {
    /// Connector credentials for the enrolment endpoint
    pub fn connector(&self) -> MsmConnectorParam {
        MsmConnectorParam {
            url: self.url.clone(),
            jwt: self.jwt.clone(),
        }
    }
}

/// Connector endpoint and token, as persisted in the secret store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsmConnectorParam {
    pub url: String,
    pub jwt: String,
}

impl MsmConnectorParam {
    pub fn to_secret(&self) -> Value {
        json!({ "url": self.url, "jwt": self.jwt })
    }
}

/// Input of one heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsmHeartbeatParam {
    pub sm_url: String,
    pub jwt: String,
    pub site_name: String,
    pub site_url: String,
    #[serde(default)]
    pub status: Option<MachineStatsByStatus>,
}

impl MsmHeartbeatParam {
    /// Copy carrying the given machine counts
    pub fn with_status(&self, status: MachineStatsByStatus) -> Self {
        Self {
            status: Some(status),
            ..self.clone()
        }
    }
}

/// Why MSM refused an enrolment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolmentError {
    pub status: u16,
    pub reason: String,
}

impl EnrolmentError {
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("status".to_string(), json!(self.status));
        map.insert("reason".to_string(), json!(self.reason));
        map
    }
}

/// Result of `msm-send-enrol`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEnrolOutcome {
    pub sent: bool,
    pub error: Option<EnrolmentError>,
}

impl SendEnrolOutcome {
    pub fn accepted() -> Self {
        Self {
            sent: true,
            error: None,
        }
    }

    pub fn rejected(error: EnrolmentError) -> Self {
        Self {
            sent: false,
            error: Some(error),
        }
    }
}
