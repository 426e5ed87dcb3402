//! HTTP client for MAAS Site Manager
//!
//! Each call maps the response status through its own decision table
//! before touching the body, so the retry classification of every status
//! code is visible (and tested) in one place.

use std::time::Duration;

use maas_durable::ActivityError;
use reqwest::header::AUTHORIZATION;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, instrument};
use url::Url;

use super::types::{
    EnrolmentError, MsmEnrolParam, MsmHeartbeatParam, SendEnrolOutcome,
    HEARTBEAT_INTERVAL_HEADER, SITE_DETAILS_PATH,
};
use crate::error::error_types;

// =============================================================================
// Decision tables
// =============================================================================

/// How `msm-send-enrol` treats a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendEnrolDecision {
    /// 202: enrolment request queued on MSM
    Accepted,
    /// 404: wrong endpoint; reported to the workflow, not retried
    Rejected,
    /// Anything else: protocol or configuration fault
    Unexpected,
}

pub fn classify_send_enrol(status: StatusCode) -> SendEnrolDecision {
    match status.as_u16() {
        202 => SendEnrolDecision::Accepted,
        404 => SendEnrolDecision::Rejected,
        _ => SendEnrolDecision::Unexpected,
    }
}

/// How `msm-check-enrol` treats a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckEnrolDecision {
    /// 200: approved, body carries the new token
    Approved,
    /// 204: not approved yet; retryable
    StillPending,
    /// 404: enrolment cancelled on MSM
    Cancelled,
    Unexpected,
}

pub fn classify_check_enrol(status: StatusCode) -> CheckEnrolDecision {
    match status.as_u16() {
        200 => CheckEnrolDecision::Approved,
        204 => CheckEnrolDecision::StillPending,
        404 => CheckEnrolDecision::Cancelled,
        _ => CheckEnrolDecision::Unexpected,
    }
}

/// How `msm-send-heartbeat` treats a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatDecision {
    /// 200: next interval is in the response header
    Accepted,
    /// 401 or 404: MSM revoked this site
    Revoked,
    Unexpected,
}

pub fn classify_heartbeat(status: StatusCode) -> HeartbeatDecision {
    match status.as_u16() {
        200 => HeartbeatDecision::Accepted,
        401 | 404 => HeartbeatDecision::Revoked,
        _ => HeartbeatDecision::Unexpected,
    }
}

/// Heartbeat result telling the workflow to stop
pub const HEARTBEAT_REVOKED: i64 = -1;

// =============================================================================
// Client
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Talks to MSM on behalf of the MSM activities
#[derive(Debug, Clone)]
pub struct MsmClient {
    http: reqwest::Client,
}

impl MsmClient {
    /// Client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// Send an enrolment request
    #[instrument(skip(self, param), fields(url = %param.url))]
    pub async fn send_enrol(&self, param: &MsmEnrolParam) -> Result<SendEnrolOutcome, ActivityError> {
        debug!("attempting to enrol");
        let body = enrol_body(param)?;

        let response = self
            .http
            .post(&param.url)
            .header(AUTHORIZATION, bearer(&param.jwt))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        match classify_send_enrol(status) {
            SendEnrolDecision::Accepted => Ok(SendEnrolOutcome::accepted()),
            SendEnrolDecision::Rejected => {
                error!("enrolment URL not found, aborting");
                Ok(SendEnrolOutcome::rejected(EnrolmentError {
                    status: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or_default().to_string(),
                }))
            }
            SendEnrolDecision::Unexpected => Err(unexpected_status(status)),
        }
    }

    /// Check whether MSM approved the enrolment
    ///
    /// Returns the new token once approved, `None` if MSM cancelled the
    /// enrolment.
    #[instrument(skip(self, param), fields(url = %param.url))]
    pub async fn check_enrol(&self, param: &MsmEnrolParam) -> Result<Option<String>, ActivityError> {
        let response = self
            .http
            .get(&param.url)
            .header(AUTHORIZATION, bearer(&param.jwt))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        match classify_check_enrol(status) {
            CheckEnrolDecision::Approved => {
                let token: TokenResponse = decode_json(response).await?;
                Ok(Some(token.access_token))
            }
            CheckEnrolDecision::StillPending => Err(ActivityError::retryable(
                "waiting for MSM enrolment",
            )
            .with_type(error_types::ENROLMENT_PENDING)),
            CheckEnrolDecision::Cancelled => {
                error!("enrolment cancelled by MSM, aborting");
                Ok(None)
            }
            CheckEnrolDecision::Unexpected => Err(unexpected_status(status)),
        }
    }

    /// Report machine counts
    ///
    /// Returns the number of seconds until the next heartbeat, or
    /// [`HEARTBEAT_REVOKED`].
    #[instrument(skip(self, param), fields(url = %param.sm_url))]
    pub async fn send_heartbeat(&self, param: &MsmHeartbeatParam) -> Result<i64, ActivityError> {
        let body = serde_json::json!({
            "name": param.site_name,
            "url": param.site_url,
            "machines_by_status": param.status.unwrap_or_default(),
        });

        let response = self
            .http
            .post(&param.sm_url)
            .header(AUTHORIZATION, bearer(&param.jwt))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        match classify_heartbeat(status) {
            HeartbeatDecision::Accepted => next_interval(&response),
            HeartbeatDecision::Revoked => {
                error!(status = status.as_u16(), "enrolment cancelled by MSM, aborting");
                Ok(HEARTBEAT_REVOKED)
            }
            HeartbeatDecision::Unexpected => Err(unexpected_status(status)),
        }
    }
}

/// Rewrite the path of an enrolment URL to the site details endpoint
pub fn site_details_url(enrol_url: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(enrol_url)?;
    url.set_path(SITE_DETAILS_PATH);
    Ok(url.to_string())
}

fn bearer(jwt: &str) -> String {
    format!("bearer {jwt}")
}

fn enrol_body(param: &MsmEnrolParam) -> Result<Map<String, Value>, ActivityError> {
    let mut body = Map::new();
    body.insert("name".to_string(), Value::String(param.site_name.clone()));
    body.insert("url".to_string(), Value::String(param.site_url.clone()));
    body.insert(
        "cluster_uuid".to_string(),
        Value::String(param.cluster_uuid.clone()),
    );

    let Some(metainfo) = param.metainfo.as_deref().filter(|m| !m.is_empty()) else {
        return Ok(body);
    };

    let parsed: Value = serde_yaml::from_str(metainfo).map_err(|e| {
        ActivityError::non_retryable(format!("invalid enrolment metainfo: {e}"))
            .with_type(error_types::INVALID_METAINFO)
    })?;

    match parsed {
        Value::Null => {}
        Value::Object(extra) => body.extend(extra),
        other => {
            return Err(ActivityError::non_retryable(format!(
                "enrolment metainfo must be a mapping, got {other}"
            ))
            .with_type(error_types::INVALID_METAINFO))
        }
    }

    Ok(body)
}

fn next_interval(response: &Response) -> Result<i64, ActivityError> {
    let header = response
        .headers()
        .get(HEARTBEAT_INTERVAL_HEADER)
        .ok_or_else(|| {
            ActivityError::non_retryable(format!("missing {HEARTBEAT_INTERVAL_HEADER} header"))
                .with_type(error_types::INVALID_RESPONSE)
        })?;

    header
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            ActivityError::non_retryable(format!("invalid {HEARTBEAT_INTERVAL_HEADER} header"))
                .with_type(error_types::INVALID_RESPONSE)
        })
}

async fn decode_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ActivityError> {
    let body = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&body).map_err(|e| {
        ActivityError::non_retryable(format!("undecodable MSM response: {e}"))
            .with_type(error_types::INVALID_RESPONSE)
    })
}

fn transport_error(err: reqwest::Error) -> ActivityError {
    ActivityError::retryable(format!("MSM request failed: {err}")).with_type(error_types::TRANSPORT)
}

fn unexpected_status(status: StatusCode) -> ActivityError {
    ActivityError::non_retryable(format!(
        "got unexpected return code: HTTP {}",
        status.as_u16()
    ))
    .with_type(error_types::UNEXPECTED_STATUS)
}
