//! Rack controller lookups

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::form_urlencoded::byte_serialize;
use url::Url;
use uuid::Uuid;

use crate::error::CollaboratorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vlan {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    #[serde(default)]
    pub name: String,

    /// Unset for interfaces that are not connected
    #[serde(default)]
    pub vlan: Option<Vlan>,
}

/// The parts of a rack controller the worker-pool workflow reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RackController {
    pub system_id: String,

    #[serde(default)]
    pub interface_set: Vec<Interface>,
}

impl RackController {
    /// Distinct VLAN ids across all interfaces, ascending
    pub fn vlan_ids(&self) -> BTreeSet<i64> {
        self.interface_set
            .iter()
            .filter_map(|iface| iface.vlan.as_ref().map(|vlan| vlan.id))
            .collect()
    }
}

#[async_trait]
pub trait RackControllerSource: Send + Sync {
    async fn get_rack_controller(&self, system_id: &str)
        -> Result<RackController, CollaboratorError>;
}

// =============================================================================
// API key
// =============================================================================

/// MAAS API key, `<consumer_key>:<token_key>:<token_secret>`
///
/// Requests are signed with OAuth 1.0 PLAINTEXT, as the MAAS CLI does.
#[derive(Clone, PartialEq, Eq)]
pub struct MaasApiKey {
    pub consumer_key: String,
    pub token_key: String,
    token_secret: String,
}

#[derive(Debug, thiserror::Error)]
#[error("expected <consumer_key>:<token_key>:<token_secret>")]
pub struct InvalidApiKey;

impl FromStr for MaasApiKey {
    type Err = InvalidApiKey;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.trim().split(':').collect();
        match parts[..] {
            [consumer_key, token_key, token_secret]
                if parts.iter().all(|part| !part.is_empty()) =>
            {
                Ok(Self {
                    consumer_key: consumer_key.to_string(),
                    token_key: token_key.to_string(),
                    token_secret: token_secret.to_string(),
                })
            }
            _ => Err(InvalidApiKey),
        }
    }
}

impl fmt::Debug for MaasApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaasApiKey")
            .field("consumer_key", &self.consumer_key)
            .field("token_key", &self.token_key)
            .field("token_secret", &"<redacted>")
            .finish()
    }
}

impl MaasApiKey {
    /// `Authorization` header value for one request
    pub fn authorization(&self, nonce: &str, timestamp: i64) -> String {
        // The consumer secret is always empty
        let signature = format!("&{}", self.token_secret);
        let timestamp = timestamp.to_string();
        let params = [
            ("oauth_version", "1.0"),
            ("oauth_signature_method", "PLAINTEXT"),
            ("oauth_consumer_key", self.consumer_key.as_str()),
            ("oauth_token", self.token_key.as_str()),
            ("oauth_signature", signature.as_str()),
            ("oauth_nonce", nonce),
            ("oauth_timestamp", timestamp.as_str()),
        ];

        let fields: Vec<String> = params
            .iter()
            .map(|(name, value)| {
                let value: String = byte_serialize(value.as_bytes()).collect();
                format!("{name}=\"{value}\"")
            })
            .collect();
        format!("OAuth realm=\"\", {}", fields.join(", "))
    }
}

// =============================================================================
// HTTP source
// =============================================================================

/// Reads rack controllers from the MAAS REST API
#[derive(Clone)]
pub struct HttpRackControllerSource {
    base_url: Url,
    http: reqwest::Client,
    api_key: Option<MaasApiKey>,
}

impl HttpRackControllerSource {
    /// `base_url` is the MAAS root, e.g. `http://localhost:5240/MAAS/`
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, CollaboratorError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: with_trailing_slash(base_url),
            http,
            api_key: None,
        })
    }

    /// Sign every request with `api_key`
    pub fn with_api_key(mut self, api_key: Option<MaasApiKey>) -> Self {
        self.api_key = api_key;
        self
    }

    fn controller_url(&self, system_id: &str) -> Result<Url, CollaboratorError> {
        Ok(self
            .base_url
            .join(&format!("api/2.0/rackcontrollers/{system_id}/"))?)
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[async_trait]
impl RackControllerSource for HttpRackControllerSource {
    #[instrument(skip(self))]
    async fn get_rack_controller(
        &self,
        system_id: &str,
    ) -> Result<RackController, CollaboratorError> {
        let url = self.controller_url(system_id)?;
        debug!(%url, "fetching rack controller");

        let mut request = self.http.get(url);
        if let Some(api_key) = &self.api_key {
            let nonce = Uuid::now_v7().simple().to_string();
            request = request.header(
                AUTHORIZATION,
                api_key.authorization(&nonce, chrono::Utc::now().timestamp()),
            );
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(CollaboratorError::NotFound(format!(
                "rack controller {system_id}"
            )));
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

// =============================================================================
// In-memory source
// =============================================================================

#[derive(Default)]
pub struct InMemoryRackControllerSource {
    controllers: RwLock<HashMap<String, RackController>>,
}

impl InMemoryRackControllerSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, controller: RackController) {
        self.controllers
            .write()
            .insert(controller.system_id.clone(), controller);
    }
}

#[async_trait]
impl RackControllerSource for InMemoryRackControllerSource {
    async fn get_rack_controller(
        &self,
        system_id: &str,
    ) -> Result<RackController, CollaboratorError> {
        self.controllers
            .read()
            .get(system_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("rack controller {system_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vlan_ids_are_distinct() {
        let controller: RackController = serde_json::from_value(json!({
            "system_id": "abc123",
            "hostname": "rack-1",
            "interface_set": [
                {"name": "eth0", "vlan": {"id": 5, "vid": 0}},
                {"name": "eth1", "vlan": {"id": 5}},
                {"name": "eth2", "vlan": {"id": 7}},
                {"name": "eth3", "vlan": null}
            ]
        }))
        .expect("should parse controller");

        assert_eq!(controller.vlan_ids().into_iter().collect::<Vec<_>>(), vec![5, 7]);
    }

    #[test]
    fn test_api_key_parses_three_parts() {
        let key: MaasApiKey = "ck:tk:secret".parse().expect("should parse");
        assert_eq!(key.consumer_key, "ck");
        assert_eq!(key.token_key, "tk");
        assert!(!format!("{key:?}").contains("secret"));

        for raw in ["", "ck:tk", "ck:tk:secret:extra", "ck::secret"] {
            assert!(raw.parse::<MaasApiKey>().is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn test_plaintext_authorization() {
        let key: MaasApiKey = "ck:tk:secret".parse().expect("should parse");

        assert_eq!(
            key.authorization("abc", 1_700_000_000),
            "OAuth realm=\"\", oauth_version=\"1.0\", oauth_signature_method=\"PLAINTEXT\", \
             oauth_consumer_key=\"ck\", oauth_token=\"tk\", oauth_signature=\"%26secret\", \
             oauth_nonce=\"abc\", oauth_timestamp=\"1700000000\""
        );
    }

    #[test]
    fn test_controller_url_keeps_base_path() {
        let source = HttpRackControllerSource::new(
            Url::parse("http://localhost:5240/MAAS").expect("should parse"),
            Duration::from_secs(5),
        )
        .expect("should build client");

        assert_eq!(
            source.controller_url("abc123").expect("should join").as_str(),
            "http://localhost:5240/MAAS/api/2.0/rackcontrollers/abc123/"
        );
    }
}
