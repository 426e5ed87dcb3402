//! MSM client and MAAS rack controller source against wiremock

use std::time::Duration;

use maas_durable::ActivityError;
use maas_workflows::error::error_types;
use maas_workflows::msm::client::HEARTBEAT_REVOKED;
use maas_workflows::msm::types::HEARTBEAT_INTERVAL_HEADER;
use maas_workflows::msm::{MachineStatsByStatus, MsmClient, MsmEnrolParam, MsmHeartbeatParam};
use maas_workflows::rack::{HttpRackControllerSource, MaasApiKey, RackControllerSource};
use maas_workflows::CollaboratorError;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, header, header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> MsmClient {
    MsmClient::new(Duration::from_secs(5)).expect("should build client")
}

fn enrol_param(server: &MockServer) -> MsmEnrolParam {
    MsmEnrolParam {
        site_name: "site-a".to_string(),
        site_url: "https://maas.example.com".to_string(),
        url: format!("{}/site/v1/enrol", server.uri()),
        jwt: "enrol-token".to_string(),
        cluster_uuid: "cluster-1".to_string(),
        metainfo: None,
    }
}

fn heartbeat_param(server: &MockServer) -> MsmHeartbeatParam {
    MsmHeartbeatParam {
        sm_url: format!("{}/site/v1/details", server.uri()),
        jwt: "site-token".to_string(),
        site_name: "site-a".to_string(),
        site_url: "https://maas.example.com".to_string(),
        status: Some(MachineStatsByStatus {
            allocated: 2,
            deployed: 1,
            ready: 0,
            error: 1,
            other: 1,
        }),
    }
}

// =============================================================================
// MSM
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_send_enrol_posts_site_details() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/site/v1/enrol"))
        .and(header("authorization", "bearer enrol-token"))
        .and(body_json(json!({
            "name": "site-a",
            "url": "https://maas.example.com",
            "cluster_uuid": "cluster-1",
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client()
        .send_enrol(&enrol_param(&server))
        .await
        .expect("should send");

    assert!(outcome.sent);
    assert_eq!(outcome.error, None);
}

#[test_log::test(tokio::test)]
async fn test_check_enrol_pending_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/site/v1/enrol"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let error = client()
        .check_enrol(&enrol_param(&server))
        .await
        .expect_err("should still be pending");

    assert!(error.retryable);
    assert!(error.is_type(error_types::ENROLMENT_PENDING));
}

#[test_log::test(tokio::test)]
async fn test_check_enrol_returns_new_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/site/v1/enrol"))
        .and(header("authorization", "bearer enrol-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "site-token",
            "token_type": "bearer",
        })))
        .mount(&server)
        .await;

    let token = client()
        .check_enrol(&enrol_param(&server))
        .await
        .expect("should be approved");

    assert_eq!(token.as_deref(), Some("site-token"));
}

#[test_log::test(tokio::test)]
async fn test_check_enrol_undecodable_body_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/site/v1/enrol"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let error = client()
        .check_enrol(&enrol_param(&server))
        .await
        .expect_err("should reject body");

    assert!(!error.retryable);
    assert!(error.is_type(error_types::INVALID_RESPONSE));
}

#[test_log::test(tokio::test)]
async fn test_heartbeat_reads_interval_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/site/v1/details"))
        .and(header("authorization", "bearer site-token"))
        .and(body_json(json!({
            "name": "site-a",
            "url": "https://maas.example.com",
            "machines_by_status": {
                "allocated": 2, "deployed": 1, "ready": 0, "error": 1, "other": 1
            },
        })))
        .respond_with(ResponseTemplate::new(200).insert_header(HEARTBEAT_INTERVAL_HEADER, "45"))
        .mount(&server)
        .await;

    let next = client()
        .send_heartbeat(&heartbeat_param(&server))
        .await
        .expect("should send heartbeat");

    assert_eq!(next, 45);
}

#[test_log::test(tokio::test)]
async fn test_heartbeat_without_header_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/site/v1/details"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let error = client()
        .send_heartbeat(&heartbeat_param(&server))
        .await
        .expect_err("should reject response");

    assert!(!error.retryable);
    assert!(error.is_type(error_types::INVALID_RESPONSE));
}

#[test_log::test(tokio::test)]
async fn test_heartbeat_revoked_site() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/site/v1/details"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let next = client()
        .send_heartbeat(&heartbeat_param(&server))
        .await
        .expect("revocation is not an error");

    assert_eq!(next, HEARTBEAT_REVOKED);
}

#[test_log::test(tokio::test)]
async fn test_unreachable_msm_is_retryable() {
    let server = MockServer::start().await;
    let param = enrol_param(&server);
    drop(server);

    let error: ActivityError = client()
        .send_enrol(&param)
        .await
        .expect_err("should fail to connect");

    assert!(error.retryable);
    assert!(error.is_type(error_types::TRANSPORT));
}

// =============================================================================
// Rack controllers
// =============================================================================

fn rack_source(server: &MockServer) -> HttpRackControllerSource {
    let base = Url::parse(&format!("{}/MAAS", server.uri())).expect("should parse");
    HttpRackControllerSource::new(base, Duration::from_secs(5)).expect("should build source")
}

#[test_log::test(tokio::test)]
async fn test_rack_controller_is_fetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/MAAS/api/2.0/rackcontrollers/abc123/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "system_id": "abc123",
            "hostname": "rack-1",
            "interface_set": [
                {"name": "eth0", "vlan": {"id": 5, "vid": 0, "fabric": "fabric-0"}},
                {"name": "eth1", "vlan": {"id": 7, "vid": 100}},
                {"name": "br0", "vlan": null}
            ]
        })))
        .mount(&server)
        .await;

    let controller = rack_source(&server)
        .get_rack_controller("abc123")
        .await
        .expect("should fetch controller");

    assert_eq!(controller.system_id, "abc123");
    assert_eq!(controller.interface_set.len(), 3);
    assert_eq!(controller.vlan_ids().into_iter().collect::<Vec<_>>(), vec![5, 7]);
}

#[test_log::test(tokio::test)]
async fn test_missing_rack_controller_is_not_found() {
    let server = MockServer::start().await;

    let error = rack_source(&server)
        .get_rack_controller("missing")
        .await
        .expect_err("should be missing");

    assert!(matches!(error, CollaboratorError::NotFound(_)));
    assert!(!ActivityError::from(error).retryable);
}

#[test_log::test(tokio::test)]
async fn test_rack_controller_server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("region busy"))
        .mount(&server)
        .await;

    let error = rack_source(&server)
        .get_rack_controller("abc123")
        .await
        .expect_err("should fail");

    assert!(matches!(error, CollaboratorError::Api { status: 503, .. }));
    assert!(ActivityError::from(error).retryable);
}

#[test_log::test(tokio::test)]
async fn test_rack_controller_request_is_signed_with_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/MAAS/api/2.0/rackcontrollers/abc123/"))
        .and(header_regex(
            "authorization",
            r#"^OAuth realm="", oauth_version="1\.0", oauth_signature_method="PLAINTEXT", oauth_consumer_key="consumer", oauth_token="token", oauth_signature="%26secret", oauth_nonce="[0-9a-f]{32}", oauth_timestamp="\d+"$"#,
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"system_id": "abc123"})))
        .expect(2)
        .mount(&server)
        .await;

    let key: MaasApiKey = "consumer:token:secret".parse().expect("should parse key");
    let source = rack_source(&server).with_api_key(Some(key));
    for _ in 0..2 {
        source
            .get_rack_controller("abc123")
            .await
            .expect("signed request should be accepted");
    }

    let requests = server.received_requests().await.unwrap_or_default();
    let nonces: Vec<_> = requests
        .iter()
        .filter_map(|r| r.headers.get("authorization"))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split("oauth_nonce=").nth(1).map(str::to_string))
        .collect();
    assert_eq!(nonces.len(), 2);
    assert_ne!(nonces[0], nonces[1]);
}

#[test_log::test(tokio::test)]
async fn test_rack_controller_request_without_key_is_unsigned() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"system_id": "abc123"})))
        .mount(&server)
        .await;

    rack_source(&server)
        .get_rack_controller("abc123")
        .await
        .expect("should fetch controller");

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("authorization").is_none());
}
