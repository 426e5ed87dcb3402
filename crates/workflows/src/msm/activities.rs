//! MSM activities

use std::sync::Arc;

use async_trait::async_trait;
use maas_durable::{Activity, ActivityContext, ActivityError, ActivityRegistry};
use tracing::{debug, info};

use super::client::MsmClient;
use super::types::{
    MachineStatsByStatus, MsmConnectorParam, MsmEnrolParam, MsmHeartbeatParam, SendEnrolOutcome,
    MSM_SECRET,
};
use crate::machines::MachineStatusSource;
use crate::secrets::{global_secret_path, SecretStore};

/// Activity type names
pub mod names {
    pub const SEND_ENROL: &str = "msm-send-enrol";
    pub const CHECK_ENROL: &str = "msm-check-enrol";
    pub const SET_ENROL: &str = "msm-set-enrol";
    pub const GET_HEARTBEAT_DATA: &str = "msm-get-heartbeat-data";
    pub const SEND_HEARTBEAT: &str = "msm-send-heartbeat";
}

/// Send the enrolment request
pub struct SendEnrolActivity {
    client: Arc<MsmClient>,
}

impl SendEnrolActivity {
    pub fn new(client: Arc<MsmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Activity for SendEnrolActivity {
    const TYPE: &'static str = names::SEND_ENROL;
    type Input = MsmEnrolParam;
    type Output = SendEnrolOutcome;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.client.send_enrol(&input).await
    }
}

/// Poll for enrolment approval
pub struct CheckEnrolActivity {
    client: Arc<MsmClient>,
}

impl CheckEnrolActivity {
    pub fn new(client: Arc<MsmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Activity for CheckEnrolActivity {
    const TYPE: &'static str = names::CHECK_ENROL;
    type Input = MsmEnrolParam;
    type Output = Option<String>;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        debug!(attempt = ctx.attempt, "checking enrolment status");
        self.client.check_enrol(&input).await
    }
}

/// Persist connector endpoint and token under `global/msm-connector`
pub struct SetEnrolActivity {
    secrets: Arc<dyn SecretStore>,
}

impl SetEnrolActivity {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl Activity for SetEnrolActivity {
    const TYPE: &'static str = names::SET_ENROL;
    type Input = MsmConnectorParam;
    type Output = ();

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.secrets
            .create_or_update(&global_secret_path(MSM_SECRET), input.to_secret())
            .await?;
        info!(url = %input.url, "stored MSM connector credentials");
        Ok(())
    }
}

/// Count machines per heartbeat bucket
pub struct GetHeartbeatDataActivity {
    machines: Arc<dyn MachineStatusSource>,
}

impl GetHeartbeatDataActivity {
    pub fn new(machines: Arc<dyn MachineStatusSource>) -> Self {
        Self { machines }
    }
}

#[async_trait]
impl Activity for GetHeartbeatDataActivity {
    const TYPE: &'static str = names::GET_HEARTBEAT_DATA;
    type Input = ();
    type Output = MachineStatsByStatus;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        _input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let counts = self.machines.count_by_status().await?;
        Ok(MachineStatsByStatus::from_counts(counts))
    }
}

/// Report machine counts to MSM
pub struct SendHeartbeatActivity {
    client: Arc<MsmClient>,
}

impl SendHeartbeatActivity {
    pub fn new(client: Arc<MsmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Activity for SendHeartbeatActivity {
    const TYPE: &'static str = names::SEND_HEARTBEAT;
    type Input = MsmHeartbeatParam;
    type Output = i64;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let next = self.client.send_heartbeat(&input).await?;
        debug!(next, "next refresh in seconds");
        Ok(next)
    }
}

/// Register every MSM activity
pub fn register_msm_activities(
    registry: &mut ActivityRegistry,
    client: Arc<MsmClient>,
    secrets: Arc<dyn SecretStore>,
    machines: Arc<dyn MachineStatusSource>,
) {
    registry.register(SendEnrolActivity::new(client.clone()));
    registry.register(CheckEnrolActivity::new(client.clone()));
    registry.register(SetEnrolActivity::new(secrets));
    registry.register(GetHeartbeatDataActivity::new(machines));
    registry.register(SendHeartbeatActivity::new(client));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machines::{node_status, InMemoryMachineStatusSource};
    use crate::secrets::InMemorySecretStore;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> ActivityContext {
        ActivityContext::new(Uuid::now_v7(), "wf", "act", 1, 3)
    }

    #[tokio::test]
    async fn test_set_enrol_is_idempotent() {
        let secrets = Arc::new(InMemorySecretStore::new());
        let activity = SetEnrolActivity::new(secrets.clone());
        let param = MsmConnectorParam {
            url: "https://msm.example.com/site/v1/enrol".into(),
            jwt: "abc".into(),
        };

        activity
            .execute(&ctx(), param.clone())
            .await
            .expect("should persist");
        let once = secrets.snapshot();
        activity
            .execute(&ctx(), param)
            .await
            .expect("should persist");

        assert_eq!(secrets.snapshot(), once);
        assert_eq!(
            once.get("global/msm-connector"),
            Some(&json!({"url": "https://msm.example.com/site/v1/enrol", "jwt": "abc"}))
        );
    }

    #[tokio::test]
    async fn test_heartbeat_data_buckets_statuses() {
        let machines = Arc::new(InMemoryMachineStatusSource::new(vec![
            node_status::READY,
            node_status::FAILED_RELEASING,
            node_status::DEPLOYING,
        ]));
        let activity = GetHeartbeatDataActivity::new(machines);

        let stats = activity.execute(&ctx(), ()).await.expect("should count");

        assert_eq!(
            stats,
            MachineStatsByStatus {
                ready: 1,
                error: 1,
                other: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_registers_all_activity_types() {
        let mut registry = ActivityRegistry::new();
        register_msm_activities(
            &mut registry,
            Arc::new(MsmClient::new(std::time::Duration::from_secs(1)).expect("should build")),
            Arc::new(InMemorySecretStore::new()),
            Arc::new(InMemoryMachineStatusSource::default()),
        );

        assert_eq!(
            registry.activity_types(),
            vec![
                names::CHECK_ENROL,
                names::GET_HEARTBEAT_DATA,
                names::SEND_ENROL,
                names::SEND_HEARTBEAT,
                names::SET_ENROL,
            ]
        );
    }
}
