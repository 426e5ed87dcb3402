//! MAAS Site Manager (MSM) connector
//!
//! - [`MsmEnrolSiteWorkflow`] enrols the site and hands over to
//! - [`MsmHeartbeatWorkflow`], which reports machine counts until MSM revokes the site.

pub mod activities;
pub mod client;
pub mod enrol;
pub mod heartbeat;
pub mod types;

pub use activities::register_msm_activities;
pub use client::MsmClient;
pub use enrol::MsmEnrolSiteWorkflow;
pub use heartbeat::{HeartbeatWorkflowInput, MsmHeartbeatWorkflow};
pub use types::{
    MachineStatsByStatus, MsmConnectorParam, MsmEnrolParam, MsmHeartbeatParam, SendEnrolOutcome,
};
