//! # MAAS workflows
//!
//! Durable MAAS business processes running on `maas-durable`:
//!
//! - `msm-enrol-site` enrols the region with MAAS Site Manager, then starts
//! - `msm-heartbeat`, which reports machine counts until MSM revokes the site
//! - `configure_worker_pool` starts one `add_worker` per rack controller VLAN
//!
//! External systems (secrets, machine counts, rack controllers, MSM) sit
//! behind the traits in [`secrets`], [`machines`], [`rack`] and the
//! [`msm::MsmClient`]. [`runtime`] wires them into a worker process.

pub mod config;
pub mod error;
pub mod machines;
pub mod msm;
pub mod rack;
pub mod runtime;
pub mod secrets;
pub mod telemetry;
pub mod worker_pool;

pub use config::{ConfigError, WorkerConfig};
pub use error::CollaboratorError;
pub use runtime::{build_executor, Collaborators, RuntimeError, WorkerRuntime};
pub use worker_pool::{
    AddWorkerWorkflow, ConfigureWorkerPoolInput, ConfigureWorkerPoolWorkflow, PoolProvisioner,
    WorkerProvisioner,
};
