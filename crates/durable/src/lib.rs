//! # Durable Execution Engine
//!
//! An event-sourced workflow engine for long-running, crash-tolerant orchestration.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every run is an append-only history; state is rebuilt by replay
//! - **Activities with retries**: capped exponential or fixed backoff, cancellation and timeouts
//! - **Task queues**: activities are claimed by worker pools listening on a named queue
//! - **Durable timers, child workflows and continue-as-new**
//! - **Signals and queries**: external messages in, read-only state views out
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (replays histories, turns actions into events and tasks)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (PostgreSQL or in-memory: runs, events, tasks, timers,     │
//! │   pending effects)                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               WorkerPool + TimerService                      │
//! │  (claims tasks, runs activities, fires timers, recovers)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use maas_durable::prelude::*;
//!
//! struct PingWorkflow {
//!     host: String,
//!     reachable: Option<bool>,
//! }
//!
//! impl Workflow for PingWorkflow {
//!     const TYPE: &'static str = "ping";
//!     type Input = String;
//!     type Output = bool;
//!
//!     fn new(host: Self::Input) -> Self {
//!         Self { host, reachable: None }
//!     }
//!
//!     fn on_start(&mut self) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::schedule_activity("ping", "icmp-ping", json!(self.host))]
//!     }
//!
//!     // ... implement other trait methods
//! }
//! ```

pub mod activity;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod worker;
pub mod workflow;

mod serde_duration;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, StartOptions, StartedRun, WorkflowExecutor,
        WorkflowRegistry,
    };
    pub use crate::persistence::{
        ClaimedTask, InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError,
        TaskDefinition, WorkflowEventStore, WorkflowInfo, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{
        TimerService, TimerServiceConfig, WorkerPool, WorkerPoolConfig, WorkerPoolError,
    };
    pub use crate::workflow::{
        ActivityOptions, ChildWorkflow, IdReusePolicy, ParentClosePolicy, Workflow,
        WorkflowAction, WorkflowError, WorkflowEvent, WorkflowSignal,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
pub use engine::{
    ExecutorConfig, ExecutorError, StartOptions, StartedRun, WorkflowExecutor, WorkflowRegistry,
};
pub use persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError, WorkflowEventStore,
    WorkflowInfo, WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use worker::{TimerService, TimerServiceConfig, WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, ChildWorkflow, IdReusePolicy, ParentClosePolicy, Workflow, WorkflowAction,
    WorkflowError, WorkflowEvent, WorkflowSignal,
};
