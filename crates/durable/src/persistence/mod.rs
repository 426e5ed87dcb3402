//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for runs, event history, task queue, timers
//!   and pending effects
//! - [`InMemoryWorkflowEventStore`] for testing
//! - [`PostgresWorkflowEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use postgres::PostgresWorkflowEventStore;
pub use store::{
    status_change, ClaimedTask, EffectRecord, HeartbeatResponse, HistoryAppend, NewWorkflow,
    PendingEffect, StatusChange, StoreError, TaskDefinition, TaskFailureOutcome, TaskFilter,
    TaskStatus, TimerRecord, WorkflowEventStore, WorkflowInfo, WorkflowStatus,
};
