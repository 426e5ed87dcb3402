//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor` which drives workflow
//! state machines through event replay and action processing.

mod executor;
mod registry;

pub use executor::{
    ExecutorConfig, ExecutorError, StartOptions, StartedRun, WorkflowExecutor, HISTORY_LIMIT_CODE,
    INVALID_TIMER_CODE,
};
pub use registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
