//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowAction`] enum for workflow commands
//! - [`WorkflowEvent`] enum for persisted events
//! - [`WorkflowSignal`] for external communication
//! - [`IdReusePolicy`] and [`ParentClosePolicy`] for run lifecycle control

mod action;
mod definition;
mod event;
mod policy;
mod signal;

pub use action::{ActivityOptions, ChildWorkflow, WorkflowAction};
pub use definition::{Workflow, WorkflowError};
pub use event::WorkflowEvent;
pub use policy::{IdReusePolicy, ParentClosePolicy};
pub use signal::{WorkflowSignal, CANCEL_SIGNAL};
