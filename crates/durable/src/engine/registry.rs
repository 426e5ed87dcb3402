//! Workflow types by name
//!
//! Runs are persisted as a type name plus JSON input. The registry turns
//! that pair back into a live state machine and replays history into it.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::workflow::{Workflow, WorkflowAction, WorkflowEvent};

/// A workflow state machine whose concrete type is known only by name
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    /// Feed one history event, returning the actions it triggers
    ///
    /// Events that record the run's own decisions (scheduled activities,
    /// started timers, initiated children) and lifecycle events other than
    /// the start produce no actions.
    fn handle(&mut self, event: &WorkflowEvent) -> Vec<WorkflowAction>;

    fn query(&self, query_type: &str) -> Option<Value>;
}

struct Erased<W>(W);

impl<W: Workflow> AnyWorkflow for Erased<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn handle(&mut self, event: &WorkflowEvent) -> Vec<WorkflowAction> {
        let workflow = &mut self.0;
        match event {
            WorkflowEvent::WorkflowStarted { .. } => workflow.on_start(),
            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
            } => workflow.on_activity_completed(activity_id, result.clone()),
            WorkflowEvent::ActivityFailed { activity_id, error } => {
                workflow.on_activity_failed(activity_id, error)
            }
            WorkflowEvent::TimerFired { timer_id } => workflow.on_timer_fired(timer_id),
            WorkflowEvent::SignalReceived { signal } => workflow.on_signal(signal),
            _ => vec![],
        }
    }

    fn query(&self, query_type: &str) -> Option<Value> {
        self.0.query(query_type)
    }
}

type Constructor = fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error>;

fn construct<W: Workflow>(input: Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> {
    let input: W::Input = serde_json::from_value(input)?;
    Ok(Box::new(Erased(W::new(input))))
}

/// Registered workflow types
#[derive(Default)]
pub struct WorkflowRegistry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type under [`Workflow::TYPE`]
    pub fn register<W: Workflow>(&mut self) {
        self.constructors.insert(W::TYPE, construct::<W>);
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.constructors.contains_key(workflow_type)
    }

    /// Build a fresh instance from the run's input
    ///
    /// Fails for unknown types and for input the type cannot decode.
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let constructor = self
            .constructors
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        constructor(input).map_err(|source| RegistryError::InvalidInput {
            workflow_type: workflow_type.to_string(),
            source,
        })
    }

    /// Build an instance and replay `history` into it
    ///
    /// Actions produced while replaying were committed with the events that
    /// caused them and are discarded.
    pub fn replay<'a>(
        &self,
        workflow_type: &str,
        input: Value,
        history: impl IntoIterator<Item = &'a WorkflowEvent>,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let mut workflow = self.create(workflow_type, input)?;
        for event in history {
            workflow.handle(event);
        }
        Ok(workflow)
    }

    /// Registered type names, sorted
    pub fn workflow_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("invalid input for workflow {workflow_type}: {source}")]
    InvalidInput {
        workflow_type: String,
        #[source]
        source: serde_json::Error,
    },
}
