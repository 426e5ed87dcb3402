//! Workflow id reuse and parent close policies

use serde::{Deserialize, Serialize};

/// What to do when a workflow is started with an id that already has a run
///
/// Workflow ids are chosen by the caller (e.g. `msm-heartbeat:region`) and
/// identify a logical workflow across runs. The policy decides whether a new
/// start joins, replaces, or is rejected by an existing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdReusePolicy {
    /// Start a new run only if the previous run is closed
    #[default]
    AllowDuplicate,

    /// Never start a new run if any run with this id exists
    RejectDuplicate,

    /// Terminate the running run (if any) and start a new one
    TerminateIfRunning,

    /// Return the running run (if any) instead of starting a new one
    UseExisting,
}

/// What happens to a child workflow when its parent closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentClosePolicy {
    /// Terminate the child
    #[default]
    Terminate,

    /// Request cancellation of the child
    RequestCancel,

    /// Leave the child running, fully detached from the parent
    Abandon,
}

impl ParentClosePolicy {
    /// Database/wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminate => "terminate",
            Self::RequestCancel => "request_cancel",
            Self::Abandon => "abandon",
        }
    }

    /// Parse a database/wire name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "terminate" => Some(Self::Terminate),
            "request_cancel" => Some(Self::RequestCancel),
            "abandon" => Some(Self::Abandon),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(IdReusePolicy::default(), IdReusePolicy::AllowDuplicate);
        assert_eq!(ParentClosePolicy::default(), ParentClosePolicy::Terminate);
    }

    #[test]
    fn test_policy_wire_names() {
        assert_eq!(
            serde_json::to_string(&IdReusePolicy::TerminateIfRunning).unwrap(),
            "\"terminate_if_running\""
        );
        assert_eq!(
            serde_json::to_string(&ParentClosePolicy::Abandon).unwrap(),
            "\"abandon\""
        );
    }

    #[test]
    fn test_parent_close_policy_names_match_serde() {
        for policy in [
            ParentClosePolicy::Terminate,
            ParentClosePolicy::RequestCancel,
            ParentClosePolicy::Abandon,
        ] {
            let wire = serde_json::to_value(policy).unwrap();
            assert_eq!(wire, policy.as_str());
            assert_eq!(ParentClosePolicy::parse(policy.as_str()), Some(policy));
        }
    }
}
