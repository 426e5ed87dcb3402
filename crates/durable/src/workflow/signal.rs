//! Signals delivered to open runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signal type that cancels the run instead of reaching the workflow
pub const CANCEL_SIGNAL: &str = "cancel";

/// A message for an open run, recorded in its history before delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    pub signal_type: String,

    #[serde(default)]
    pub payload: Value,

    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    pub fn new(signal_type: impl Into<String>, payload: Value) -> Self {
        Self {
            signal_type: signal_type.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Cancel the run, keeping `reason` in the payload
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::new(CANCEL_SIGNAL, serde_json::json!({ "reason": reason.into() }))
    }

    pub fn is_cancel(&self) -> bool {
        self.signal_type == CANCEL_SIGNAL
    }

    /// Reason given to a cancel signal
    pub fn cancel_reason(&self) -> Option<&str> {
        if !self.is_cancel() {
            return None;
        }
        self.payload.get("reason").and_then(Value::as_str)
    }
}
