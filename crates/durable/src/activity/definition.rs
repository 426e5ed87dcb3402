//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Well-known `error_type` values set by the engine itself
pub mod error_types {
    /// Attempt exceeded its start-to-close timeout
    pub const TIMEOUT: &str = "START_TO_CLOSE_TIMEOUT";
    /// Retries would outlive the schedule-to-close timeout
    pub const SCHEDULE_TO_CLOSE: &str = "SCHEDULE_TO_CLOSE_TIMEOUT";
    /// Owning workflow was cancelled
    pub const CANCELLED: &str = "CANCELLED";
    /// Input or output could not be (de)serialized
    pub const SERIALIZATION: &str = "SERIALIZATION";
    /// No handler registered for the activity type
    pub const UNKNOWN_ACTIVITY: &str = "UNKNOWN_ACTIVITY";
}

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors will immediately fail the activity
    /// without further retry attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Attempt ran past its start-to-close timeout
    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::retryable(format!("activity timed out after {timeout:?}"))
            .with_type(error_types::TIMEOUT)
    }

    /// Activity stopped because its workflow was cancelled
    pub fn cancelled() -> Self {
        Self::non_retryable("activity cancelled").with_type(error_types::CANCELLED)
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Check the error type
    pub fn is_type(&self, error_type: &str) -> bool {
        self.error_type.as_deref() == Some(error_type)
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// An activity is a unit of work that may fail and be retried
///
/// Activities are the building blocks of workflows. They represent
/// discrete side-effecting operations that:
/// - Are executed by workers outside the workflow (or inline, for local activities)
/// - Must be idempotent, since a retry or a replayed workflow may run them again
/// - Classify their failures as retryable or not
///
/// Expected terminal outcomes (a remote cancelled us, enrolment was withdrawn)
/// belong in `Output`, not in `ActivityError`.
///
/// # Example
///
/// ```ignore
/// use maas_durable::prelude::*;
///
/// struct PowerOnActivity;
///
/// #[async_trait]
/// impl Activity for PowerOnActivity {
///     const TYPE: &'static str = "power-on";
///     type Input = PowerParams;
///     type Output = bool;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         // Talk to the BMC...
///         Ok(true)
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier for this activity
    ///
    /// This is used to look up the activity in the registry.
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
