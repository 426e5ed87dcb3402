//! Registry of type-erased activity handlers

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use super::definition::error_types;
use super::{Activity, ActivityContext, ActivityError};

/// Type-erased activity handler: JSON input in, JSON output out
pub type ActivityHandler = Arc<
    dyn Fn(Value, ActivityContext) -> BoxFuture<'static, Result<Value, ActivityError>>
        + Send
        + Sync,
>;

/// Maps activity type names to handlers
///
/// Used both by [`WorkerPool`](crate::worker::WorkerPool) for queued
/// activities and by the executor for local activities.
///
/// # Example
///
/// ```ignore
/// let mut activities = ActivityRegistry::new();
/// activities.register(SendEnrolActivity::new(client.clone()));
/// activities.register_fn("noop", |_input, _ctx| async { Ok(json!(null)) });
/// ```
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, ActivityHandler>,
}

impl ActivityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity under its `TYPE`
    pub fn register<A: Activity>(&mut self, activity: A) {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(move |input, ctx| {
            let activity = Arc::clone(&activity);
            Box::pin(async move {
                let typed: A::Input = serde_json::from_value(input).map_err(|e| {
                    ActivityError::non_retryable(format!("invalid input for {}: {e}", A::TYPE))
                        .with_type(error_types::SERIALIZATION)
                })?;
                let output = activity.execute(&ctx, typed).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::non_retryable(format!("invalid output from {}: {e}", A::TYPE))
                        .with_type(error_types::SERIALIZATION)
                })
            })
        });

        self.handlers.insert(A::TYPE.to_string(), handler);
    }

    /// Register a closure as an activity handler
    pub fn register_fn<F, Fut>(&mut self, activity_type: impl Into<String>, f: F)
    where
        F: Fn(Value, ActivityContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |input, ctx| Box::pin(f(input, ctx)));
        self.handlers.insert(activity_type.into(), handler);
    }

    /// Get the handler for an activity type
    pub fn get(&self, activity_type: &str) -> Option<ActivityHandler> {
        self.handlers.get(activity_type).cloned()
    }

    /// Check if an activity type is registered
    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    /// Run an activity by name
    ///
    /// An unregistered type is a non-retryable failure.
    pub async fn execute(
        &self,
        activity_type: &str,
        input: Value,
        ctx: ActivityContext,
    ) -> Result<Value, ActivityError> {
        match self.get(activity_type) {
            Some(handler) => handler(input, ctx).await,
            None => Err(ActivityError::non_retryable(format!(
                "no handler registered for activity type: {activity_type}"
            ))
            .with_type(error_types::UNKNOWN_ACTIVITY)),
        }
    }

    /// All registered activity type names, sorted
    pub fn activity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registered activity types
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    struct DoubleActivity;

    #[async_trait]
    impl Activity for DoubleActivity {
        const TYPE: &'static str = "double";
        type Input = i64;
        type Output = i64;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            Ok(input * 2)
        }
    }

    fn ctx() -> ActivityContext {
        ActivityContext::new(Uuid::now_v7(), "wf", "a-1", 1, 3)
    }

    #[tokio::test]
    async fn test_typed_activity_round_trip() {
        let mut registry = ActivityRegistry::new();
        registry.register(DoubleActivity);

        let output = registry
            .execute("double", json!(21), ctx())
            .await
            .expect("should run activity");
        assert_eq!(output, json!(42));
    }

    #[tokio::test]
    async fn test_invalid_input_is_not_retryable() {
        let mut registry = ActivityRegistry::new();
        registry.register(DoubleActivity);

        let error = registry
            .execute("double", json!("not a number"), ctx())
            .await
            .expect_err("should reject input");
        assert!(!error.retryable);
        assert!(error.is_type(error_types::SERIALIZATION));
    }

    #[tokio::test]
    async fn test_unknown_activity() {
        let registry = ActivityRegistry::new();

        let error = registry
            .execute("missing", json!(null), ctx())
            .await
            .expect_err("should fail");
        assert!(error.is_type(error_types::UNKNOWN_ACTIVITY));
    }

    #[tokio::test]
    async fn test_register_fn() {
        let mut registry = ActivityRegistry::new();
        registry.register_fn("echo", |input, _ctx| async move { Ok(input) });

        assert!(registry.contains("echo"));
        let output = registry
            .execute("echo", json!({"a": 1}), ctx())
            .await
            .expect("should echo");
        assert_eq!(output, json!({"a": 1}));
    }

    #[test]
    fn test_activity_types_sorted() {
        let mut registry = ActivityRegistry::new();
        registry.register_fn("b", |i, _| async move { Ok(i) });
        registry.register(DoubleActivity);

        assert_eq!(registry.activity_types(), vec!["b", "double"]);
        assert_eq!(registry.len(), 2);
    }
}
