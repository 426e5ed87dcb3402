//! What an activity attempt knows about itself

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use uuid::Uuid;

use super::ActivityError;

/// Handed to every activity attempt
///
/// Cancellation is cooperative. When the owning run closes, the worker
/// trips the attempt's [`CancellationHandle`]; the activity should stop at
/// its next await on [`cancelled`](Self::cancelled). Anything it returns
/// afterwards is discarded.
///
/// ```ignore
/// tokio::select! {
///     response = client.post(body) => response.map_err(ActivityError::from),
///     _ = ctx.cancelled() => Err(ActivityError::cancelled()),
/// }
/// ```
#[derive(Debug)]
pub struct ActivityContext {
    /// 1-based
    pub attempt: u32,

    /// 0 when attempts are unlimited
    pub max_attempts: u32,

    pub run_id: Uuid,
    pub workflow_id: String,
    pub activity_id: String,

    cancellation: CancellationHandle,
}

impl ActivityContext {
    pub fn new(
        run_id: Uuid,
        workflow_id: impl Into<String>,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            run_id,
            workflow_id: workflow_id.into(),
            activity_id: activity_id.into(),
            cancellation: CancellationHandle::default(),
        }
    }

    /// Handle the worker keeps to cancel this attempt
    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the attempt is cancelled
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// `Err(cancelled)` once the attempt is cancelled, for use with `?`
    pub fn check_cancelled(&self) -> Result<(), ActivityError> {
        if self.is_cancelled() {
            return Err(ActivityError::cancelled());
        }
        Ok(())
    }

    pub fn is_last_attempt(&self) -> bool {
        self.max_attempts != 0 && self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Default)]
struct Cancellation {
    tripped: AtomicBool,
    notify: Notify,
}

/// Shared switch that cancels one attempt
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    inner: Arc<Cancellation>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.inner.tripped.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.tripped.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        loop {
            // Registered before the check so a concurrent cancel is not missed
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
