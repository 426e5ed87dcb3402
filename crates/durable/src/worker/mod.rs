//! Workers: activity task execution and timer delivery
//!
//! This module provides:
//! - [`WorkerPool`] - claims activity tasks from one task queue and runs them
//! - [`TimerService`] - fires durable timers into the executor
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────┐  ┌─────────────────┐  ┌─────────────────┐  │
//! │  │  Poll loop  │  │ Heartbeat pump  │  │ Stale reclaimer │  │
//! │  │ (claiming)  │  │   (per task)    │  │     (30s)       │  │
//! │  └──────┬──────┘  └─────────────────┘  └─────────────────┘  │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │         Task Executor (Semaphore-limited)           │    │
//! │  │  [Task 1] [Task 2] [Task 3] ... [Task N]            │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!            │ results
//!            ▼
//!     WorkflowExecutor  ◀──── TimerService (due timers)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use maas_durable::worker::{TimerService, TimerServiceConfig, WorkerPool, WorkerPoolConfig};
//!
//! let pool = WorkerPool::new(executor.clone(), activities, WorkerPoolConfig::new("region"));
//! let timers = TimerService::new(executor, TimerServiceConfig::default());
//!
//! pool.start().await?;
//! timers.start();
//!
//! // Graceful shutdown
//! timers.shutdown().await;
//! pool.shutdown().await?;
//! ```

mod pool;
mod timer;

pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use timer::{TimerService, TimerServiceConfig};
