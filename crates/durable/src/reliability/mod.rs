//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential or fixed backoff

mod retry;

pub use retry::RetryPolicy;
