//! Activity abstractions
//!
//! Activities are units of work that are executed by workers. They:
//! - May fail and be retried according to the retry policy
//! - Are kept alive by worker heartbeats while they run
//! - Observe cancellation through their context

mod context;
mod definition;
mod registry;

pub use context::{ActivityContext, CancellationHandle};
pub use definition::{error_types, Activity, ActivityError};
pub use registry::{ActivityHandler, ActivityRegistry};
