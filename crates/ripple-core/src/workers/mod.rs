//! Polling workers: the adaptive runner, the per-record worker, the
//! handler context, and the throttle table.

pub mod context;
pub mod pool;
pub mod throttle;
pub mod worker;

pub use context::{Defer, TaskConditionFailed, TaskContext};
pub use pool::{AdaptiveRunner, PollSettings};
pub use throttle::ThrottleTable;
pub use worker::{WorkerEngine, WorkerOptions};
