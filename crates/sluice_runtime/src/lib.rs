//! SLUICE Runtime
//!
//! Runs bound flows: one execution unit per task instance, a bounded worker
//! pool for blocking bodies, edge backpressure, cancellation and deadlines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backpressure;
pub mod engine;
pub mod executor;
pub mod middleware;
pub mod monitor;
pub mod pool;
pub mod scheduler;

pub use backpressure::{EdgePolicy, PushOutcome};
pub use engine::{ConfigError, Engine, EngineConfig, FailurePolicy, RunHandle, RunOutcome, run};
pub use executor::{Executor, UnitExit, UnitReport};
pub use middleware::{RetryMiddleware, TracingMiddleware};
pub use monitor::{Metrics, RunMetrics};
pub use pool::{WorkerPool, default_workers};
pub use scheduler::{RunStatus, ScheduleError, Scheduler};
