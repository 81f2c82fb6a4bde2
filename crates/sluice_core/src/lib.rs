//! SLUICE Core Types
//!
//! Identifiers, the error taxonomy, the per-run context and the middleware
//! contract shared by the channel, planning and runtime layers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod error;
pub mod id;
pub mod middleware;

// Re-exports
pub use context::Context;
pub use error::{CancelReason, CompositionError, FlowError, FlowResult, TaskError};
pub use id::{FlowId, NodeId, RunId, TaskId};
pub use middleware::{ErrorAction, Invocation, Middleware, MiddlewareChain, NodeInfo};

/// Item type carried by graph channels
pub use serde_json::Value;
