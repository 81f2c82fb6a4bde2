//! Error taxonomy shared by every SLUICE layer.
//!
//! Composition problems are reported synchronously while a flow is defined or
//! bound. Everything else is observed while a run executes and ends up as the
//! run's terminal error.

use crate::id::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Result type used across the engine
pub type FlowResult<T> = Result<T, FlowError>;

/// Invalid graph: raised at definition or bind time, never during execution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositionError {
    /// Number of supplied inputs does not match the declared arity
    #[error("node `{node}` expects {expected} input(s), got {actual}")]
    ArityMismatch {
        /// Node name
        node: String,
        /// Declared arity
        expected: usize,
        /// Supplied inputs
        actual: usize,
    },

    /// Adding an edge would close a cycle
    #[error("connecting `{from}` -> `{to}` would create a cycle")]
    Cycle {
        /// Upstream node name
        from: String,
        /// Downstream node name
        to: String,
    },

    /// An input slot was never connected
    #[error("input slot {slot} of node `{node}` is not bound")]
    UnboundPort {
        /// Node name
        node: String,
        /// Positional slot
        slot: usize,
    },

    /// An input slot was connected twice
    #[error("input slot {slot} of node `{node}` is already bound")]
    SlotAlreadyBound {
        /// Node name
        node: String,
        /// Positional slot
        slot: usize,
    },

    /// Flow input index out of range
    #[error("flow `{flow}` has {arity} input port(s); index {index} is out of range")]
    UnknownInput {
        /// Flow name
        flow: String,
        /// Requested index
        index: usize,
        /// Declared arity
        arity: usize,
    },

    /// Node index not present in the graph
    #[error("unknown node index {index}")]
    UnknownNode {
        /// Requested index
        index: usize,
    },

    /// A sink was used as an upstream
    #[error("node `{node}` is a sink and has no output to connect")]
    SinkHasNoOutput {
        /// Node name
        node: String,
    },

    /// Arity declaration incompatible with the node kind
    #[error("node `{node}` declares an invalid arity: {reason}")]
    InvalidArity {
        /// Node name
        node: String,
        /// Why the arity was rejected
        reason: String,
    },

    /// A group literal with no members
    #[error("an empty group cannot be applied to `{node}`")]
    EmptyGroup {
        /// Downstream node name
        node: String,
    },

    /// A port created by another flow's builder
    #[error("port does not belong to flow `{flow}`")]
    ForeignPort {
        /// Flow being defined
        flow: String,
    },

    /// A group with several ports used where exactly one is needed
    #[error("a group of {len} ports cannot be used as a single port")]
    NotSingle {
        /// Group length
        len: usize,
    },
}

/// Why a run was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelReason {
    /// Caller asked for it through the run handle or the context
    Requested,
    /// Configured deadline elapsed
    Deadline,
    /// Another unit failed and the failure policy cancels the whole run
    Failure,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Deadline => write!(f, "deadline exceeded"),
            Self::Failure => write!(f, "failure elsewhere in the run"),
        }
    }
}

/// Engine error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// Invalid graph
    #[error("flow composition error: {0}")]
    Composition(#[from] CompositionError),

    /// A task body failed and no middleware recovered it
    #[error("task `{name}` ({node}) failed: {message}")]
    TaskExecution {
        /// Failing instance
        node: NodeId,
        /// Task name
        name: String,
        /// Inputs of the failing invocation
        inputs: Vec<Value>,
        /// Error rendered from the body
        message: String,
    },

    /// Observed after cancellation
    #[error("run cancelled: {reason}")]
    Cancelled {
        /// Cancellation cause
        reason: CancelReason,
    },

    /// A bounded push did not find room in time
    #[error("task `{name}` ({node}) waited {waited_ms}ms for output capacity")]
    ChannelCapacityTimeout {
        /// Producing instance
        node: NodeId,
        /// Task name
        name: String,
        /// Configured wait
        waited_ms: u64,
    },

    /// The context already drives a run
    #[error("context is already bound to a run")]
    ContextInUse,

    /// Unexpected engine failure
    #[error("internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl FlowError {
    /// Build an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error reports a cancellation rather than a failure
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether this error was raised while composing or binding a graph
    #[must_use]
    pub const fn is_composition(&self) -> bool {
        matches!(self, Self::Composition(_))
    }
}

/// Error raised by a task body or a middleware hook
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    message: String,
}

impl TaskError {
    /// Create a task error from a message
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Error message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("value conversion failed: {err}"))
    }
}
