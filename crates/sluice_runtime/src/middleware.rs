//! Built-in middleware.

use indexmap::IndexMap;
use sluice_core::{Context, ErrorAction, Invocation, Middleware, NodeId, TaskError, Value};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Retries a failed invocation until `max_attempts` have been made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryMiddleware {
    max_attempts: u32,
}

impl RetryMiddleware {
    /// Allow up to `max_attempts` invocations per input tuple (minimum 1)
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Configured attempt budget
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    fn on_error(&self, _ctx: &Context, call: &Invocation<'_>, error: &TaskError) -> ErrorAction {
        if call.attempt < self.max_attempts {
            tracing::debug!(
                node = %call.node.path,
                attempt = call.attempt,
                max_attempts = self.max_attempts,
                error = %error,
                "scheduling retry"
            );
            ErrorAction::Retry
        } else {
            ErrorAction::Rethrow
        }
    }
}

/// Emits one structured event per invocation
///
/// Entry is logged at `trace`, completion at `debug` with the elapsed time,
/// failures at `warn`. Never changes the outcome of an invocation.
#[derive(Debug, Default)]
pub struct TracingMiddleware {
    started: Mutex<IndexMap<NodeId, Instant>>,
}

impl TracingMiddleware {
    /// Create the middleware
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn elapsed_us(&self, node: NodeId) -> u64 {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .swap_remove(&node)
            .map_or(0, |start| {
                u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
            })
    }
}

impl Middleware for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    fn before(&self, ctx: &Context, call: &Invocation<'_>) -> Result<(), TaskError> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(call.node.node_id, Instant::now());
        tracing::trace!(
            run_id = ?ctx.run_id(),
            node = %call.node.path,
            attempt = call.attempt,
            inputs = call.inputs.len(),
            "invocation started"
        );
        Ok(())
    }

    fn after(&self, ctx: &Context, call: &Invocation<'_>, output: Option<&Value>) {
        let elapsed_us = self.elapsed_us(call.node.node_id);
        tracing::debug!(
            run_id = ?ctx.run_id(),
            node = %call.node.path,
            attempt = call.attempt,
            emitted = output.is_some(),
            elapsed_us,
            "invocation finished"
        );
    }

    fn on_error(&self, ctx: &Context, call: &Invocation<'_>, error: &TaskError) -> ErrorAction {
        let elapsed_us = self.elapsed_us(call.node.node_id);
        tracing::warn!(
            run_id = ?ctx.run_id(),
            node = %call.node.path,
            attempt = call.attempt,
            elapsed_us,
            error = %error,
            "invocation failed"
        );
        ErrorAction::Rethrow
    }
}
