//! Middleware contract.
//!
//! A middleware wraps every body invocation of every node in a run. Hooks run
//! in registration order on entry and in reverse order on exit, whether the
//! wrapped body blocks or suspends.

use crate::context::Context;
use crate::error::TaskError;
use crate::id::{NodeId, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Identity of the node instance being invoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Instance identity, unique per run
    pub node_id: NodeId,
    /// Definition identity, shared by every instance of the same task
    pub task_id: TaskId,
    /// Task name
    pub name: String,
    /// Position in the flow hierarchy, e.g. `main/sub_flow/add1`
    pub path: String,
}

/// One body invocation as seen by the middleware chain
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Node being invoked
    pub node: &'a NodeInfo,
    /// Positional inputs of this invocation (empty for sources)
    pub inputs: &'a [Value],
    /// Attempt counter, starting at 1 and bumped on every retry
    pub attempt: u32,
}

/// Decision taken by `on_error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorAction {
    /// Let the error fail the node
    Rethrow,
    /// Drop this invocation's output and keep the node alive
    Suppress,
    /// Invoke the body again with the same inputs
    Retry,
}

/// Interceptor around node execution
pub trait Middleware: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called before the body. An error here is handled like a body error.
    fn before(&self, _ctx: &Context, _call: &Invocation<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    /// Called after a successful body. `output` is `None` when nothing is emitted.
    fn after(&self, _ctx: &Context, _call: &Invocation<'_>, _output: Option<&Value>) {}

    /// Called when the body (or a `before` hook) failed
    fn on_error(&self, _ctx: &Context, _call: &Invocation<'_>, _error: &TaskError) -> ErrorAction {
        ErrorAction::Rethrow
    }
}

/// Ordered, immutable list of middleware applied to one node instance
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Create an empty chain
    #[must_use]
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Chain made of `outer` followed by `inner`
    #[must_use]
    pub fn layered(outer: &[Arc<dyn Middleware>], inner: &[Arc<dyn Middleware>]) -> Self {
        let mut layers = Vec::with_capacity(outer.len() + inner.len());
        layers.extend(outer.iter().cloned());
        layers.extend(inner.iter().cloned());
        Self { layers }
    }

    /// Number of layers
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the chain has no layers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run every `before` hook in registration order
    ///
    /// # Errors
    ///
    /// Returns the first hook error; later hooks do not run
    pub fn before(&self, ctx: &Context, call: &Invocation<'_>) -> Result<(), TaskError> {
        for layer in &self.layers {
            layer.before(ctx, call)?;
        }
        Ok(())
    }

    /// Run every `after` hook in reverse registration order
    pub fn after(&self, ctx: &Context, call: &Invocation<'_>, output: Option<&Value>) {
        for layer in self.layers.iter().rev() {
            layer.after(ctx, call, output);
        }
    }

    /// Ask the chain what to do about an error, innermost layer first.
    /// The first layer that does not rethrow decides.
    #[must_use]
    pub fn on_error(&self, ctx: &Context, call: &Invocation<'_>, error: &TaskError) -> ErrorAction {
        for layer in self.layers.iter().rev() {
            match layer.on_error(ctx, call, error) {
                ErrorAction::Rethrow => continue,
                decided => return decided,
            }
        }
        ErrorAction::Rethrow
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|layer| layer.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        action: ErrorAction,
    }

    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn before(&self, _ctx: &Context, _call: &Invocation<'_>) -> Result<(), TaskError> {
            self.log.lock().unwrap().push(format!("before:{}", self.label));
            Ok(())
        }

        fn after(&self, _ctx: &Context, _call: &Invocation<'_>, _output: Option<&Value>) {
            self.log.lock().unwrap().push(format!("after:{}", self.label));
        }

        fn on_error(&self, _ctx: &Context, _call: &Invocation<'_>, _error: &TaskError) -> ErrorAction {
            self.log.lock().unwrap().push(format!("error:{}", self.label));
            self.action
        }
    }

    fn node() -> NodeInfo {
        NodeInfo {
            node_id: NodeId::new(),
            task_id: TaskId::new(),
            name: "add1".to_string(),
            path: "main/add1".to_string(),
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>, actions: &[(&'static str, ErrorAction)]) -> MiddlewareChain {
        let layers: Vec<Arc<dyn Middleware>> = actions
            .iter()
            .map(|(label, action)| {
                Arc::new(Recorder {
                    label: *label,
                    log: Arc::clone(log),
                    action: *action,
                }) as Arc<dyn Middleware>
            })
            .collect();
        MiddlewareChain::layered(&layers, &[])
    }

    #[test]
    fn test_wrap_unwrap_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(
            &log,
            &[("a", ErrorAction::Rethrow), ("b", ErrorAction::Rethrow)],
        );
        let ctx = Context::new();
        let info = node();
        let call = Invocation {
            node: &info,
            inputs: &[],
            attempt: 1,
        };

        chain.before(&ctx, &call).unwrap();
        chain.after(&ctx, &call, None);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "after:b", "after:a"]
        );
    }

    #[test]
    fn test_on_error_innermost_decides() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(
            &log,
            &[("outer", ErrorAction::Retry), ("inner", ErrorAction::Suppress)],
        );
        let ctx = Context::new();
        let info = node();
        let call = Invocation {
            node: &info,
            inputs: &[],
            attempt: 1,
        };

        let action = chain.on_error(&ctx, &call, &TaskError::new("boom"));
        assert_eq!(action, ErrorAction::Suppress);
        assert_eq!(*log.lock().unwrap(), vec!["error:inner"]);
    }

    #[test]
    fn test_on_error_falls_through_to_outer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(
            &log,
            &[("outer", ErrorAction::Retry), ("inner", ErrorAction::Rethrow)],
        );
        let ctx = Context::new();
        let info = node();
        let call = Invocation {
            node: &info,
            inputs: &[],
            attempt: 1,
        };

        assert_eq!(
            chain.on_error(&ctx, &call, &TaskError::new("boom")),
            ErrorAction::Retry
        );
        assert_eq!(*log.lock().unwrap(), vec!["error:inner", "error:outer"]);
    }

    #[test]
    fn test_empty_chain_rethrows() {
        let chain = MiddlewareChain::new();
        let ctx = Context::new();
        let info = node();
        let call = Invocation {
            node: &info,
            inputs: &[],
            attempt: 1,
        };
        assert!(chain.is_empty());
        assert_eq!(
            chain.on_error(&ctx, &call, &TaskError::new("boom")),
            ErrorAction::Rethrow
        );
    }
}
