//! Per-run context.
//!
//! A context is created once per run and shared by reference with every node
//! instance of that run. It carries the cancellation signal, the middleware
//! chain and a key/value store.

use crate::error::{CancelReason, FlowError, FlowResult};
use crate::id::RunId;
use crate::middleware::Middleware;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

struct ContextInner {
    cancellation: CancellationToken,
    cancel_reason: OnceLock<CancelReason>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    store: RwLock<IndexMap<String, Value>>,
    run_id: OnceLock<RunId>,
    started: AtomicBool,
}

/// Shared run state: cancellation flag, middleware chain and store
///
/// Cloning a context is cheap and yields another handle to the same state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a fresh context
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancellation: CancellationToken::new(),
                cancel_reason: OnceLock::new(),
                middleware: RwLock::new(Vec::new()),
                store: RwLock::new(IndexMap::new()),
                run_id: OnceLock::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Append a middleware to the chain
    ///
    /// # Errors
    ///
    /// Returns `ContextInUse` once a run has started with this context
    pub fn use_middleware<M>(&self, middleware: M) -> FlowResult<()>
    where
        M: Middleware + 'static,
    {
        self.use_shared_middleware(Arc::new(middleware))
    }

    /// Append an already shared middleware to the chain
    ///
    /// # Errors
    ///
    /// Returns `ContextInUse` once a run has started with this context
    pub fn use_shared_middleware(&self, middleware: Arc<dyn Middleware>) -> FlowResult<()> {
        if self.is_started() {
            return Err(FlowError::ContextInUse);
        }
        self.inner
            .middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
        Ok(())
    }

    /// Snapshot of the registered middleware, in registration order
    #[must_use]
    pub fn middleware(&self) -> Vec<Arc<dyn Middleware>> {
        self.inner
            .middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bind this context to a run. The middleware chain is frozen from here on.
    ///
    /// # Errors
    ///
    /// Returns `ContextInUse` if the context already drives a run
    pub fn begin_run(&self, run_id: RunId) -> FlowResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(FlowError::ContextInUse);
        }
        let _ = self.inner.run_id.set(run_id);
        Ok(())
    }

    /// Whether a run has started with this context
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Run this context is bound to, if any
    #[must_use]
    pub fn run_id(&self) -> Option<RunId> {
        self.inner.run_id.get().copied()
    }

    /// Request cancellation. Only the first reason is kept; the flag never reverts.
    pub fn cancel(&self, reason: CancelReason) {
        if self.inner.cancel_reason.set(reason).is_ok() {
            tracing::debug!(run_id = ?self.run_id(), %reason, "cancellation requested");
        }
        self.inner.cancellation.cancel();
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Reason recorded by the first `cancel` call
    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.inner.cancel_reason.get().copied()
    }

    /// Future resolving once cancellation is requested
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancellation.cancelled()
    }

    /// Token observing this context's cancellation
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    /// Read a value from the store
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Insert a value, returning the previous one
    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value)
    }

    /// Remove a value
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(key)
    }

    /// Whether the store holds `key`
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Read-modify-write a value while holding the store lock.
    ///
    /// Concurrent writers that need atomic updates must go through this method.
    pub fn update<F>(&self, key: &str, f: F) -> Value
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let mut store = self
            .inner
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let next = f(store.get(key));
        store.insert(key.to_string(), next.clone());
        next
    }

    /// Copy of the whole store
    #[must_use]
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("run_id", &self.run_id())
            .field("cancelled", &self.is_cancelled())
            .field("middleware", &self.middleware().len())
            .finish_non_exhaustive()
    }
}
