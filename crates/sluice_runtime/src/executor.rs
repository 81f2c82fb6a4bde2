//! Execution units.
//!
//! Every bound task instance is driven by one unit: gather an input tuple,
//! invoke the body through the middleware chain, push the result, repeat
//! until an input ends or the run is cancelled. The output channel is always
//! closed when the unit stops, so downstream units observe end-of-stream.

use crate::backpressure::{EdgePolicy, PushOutcome};
use crate::monitor::RunMetrics;
use crate::pool::{WorkerPool, panic_message};
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use sluice_channel::{Channel, ChannelError, Reader};
use sluice_core::{
    Context, ErrorAction, FlowError, Invocation, Middleware, MiddlewareChain, NodeInfo, TaskError,
    Value,
};
use sluice_plan::{BodyResult, FanInPolicy, Task, TaskBody, TaskInstance};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// How a unit stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// Inputs drained, or every reader of the output detached
    Completed,
    /// Cancellation was observed
    Cancelled,
    /// Unrecovered error
    Failed(FlowError),
}

/// Terminal report of one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    /// Instance that stopped
    pub node: NodeInfo,
    /// How it stopped
    pub exit: UnitExit,
}

/// Outcome of one invocation through the chain
enum Step {
    Output(Option<Value>),
    Suppressed,
    Stop(UnitExit),
}

/// Borrowed view of an instance while its unit runs
struct Unit<'a> {
    node: &'a NodeInfo,
    task: &'a Task,
    output: Option<&'a Channel<Value>>,
    chain: MiddlewareChain,
}

/// Runs task instances of one run
pub struct Executor {
    ctx: Context,
    middleware: Vec<Arc<dyn Middleware>>,
    pool: WorkerPool,
    edges: EdgePolicy,
    metrics: Arc<RunMetrics>,
}

impl Executor {
    /// Create an executor. The context's middleware is captured once here.
    #[must_use]
    pub fn new(ctx: Context, pool: WorkerPool, edges: EdgePolicy, metrics: Arc<RunMetrics>) -> Self {
        let middleware = ctx.middleware();
        Self {
            ctx,
            middleware,
            pool,
            edges,
            metrics,
        }
    }

    /// Drive one instance until it stops
    pub async fn run_unit(&self, instance: TaskInstance) -> UnitReport {
        let TaskInstance {
            node,
            task,
            mut inputs,
            output,
            middleware,
        } = instance;

        let unit = Unit {
            node: &node,
            task: &task,
            output: output.as_ref(),
            chain: MiddlewareChain::layered(&self.middleware, &middleware),
        };
        tracing::debug!(node = %node.path, kind = task.body().kind(), "unit started");

        let exit = match task.body() {
            TaskBody::Source(_) => self.run_source(&unit).await,
            TaskBody::Blocking(_) | TaskBody::Suspending(_) => {
                self.run_mapper(&unit, &mut inputs).await
            }
        };

        if let Some(output) = &output {
            output.close();
        }
        drop(inputs);

        match &exit {
            UnitExit::Completed => {
                self.metrics.record_unit_completed();
                tracing::debug!(node = %node.path, "unit completed");
            }
            UnitExit::Cancelled => {
                self.metrics.record_unit_cancelled();
                tracing::debug!(node = %node.path, "unit cancelled");
            }
            UnitExit::Failed(err) => {
                self.metrics.record_unit_failed();
                tracing::warn!(node = %node.path, error = %err, "unit failed");
            }
        }
        UnitReport { node, exit }
    }

    async fn run_mapper(&self, unit: &Unit<'_>, inputs: &mut [Reader<Value>]) -> UnitExit {
        let mut ended = vec![false; inputs.len()];
        loop {
            if self.ctx.is_cancelled() {
                return UnitExit::Cancelled;
            }
            if unit.output.is_some_and(Channel::is_abandoned) {
                return UnitExit::Completed;
            }

            let gathered = tokio::select! {
                biased;
                () = self.ctx.cancelled() => return UnitExit::Cancelled,
                gathered = gather(inputs, &mut ended, unit.task.fan_in()) => gathered,
            };
            let Some(args) = gathered else {
                return UnitExit::Completed;
            };
            tracing::trace!(node = %unit.node.path, inputs = args.len(), "inputs gathered");

            match self.invoke(unit, args).await {
                Step::Output(Some(item)) => {
                    if let Some(exit) = self.emit(unit, item).await {
                        return exit;
                    }
                }
                Step::Output(None) | Step::Suppressed => {}
                Step::Stop(exit) => return exit,
            }
        }
    }

    /// One invocation, retried while the chain asks for it
    async fn invoke(&self, unit: &Unit<'_>, args: Vec<Value>) -> Step {
        let mut attempt = 1;
        loop {
            let call = Invocation {
                node: unit.node,
                inputs: &args,
                attempt,
            };
            self.metrics.record_invocation();

            let result = match unit.chain.before(&self.ctx, &call) {
                Ok(()) => tokio::select! {
                    biased;
                    () = self.ctx.cancelled() => return Step::Stop(UnitExit::Cancelled),
                    result = self.call_body(unit.task, args.clone()) => result,
                },
                Err(err) => Err(err),
            };

            let error = match result {
                Ok(output) => {
                    unit.chain.after(&self.ctx, &call, output.as_ref());
                    self.metrics.record_success();
                    return Step::Output(output);
                }
                Err(error) => error,
            };

            match unit.chain.on_error(&self.ctx, &call, &error) {
                ErrorAction::Retry => {
                    if self.ctx.is_cancelled() {
                        return Step::Stop(UnitExit::Cancelled);
                    }
                    self.metrics.record_retry();
                    tracing::debug!(node = %unit.node.path, attempt, error = %error, "retrying invocation");
                    attempt += 1;
                }
                ErrorAction::Suppress => {
                    self.metrics.record_suppressed();
                    tracing::debug!(node = %unit.node.path, error = %error, "invocation error suppressed");
                    return Step::Suppressed;
                }
                ErrorAction::Rethrow => {
                    self.metrics.record_failure();
                    return Step::Stop(UnitExit::Failed(FlowError::TaskExecution {
                        node: unit.node.node_id,
                        name: unit.node.name.clone(),
                        inputs: args,
                        message: error.message().to_string(),
                    }));
                }
            }
        }
    }

    async fn call_body(&self, task: &Task, args: Vec<Value>) -> BodyResult {
        match task.body() {
            TaskBody::Blocking(body) => {
                let body = Arc::clone(body);
                let ctx = self.ctx.clone();
                self.pool.run(move || body.call(args, &ctx)).await?
            }
            TaskBody::Suspending(body) => AssertUnwindSafe(body.call(args, self.ctx.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(TaskError::new(format!(
                        "task panicked: {}",
                        panic_message(&*payload)
                    )))
                }),
            TaskBody::Source(_) => Err(TaskError::new("source bodies are pulled, not invoked")),
        }
    }

    /// Pull items from a source body. Each pulled item passes through the chain;
    /// a failed item can be suppressed but never retried.
    async fn run_source(&self, unit: &Unit<'_>) -> UnitExit {
        let TaskBody::Source(body) = unit.task.body() else {
            return UnitExit::Failed(FlowError::internal(format!(
                "task `{}` is not a source",
                unit.node.name
            )));
        };
        let opened = std::panic::catch_unwind(AssertUnwindSafe(|| body.open(&self.ctx)));
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(payload) => {
                return UnitExit::Failed(self.source_failure(
                    unit,
                    format!("task panicked: {}", panic_message(&*payload)),
                ));
            }
        };

        loop {
            if self.ctx.is_cancelled() {
                return UnitExit::Cancelled;
            }
            if unit.output.is_some_and(Channel::is_abandoned) {
                return UnitExit::Completed;
            }

            let pulled = tokio::select! {
                biased;
                () = self.ctx.cancelled() => return UnitExit::Cancelled,
                pulled = AssertUnwindSafe(stream.next()).catch_unwind() => pulled,
            };
            let item = match pulled {
                Ok(None) => return UnitExit::Completed,
                Ok(Some(item)) => item,
                Err(payload) => {
                    self.metrics.record_invocation();
                    self.metrics.record_failure();
                    return UnitExit::Failed(self.source_failure(
                        unit,
                        format!("task panicked: {}", panic_message(&*payload)),
                    ));
                }
            };

            let call = Invocation {
                node: unit.node,
                inputs: &[],
                attempt: 1,
            };
            self.metrics.record_invocation();
            let result = unit.chain.before(&self.ctx, &call).and(item);
            match result {
                Ok(item) => {
                    unit.chain.after(&self.ctx, &call, Some(&item));
                    self.metrics.record_success();
                    if let Some(exit) = self.emit(unit, item).await {
                        return exit;
                    }
                }
                Err(error) => match unit.chain.on_error(&self.ctx, &call, &error) {
                    ErrorAction::Retry | ErrorAction::Suppress => {
                        self.metrics.record_suppressed();
                        tracing::debug!(node = %unit.node.path, error = %error, "source item skipped");
                    }
                    ErrorAction::Rethrow => {
                        self.metrics.record_failure();
                        return UnitExit::Failed(self.source_failure(unit, error.message().to_string()));
                    }
                },
            }
        }
    }

    fn source_failure(&self, unit: &Unit<'_>, message: String) -> FlowError {
        FlowError::TaskExecution {
            node: unit.node.node_id,
            name: unit.node.name.clone(),
            inputs: Vec::new(),
            message,
        }
    }

    /// Push one result downstream. Returns the exit when the unit must stop.
    async fn emit(&self, unit: &Unit<'_>, item: Value) -> Option<UnitExit> {
        let output = unit.output?;
        let pushed = tokio::select! {
            biased;
            () = self.ctx.cancelled() => return Some(UnitExit::Cancelled),
            pushed = self.edges.push(output, item) => pushed,
        };
        match pushed {
            Ok(PushOutcome::Delivered) => {
                self.metrics.record_emit();
                tracing::trace!(node = %unit.node.path, channel = %output.id(), "item emitted");
                None
            }
            Ok(PushOutcome::Abandoned) => {
                tracing::debug!(node = %unit.node.path, "output abandoned by every reader");
                Some(UnitExit::Completed)
            }
            Err(ChannelError::CapacityTimeout { waited_ms }) => {
                Some(UnitExit::Failed(FlowError::ChannelCapacityTimeout {
                    node: unit.node.node_id,
                    name: unit.node.name.clone(),
                    waited_ms,
                }))
            }
            Err(ChannelError::Closed) => Some(UnitExit::Failed(FlowError::internal(format!(
                "output of `{}` closed while its unit was running",
                unit.node.path
            )))),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("middleware", &self.middleware.len())
            .field("pool", &self.pool)
            .field("edges", &self.edges)
            .finish_non_exhaustive()
    }
}

/// Read one item from every live input.
///
/// Reads run concurrently, so an input that ends is noticed even while
/// another one is still waiting. Returns `None` when the node must stop.
async fn gather(
    inputs: &mut [Reader<Value>],
    ended: &mut [bool],
    policy: FanInPolicy,
) -> Option<Vec<Value>> {
    let mut slots: Vec<Option<Value>> = vec![None; inputs.len()];
    let mut pending: FuturesUnordered<_> = inputs
        .iter_mut()
        .enumerate()
        .filter(|(slot, _)| !ended[*slot])
        .map(|(slot, reader)| async move { (slot, reader.recv().await) })
        .collect();

    while let Some((slot, item)) = pending.next().await {
        match item {
            Some(item) => slots[slot] = Some(item),
            None => {
                ended[slot] = true;
                if policy == FanInPolicy::ShortCircuit {
                    return None;
                }
            }
        }
    }
    drop(pending);

    if ended.iter().all(|done| *done) {
        return None;
    }
    Some(
        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Value::Null))
            .collect(),
    )
}
