//! Execution engine for flow runs.
//!
//! Binds a flow to its inputs, then hands every instance to one driver task
//! that polls all execution units together, collects the terminal output and
//! publishes the run state.

use crate::backpressure::EdgePolicy;
use crate::executor::{Executor, UnitExit, UnitReport};
use crate::monitor::{Metrics, RunMetrics};
use crate::pool::{WorkerPool, default_workers};
use crate::scheduler::{RunStatus, Scheduler};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use sluice_channel::{Capacity, Channel, Reader, TryRecv};
use sluice_core::{CancelReason, Context, FlowError, FlowResult, RunId, Value};
use sluice_plan::{BoundFlow, Flow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// What the run does after the first unrecovered error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Unrelated branches run to exhaustion
    #[default]
    Drain,
    /// Cancel every unit on the first failure
    CancelRun,
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Document is not valid configuration JSON
    #[error("invalid engine configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// Value out of range
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Offending key
        field: &'static str,
        /// Why it was rejected
        reason: &'static str,
    },
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Blocking bodies running at once
    pub max_blocking_workers: usize,
    /// Items an edge channel retains before producers wait; `None` is unbounded
    pub edge_capacity: Option<usize>,
    /// Longest wait for edge capacity before the producer fails
    pub push_timeout_ms: Option<u64>,
    /// Cancel the run after this long
    pub deadline_ms: Option<u64>,
    /// Reaction to the first failure
    pub failure_policy: FailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_blocking_workers: default_workers(),
            edge_capacity: None,
            push_timeout_ms: None,
            deadline_ms: None,
            failure_policy: FailurePolicy::Drain,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing keys take their defaults
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for malformed JSON or out-of-range values
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first bad key
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_blocking_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "max_blocking_workers",
                reason: "must be at least 1",
            });
        }
        if self.edge_capacity == Some(0) {
            return Err(ConfigError::Invalid {
                field: "edge_capacity",
                reason: "must be at least 1 when set",
            });
        }
        Ok(())
    }

    /// Set worker count
    #[must_use]
    pub fn with_max_blocking_workers(mut self, workers: usize) -> Self {
        self.max_blocking_workers = workers;
        self
    }

    /// Bound every edge channel
    #[must_use]
    pub fn with_edge_capacity(mut self, capacity: usize) -> Self {
        self.edge_capacity = Some(capacity);
        self
    }

    /// Fail producers that wait longer than `ms` for capacity
    #[must_use]
    pub fn with_push_timeout_ms(mut self, ms: u64) -> Self {
        self.push_timeout_ms = Some(ms);
        self
    }

    /// Cancel runs after `ms`
    #[must_use]
    pub fn with_deadline_ms(mut self, ms: u64) -> Self {
        self.deadline_ms = Some(ms);
        self
    }

    /// Set failure policy
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    fn edge_policy(&self) -> EdgePolicy {
        EdgePolicy::new(
            Capacity::from_bound(self.edge_capacity),
            self.push_timeout_ms.map(Duration::from_millis),
        )
    }
}

/// Final report of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Run identity
    pub run_id: RunId,
    /// Terminal state
    pub status: RunStatus,
    /// Items observed on the terminal output, in order
    pub output: Vec<Value>,
    /// First error; the cancellation error for cancelled runs
    pub error: Option<FlowError>,
    /// Counters at the end of the run
    pub metrics: Metrics,
}

impl RunOutcome {
    /// Output on success, the terminal error otherwise
    ///
    /// # Errors
    ///
    /// Returns the run's first error
    pub fn into_result(self) -> FlowResult<Vec<Value>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.output),
        }
    }

    /// Whether the run succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Handle on a running flow
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    ctx: Context,
    status: watch::Receiver<RunStatus>,
    metrics: Arc<RunMetrics>,
    driver: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Run identity
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Current state
    #[must_use]
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Wait for the next state change and return the new state
    pub async fn status_changed(&mut self) -> RunStatus {
        if self.status.changed().await.is_err() {
            return *self.status.borrow();
        }
        *self.status.borrow_and_update()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.ctx.cancel(CancelReason::Requested);
    }

    /// Context driving this run
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Live counters
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot()
    }

    /// Wait for the run to finish
    pub async fn wait(self) -> RunOutcome {
        match self.driver.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(run_id = %self.run_id, error = %err, "run driver stopped abnormally");
                RunOutcome {
                    run_id: self.run_id,
                    status: RunStatus::Failed,
                    output: Vec::new(),
                    error: Some(FlowError::internal(format!("run driver stopped: {err}"))),
                    metrics: self.metrics.snapshot(),
                }
            }
        }
    }
}

/// Flow execution engine
///
/// Runs started from one engine share its worker pool.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    pool: WorkerPool,
}

impl Engine {
    /// Create an engine
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let pool = WorkerPool::new(config.max_blocking_workers);
        Self { config, pool }
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bind `flow` to `inputs` and start running it under `ctx`.
    ///
    /// Must be called inside a tokio runtime. Composition errors are reported
    /// here; everything else ends up in the [`RunOutcome`].
    ///
    /// # Errors
    ///
    /// Returns `ContextInUse` for a context that already drove a run, and
    /// `Composition` errors when the inputs do not fit the flow
    #[tracing::instrument(skip_all, fields(flow = %flow.name()))]
    pub fn run(&self, flow: &Flow, inputs: Vec<Channel<Value>>, ctx: &Context) -> FlowResult<RunHandle> {
        if ctx.is_started() {
            return Err(FlowError::ContextInUse);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| FlowError::internal("runs must be started inside a tokio runtime"))?;

        let bound = flow.bind(&inputs, self.config.edge_policy().capacity())?;
        let run_id = RunId::new();
        ctx.begin_run(run_id)?;

        let metrics = Arc::new(RunMetrics::new());
        let (status_tx, status_rx) = watch::channel(RunStatus::Pending);
        let executor = Executor::new(
            ctx.clone(),
            self.pool.clone(),
            self.config.edge_policy(),
            Arc::clone(&metrics),
        );
        let driver = Driver {
            run_id,
            ctx: ctx.clone(),
            executor,
            metrics: Arc::clone(&metrics),
            status: status_tx,
            deadline: self.config.deadline_ms.map(Duration::from_millis),
            failure_policy: self.config.failure_policy,
        };

        tracing::debug!(%run_id, units = bound.instances.len(), "run starting");
        let span = tracing::debug_span!("run", %run_id);
        let driver = runtime.spawn(driver.drive(bound).instrument(span));

        Ok(RunHandle {
            run_id,
            ctx: ctx.clone(),
            status: status_rx,
            metrics,
            driver,
        })
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Run `flow` with the default engine configuration
///
/// # Errors
///
/// See [`Engine::run`]
pub fn run(flow: &Flow, inputs: Vec<Channel<Value>>, ctx: &Context) -> FlowResult<RunHandle> {
    Engine::default().run(flow, inputs, ctx)
}

enum Done {
    Unit(UnitReport),
    Output { items: Vec<Value>, cancelled: bool },
}

struct Driver {
    run_id: RunId,
    ctx: Context,
    executor: Executor,
    metrics: Arc<RunMetrics>,
    status: watch::Sender<RunStatus>,
    deadline: Option<Duration>,
    failure_policy: FailurePolicy,
}

impl Driver {
    async fn drive(self, bound: BoundFlow) -> RunOutcome {
        let BoundFlow { instances, output } = bound;

        let mut scheduler = Scheduler::new();
        for instance in &instances {
            if let Err(err) = scheduler.add_unit(instance.node.node_id, instance.node.path.clone()) {
                tracing::warn!(error = %err, "unit not registered");
            }
        }
        if let Err(err) = scheduler.start() {
            tracing::warn!(error = %err, "scheduler refused to start");
        }
        self.status.send_replace(RunStatus::Running);

        let mut pending: FuturesUnordered<BoxFuture<'_, Done>> = instances
            .into_iter()
            .map(|instance| self.executor.run_unit(instance).map(Done::Unit).boxed())
            .collect();
        if let Some(reader) = output {
            pending.push(
                collect_output(reader, self.ctx.clone())
                    .map(|(items, cancelled)| Done::Output { items, cancelled })
                    .boxed(),
            );
        }

        let deadline = async {
            match self.deadline {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);
        let mut deadline_passed = false;
        let mut items = Vec::new();

        loop {
            tokio::select! {
                done = pending.next() => match done {
                    Some(Done::Unit(report)) => self.record(&mut scheduler, report),
                    Some(Done::Output { items: collected, cancelled }) => {
                        if cancelled {
                            scheduler.mark_interrupted();
                        }
                        items = collected;
                    }
                    None => break,
                },
                () = &mut deadline, if !deadline_passed => {
                    deadline_passed = true;
                    tracing::warn!(run_id = %self.run_id, "deadline passed, cancelling run");
                    self.ctx.cancel(CancelReason::Deadline);
                }
            }
        }
        drop(pending);

        let status = match scheduler.finish(self.ctx.cancel_reason()) {
            Ok(status) => status,
            Err(err) => {
                tracing::error!(error = %err, "run finished in an unexpected state");
                RunStatus::Failed
            }
        };
        self.status.send_replace(status);

        let metrics = self.metrics.snapshot();
        tracing::debug!(
            run_id = %self.run_id,
            %status,
            outputs = items.len(),
            invocations = metrics.invocations,
            "run finished"
        );
        RunOutcome {
            run_id: self.run_id,
            status,
            output: items,
            error: scheduler.take_error(),
            metrics,
        }
    }

    fn record(&self, scheduler: &mut Scheduler, report: UnitReport) {
        let node_id = report.node.node_id;
        let recorded = match report.exit {
            UnitExit::Completed => scheduler.mark_complete(node_id),
            UnitExit::Cancelled => scheduler.mark_cancelled(node_id),
            UnitExit::Failed(err) => {
                let external_cancel = self
                    .ctx
                    .cancel_reason()
                    .is_some_and(|reason| reason != CancelReason::Failure);
                if external_cancel {
                    tracing::debug!(node = %report.node.path, error = %err, "failure after cancellation");
                    scheduler.mark_cancelled(node_id)
                } else {
                    scheduler.mark_failed(node_id, err.clone()).map(|first| {
                        if first {
                            tracing::error!(node = %report.node.path, error = %err, "run failed");
                            self.status.send_replace(RunStatus::Failed);
                            if self.failure_policy == FailurePolicy::CancelRun {
                                self.ctx.cancel(CancelReason::Failure);
                            }
                        }
                    })
                }
            }
        };
        if let Err(err) = recorded {
            tracing::warn!(error = %err, "unit report ignored");
        }
    }
}

/// Collect the terminal output. On cancellation, whatever is already queued
/// is kept and collection stops; the flag reports that it was cut short.
async fn collect_output(mut reader: Reader<Value>, ctx: Context) -> (Vec<Value>, bool) {
    let mut items = Vec::new();
    loop {
        tokio::select! {
            biased;
            item = reader.recv() => match item {
                Some(item) => items.push(item),
                None => break,
            },
            () = ctx.cancelled() => {
                loop {
                    match reader.try_recv() {
                        TryRecv::Item(item) => items.push(item),
                        TryRecv::Ended => return (items, false),
                        TryRecv::Empty => return (items, true),
                    }
                }
            }
        }
    }
    (items, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_plan::Task;

    fn add1_flow() -> Flow {
        let add1 = Task::blocking("add1", 1, |x: i64| Ok(x + 1)).unwrap();
        Flow::define("main", 1, |b| b.input(0)?.pipe(&add1)).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert!(config.max_blocking_workers >= 1);
        assert_eq!(config.edge_capacity, None);
        assert_eq!(config.failure_policy, FailurePolicy::Drain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config = EngineConfig::from_json(
            r#"{"edge_capacity": 8, "deadline_ms": 500, "failure_policy": "cancel_run"}"#,
        )
        .unwrap();
        assert_eq!(config.edge_capacity, Some(8));
        assert_eq!(config.deadline_ms, Some(500));
        assert_eq!(config.failure_policy, FailurePolicy::CancelRun);
        assert_eq!(config.push_timeout_ms, None);
        assert_eq!(config.max_blocking_workers, default_workers());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"max_blocking_workers": 0}"#),
            Err(ConfigError::Invalid {
                field: "max_blocking_workers",
                ..
            })
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"edge_capacity": 0}"#),
            Err(ConfigError::Invalid { field: "edge_capacity", .. })
        ));
        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_config_builders() {
        let config = EngineConfig::default()
            .with_max_blocking_workers(3)
            .with_edge_capacity(4)
            .with_push_timeout_ms(20)
            .with_deadline_ms(1_000)
            .with_failure_policy(FailurePolicy::CancelRun);
        assert_eq!(config.max_blocking_workers, 3);
        assert_eq!(config.edge_policy().capacity(), Capacity::Bounded(4));
        assert_eq!(
            config.edge_policy().push_timeout(),
            Some(Duration::from_millis(20))
        );
    }

    #[tokio::test]
    async fn test_run_reports_status() {
        let ctx = Context::new();
        let mut handle = Engine::default()
            .run(&add1_flow(), vec![Channel::from_values(vec![json!(1)])], &ctx)
            .unwrap();
        assert_eq!(ctx.run_id(), Some(handle.run_id()));

        let mut status = handle.status();
        while !status.is_terminal() {
            status = handle.status_changed().await;
        }
        assert_eq!(status, RunStatus::Succeeded);

        let outcome = handle.wait().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.metrics.units_completed, 1);
        assert_eq!(outcome.into_result(), Ok(vec![json!(2)]));
    }

    #[tokio::test]
    async fn test_context_reuse_rejected() {
        let ctx = Context::new();
        let flow = add1_flow();
        let first = run(&flow, vec![Channel::from_values(vec![json!(1)])], &ctx).unwrap();
        let err = run(&flow, vec![Channel::from_values(vec![json!(1)])], &ctx).unwrap_err();
        assert_eq!(err, FlowError::ContextInUse);
        first.wait().await;
    }

    #[tokio::test]
    async fn test_composition_error_leaves_context_unused() {
        let ctx = Context::new();
        let err = run(&add1_flow(), Vec::new(), &ctx).unwrap_err();
        assert!(err.is_composition());
        assert!(!ctx.is_started());
    }

    #[test]
    fn test_run_outside_runtime() {
        let ctx = Context::new();
        let err = run(&add1_flow(), vec![Channel::unbounded()], &ctx).unwrap_err();
        assert!(matches!(err, FlowError::Internal { .. }));
        assert!(!ctx.is_started());
    }
}
