//! End-to-end runs across the channel, plan and runtime layers.

use futures::stream::{self, StreamExt};
use proptest::prelude::*;
use serde_json::{Value, json};
use sluice_channel::Channel;
use sluice_core::{
    CancelReason, Context, ErrorAction, FlowError, Invocation, Middleware, TaskError,
};
use sluice_plan::{FanInPolicy, Flow, Task, ops};
use sluice_runtime::{
    Engine, EngineConfig, FailurePolicy, RetryMiddleware, RunStatus, TracingMiddleware, run,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn add1() -> Task {
    Task::blocking("add1", 1, |x: i64| Ok(x + 1)).unwrap()
}

fn square() -> Task {
    Task::blocking("square", 1, |x: i64| Ok(x * x)).unwrap()
}

fn multiply() -> Task {
    Task::blocking("multiply", 2, |(a, b): (i64, i64)| Ok(a * b)).unwrap()
}

fn sub_flow() -> Flow {
    Flow::define("sub_flow", 1, |b| b.input(0)?.pipe(&add1())?.pipe(&square())).unwrap()
}

fn values(items: &[i64]) -> Channel<Value> {
    Channel::from_values(items.iter().map(|x| json!(x)).collect())
}

#[tokio::test]
async fn test_add1_over_values() {
    let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&add1())).unwrap();
    let outcome = run(&flow, vec![values(&[1, 2, 3])], &Context::new())
        .unwrap()
        .wait()
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.into_result(), Ok(vec![json!(2), json!(3), json!(4)]));
}

#[tokio::test]
async fn test_identity_round_trip() {
    let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&ops::identity()?)).unwrap();
    let items = vec![json!("a"), json!({"k": 1}), json!(null), json!([1, 2])];
    let outcome = run(&flow, vec![Channel::from_values(items.clone())], &Context::new())
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.into_result(), Ok(items));
}

#[tokio::test]
async fn test_nested_flow_instances() {
    let sub = sub_flow();
    let twice = Flow::define("twice", 1, |b| {
        let x = b.input(0)?;
        b.group([x, x]).each(&sub)?.fan_in(&ops::merge(2)?)
    })
    .unwrap();
    let outcome = run(&twice, vec![values(&[5])], &Context::new()).unwrap().wait().await;
    assert_eq!(outcome.into_result(), Ok(vec![json!([36, 36])]));

    let product = Flow::define("main", 1, |b| {
        let x = b.input(0)?;
        let left = x.pipe(&sub)?;
        let right = x.pipe(&sub)?;
        b.group([left, right]).pipe(&multiply())?.single()
    })
    .unwrap();
    let outcome = run(&product, vec![values(&[5])], &Context::new()).unwrap().wait().await;
    assert_eq!(outcome.into_result(), Ok(vec![json!(1296)]));
}

#[tokio::test]
async fn test_fan_in_pairs_in_order() {
    let flow = Flow::define("main", 2, |b| b.inputs().fan_in(&ops::merge(2)?)).unwrap();
    let a = Channel::from_values(vec![json!("a1"), json!("a2")]);
    let b = Channel::from_values(vec![json!("b1"), json!("b2")]);
    let outcome = run(&flow, vec![a, b], &Context::new()).unwrap().wait().await;
    assert_eq!(
        outcome.into_result(),
        Ok(vec![json!(["a1", "b1"]), json!(["a2", "b2"])])
    );
}

#[tokio::test]
async fn test_fan_in_end_policies() {
    let short = ops::merge(2).unwrap();
    let longest = short.clone().with_fan_in(FanInPolicy::Longest);

    for (task, expected) in [(short, 1), (longest, 3)] {
        let flow = Flow::define("main", 2, |b| b.inputs().fan_in(&task)).unwrap();
        let outcome = run(&flow, vec![values(&[1]), values(&[1, 2, 3])], &Context::new())
            .unwrap()
            .wait()
            .await;
        let output = outcome.into_result().unwrap();
        assert_eq!(output.len(), expected);
        if expected == 3 {
            assert_eq!(output[2], json!([null, 3]));
        }
    }
}

#[tokio::test]
async fn test_failure_on_second_invocation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let flaky = Task::blocking("flaky", 1, move |x: i64| {
        if counter.fetch_add(1, Ordering::SeqCst) == 1 {
            anyhow::bail!("second call fails");
        }
        Ok(x * 10)
    })
    .unwrap();
    let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&flaky)?.pipe(&add1())).unwrap();

    let outcome = run(&flow, vec![values(&[1, 2, 3])], &Context::new())
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.output, vec![json!(11)]);
    let Some(FlowError::TaskExecution { name, inputs, .. }) = outcome.error else {
        panic!("expected task failure");
    };
    assert_eq!(name, "flaky");
    assert_eq!(inputs, vec![json!(2)]);
}

#[tokio::test]
async fn test_failure_policy_cancel_run() {
    let boom = Task::blocking("boom", 1, |_: i64| -> anyhow::Result<i64> {
        anyhow::bail!("boom")
    })
    .unwrap();
    let flow = Flow::define("main", 2, |b| {
        b.input(0)?.pipe(&boom)?;
        b.input(1)?.pipe(&ops::identity()?)
    })
    .unwrap();

    let engine = Engine::new(EngineConfig::default().with_failure_policy(FailurePolicy::CancelRun));
    let ctx = Context::new();
    let never_closed = Channel::unbounded();
    let outcome = engine
        .run(&flow, vec![values(&[1]), never_closed], &ctx)
        .unwrap()
        .wait()
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(ctx.cancel_reason(), Some(CancelReason::Failure));
    assert!(matches!(outcome.error, Some(FlowError::TaskExecution { .. })));
}

#[tokio::test]
async fn test_drain_reports_failure_while_siblings_run() {
    let boom = Task::blocking("boom", 1, |_: i64| -> anyhow::Result<i64> {
        anyhow::bail!("boom")
    })
    .unwrap();
    let flow = Flow::define("main", 2, |b| {
        b.input(0)?.pipe(&boom)?;
        b.input(1)?.pipe(&ops::identity()?)
    })
    .unwrap();

    let sibling = Channel::unbounded();
    let mut handle = run(&flow, vec![values(&[1]), sibling.clone()], &Context::new()).unwrap();
    let failed = tokio::time::timeout(Duration::from_secs(1), async {
        while handle.status() != RunStatus::Failed {
            handle.status_changed().await;
        }
    })
    .await;
    assert!(failed.is_ok(), "status never became Failed");

    // The unrelated branch keeps draining under the default policy.
    sibling.push(json!(5)).await.unwrap();
    sibling.close();
    let outcome = handle.wait().await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.output, vec![json!(5)]);
    assert_eq!(outcome.metrics.units_failed, 1);
    assert_eq!(outcome.metrics.units_cancelled, 0);
    assert!(matches!(outcome.error, Some(FlowError::TaskExecution { .. })));
}

#[tokio::test]
async fn test_cancel_run_without_tasks() {
    let flow = Flow::define("main", 1, |b| b.input(0)).unwrap();
    let input = Channel::unbounded();
    let handle = run(&flow, vec![input.clone()], &Context::new()).unwrap();

    input.push(json!(1)).await.unwrap();
    handle.cancel();
    let outcome = handle.wait().await;

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(outcome.output, vec![json!(1)]);
    assert_eq!(
        outcome.error,
        Some(FlowError::Cancelled {
            reason: CancelReason::Requested
        })
    );
}

#[tokio::test]
async fn test_cancel_stops_run() {
    let input = Channel::unbounded();
    let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&add1())).unwrap();
    let handle = run(&flow, vec![input.clone()], &Context::new()).unwrap();

    input.push(json!(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();
    handle.cancel();

    let outcome = handle.wait().await;
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(outcome.output, vec![json!(2)]);
    assert_eq!(
        outcome.error,
        Some(FlowError::Cancelled {
            reason: CancelReason::Requested
        })
    );
}

#[tokio::test]
async fn test_deadline_cancels() {
    let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&add1())).unwrap();
    let engine = Engine::new(EngineConfig::default().with_deadline_ms(30));
    let outcome = engine
        .run(&flow, vec![Channel::unbounded()], &Context::new())
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(
        outcome.into_result(),
        Err(FlowError::Cancelled {
            reason: CancelReason::Deadline
        })
    );
}

#[tokio::test]
async fn test_capacity_timeout_fails_producer() {
    let slow = Task::suspending("slow", 1, |x: i64| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(x)
    })
    .unwrap();
    let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&add1())?.pipe(&slow)).unwrap();
    let engine = Engine::new(
        EngineConfig::default()
            .with_edge_capacity(1)
            .with_push_timeout_ms(20),
    );
    let outcome = engine
        .run(&flow, vec![values(&[1, 2, 3, 4])], &Context::new())
        .unwrap()
        .wait()
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    let Some(FlowError::ChannelCapacityTimeout { name, waited_ms, .. }) = outcome.error else {
        panic!("expected capacity timeout, got {:?}", outcome.error);
    };
    assert_eq!(name, "add1");
    assert_eq!(waited_ms, 20);
}

#[tokio::test]
async fn test_retry_then_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let flaky = Task::blocking("flaky", 1, move |x: i64| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            anyhow::bail!("transient");
        }
        Ok(x)
    })
    .unwrap();
    let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&flaky)).unwrap();

    let ctx = Context::new();
    ctx.use_middleware(RetryMiddleware::new(3)).unwrap();
    let outcome = run(&flow, vec![values(&[7])], &ctx).unwrap().wait().await;

    assert_eq!(outcome.metrics.retries, 2);
    assert_eq!(outcome.metrics.invocations, 3);
    assert_eq!(outcome.into_result(), Ok(vec![json!(7)]));
}

struct SuppressOdd;

impl Middleware for SuppressOdd {
    fn on_error(&self, _ctx: &Context, call: &Invocation<'_>, _error: &TaskError) -> ErrorAction {
        if call.inputs.first().and_then(Value::as_i64).is_some_and(|x| x % 2 == 1) {
            ErrorAction::Suppress
        } else {
            ErrorAction::Rethrow
        }
    }
}

#[tokio::test]
async fn test_flow_middleware_suppresses() {
    let even_only = Task::blocking("even_only", 1, |x: i64| {
        anyhow::ensure!(x % 2 == 0, "odd input {x}");
        Ok(x)
    })
    .unwrap();
    let flow = Flow::builder("main", 1)
        .middleware(SuppressOdd)
        .build(|b| b.input(0)?.pipe(&even_only))
        .unwrap();

    let outcome = run(&flow, vec![values(&[1, 2, 3, 4])], &Context::new())
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.metrics.suppressed, 2);
    assert_eq!(outcome.into_result(), Ok(vec![json!(2), json!(4)]));
}

struct Recorder {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Middleware for Recorder {
    fn before(&self, _ctx: &Context, _call: &Invocation<'_>) -> Result<(), TaskError> {
        self.log.lock().unwrap().push(format!("before:{}", self.label));
        Ok(())
    }

    fn after(&self, _ctx: &Context, _call: &Invocation<'_>, _output: Option<&Value>) {
        self.log.lock().unwrap().push(format!("after:{}", self.label));
    }
}

#[tokio::test]
async fn test_context_then_flow_middleware_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let flow = Flow::builder("main", 1)
        .middleware(Recorder {
            label: "flow",
            log: Arc::clone(&log),
        })
        .build(|b| b.input(0)?.pipe(&add1()))
        .unwrap();
    let ctx = Context::new();
    ctx.use_middleware(Recorder {
        label: "context",
        log: Arc::clone(&log),
    })
    .unwrap();

    run(&flow, vec![values(&[1])], &ctx).unwrap().wait().await;
    assert_eq!(
        *log.lock().unwrap(),
        vec!["before:context", "before:flow", "after:flow", "after:context"]
    );
    assert_eq!(
        ctx.use_middleware(RetryMiddleware::new(2)),
        Err(FlowError::ContextInUse)
    );
}

#[tokio::test]
async fn test_context_store_shared_by_units() {
    let count = Task::blocking_with_context("count", 1, |x: i64, ctx: &Context| {
        ctx.update("seen", |seen| json!(seen.and_then(Value::as_i64).unwrap_or(0) + 1));
        Ok(x)
    })
    .unwrap();
    let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&count)?.pipe(&count)).unwrap();

    let ctx = Context::new();
    run(&flow, vec![values(&[1, 2, 3])], &ctx).unwrap().wait().await;
    assert_eq!(ctx.get("seen"), Some(json!(6)));
}

#[tokio::test]
async fn test_blocking_panic_fails_run() {
    let explode = Task::blocking("explode", 1, |_: i64| -> anyhow::Result<i64> {
        panic!("kaboom")
    })
    .unwrap();
    let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&explode)).unwrap();
    let outcome = run(&flow, vec![values(&[1])], &Context::new()).unwrap().wait().await;

    assert_eq!(outcome.status, RunStatus::Failed);
    let message = outcome.error.map(|err| err.to_string()).unwrap_or_default();
    assert!(message.contains("task panicked: kaboom"));
}

#[tokio::test]
async fn test_source_and_sink() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink = ops::for_each("collect", move |x: i64| {
        sink_seen.lock().unwrap().push(x);
        Ok(())
    })
    .unwrap();
    let numbers = Task::from_stream("numbers", |_ctx: &Context| {
        stream::iter((1..=3).map(anyhow::Ok))
    })
    .unwrap();
    let flow = Flow::define("main", 0, |b| b.source(&numbers)?.pipe(&add1())?.pipe(&sink)).unwrap();

    let outcome = run(&flow, Vec::new(), &Context::new()).unwrap().wait().await;
    assert!(outcome.is_success());
    assert!(outcome.output.is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![2, 3, 4]);
}

#[tokio::test]
async fn test_abandoned_branch_stops_source() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulled);
    let endless = Task::from_stream("endless", move |_ctx: &Context| {
        let counter = Arc::clone(&counter);
        stream::iter(0..).map(move |i: i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(i)
        })
    })
    .unwrap();
    let flow = Flow::define("main", 1, |b| {
        let endless = b.source(&endless)?;
        b.group([b.input(0)?, endless]).fan_in(&ops::merge(2)?)
    })
    .unwrap();

    let engine = Engine::new(EngineConfig::default().with_edge_capacity(4));
    let outcome = engine
        .run(&flow, vec![values(&[10, 20])], &Context::new())
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.into_result(), Ok(vec![json!([10, 0]), json!([20, 1])]));
    assert!(pulled.load(Ordering::SeqCst) < 100);
}

#[tokio::test]
async fn test_tracing_middleware_keeps_results() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sluice_runtime=trace")
        .with_test_writer()
        .try_init();

    let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&add1())?.pipe(&ops::inspect("view")?))
        .unwrap();
    let ctx = Context::new();
    ctx.use_middleware(TracingMiddleware::new()).unwrap();
    let outcome = run(&flow, vec![values(&[1, 2])], &ctx).unwrap().wait().await;

    assert_eq!(outcome.metrics.invocations, 4);
    assert_eq!(outcome.into_result(), Ok(vec![json!(2), json!(3)]));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_pure_map_preserves_order(items in prop::collection::vec(-1_000i64..1_000, 0..40)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let output = runtime.block_on(async {
            let flow = Flow::define("main", 1, |b| {
                b.input(0)?.transform("triple", |x: i64| Ok(x * 3))
            })
            .unwrap();
            run(&flow, vec![values(&items)], &Context::new())
                .unwrap()
                .wait()
                .await
                .into_result()
                .unwrap()
        });
        let expected: Vec<Value> = items.iter().map(|x| json!(x * 3)).collect();
        prop_assert_eq!(output, expected);
    }
}
