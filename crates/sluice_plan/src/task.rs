//! Task definitions.
//!
//! A task wraps one user-supplied unit of work. The definition is immutable;
//! every time it is wired into a bound graph a fresh instance with its own
//! channels is created.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sluice_core::{CompositionError, Context, FlowResult, TaskError, TaskId, Value};
use std::future::Future;
use std::sync::Arc;

/// Outcome of one body invocation. `Ok(None)` emits nothing.
pub type BodyResult = Result<Option<Value>, TaskError>;

/// Items produced by a source body
pub type SourceStream = BoxStream<'static, Result<Value, TaskError>>;

/// Body run on the blocking worker pool
pub trait BlockingBody: Send + Sync + 'static {
    /// Invoke the body with one positional input tuple
    fn call(&self, inputs: Vec<Value>, ctx: &Context) -> BodyResult;
}

impl<F> BlockingBody for F
where
    F: Fn(Vec<Value>, &Context) -> BodyResult + Send + Sync + 'static,
{
    fn call(&self, inputs: Vec<Value>, ctx: &Context) -> BodyResult {
        self(inputs, ctx)
    }
}

/// Body polled cooperatively by the run driver
#[async_trait]
pub trait SuspendingBody: Send + Sync + 'static {
    /// Invoke the body with one positional input tuple
    async fn call(&self, inputs: Vec<Value>, ctx: Context) -> BodyResult;
}

#[async_trait]
impl<F, Fut> SuspendingBody for F
where
    F: Fn(Vec<Value>, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BodyResult> + Send + 'static,
{
    async fn call(&self, inputs: Vec<Value>, ctx: Context) -> BodyResult {
        self(inputs, ctx).await
    }
}

/// Body of an arity-0 task: opened once per bound instance
pub trait SourceBody: Send + Sync + 'static {
    /// Start producing items
    fn open(&self, ctx: &Context) -> SourceStream;
}

impl<F> SourceBody for F
where
    F: Fn(&Context) -> SourceStream + Send + Sync + 'static,
{
    fn open(&self, ctx: &Context) -> SourceStream {
        self(ctx)
    }
}

/// The unit of work wrapped by a task
#[derive(Clone)]
pub enum TaskBody {
    /// Blocking computation
    Blocking(Arc<dyn BlockingBody>),
    /// Suspending computation
    Suspending(Arc<dyn SuspendingBody>),
    /// Item producer with no inputs
    Source(Arc<dyn SourceBody>),
}

impl TaskBody {
    /// Wrap a blocking body
    pub fn blocking<B: BlockingBody>(body: B) -> Self {
        Self::Blocking(Arc::new(body))
    }

    /// Wrap a suspending body
    pub fn suspending<B: SuspendingBody>(body: B) -> Self {
        Self::Suspending(Arc::new(body))
    }

    /// Wrap a source body
    pub fn source<B: SourceBody>(body: B) -> Self {
        Self::Source(Arc::new(body))
    }

    /// Short kind label used in logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Blocking(_) => "blocking",
            Self::Suspending(_) => "suspending",
            Self::Source(_) => "source",
        }
    }
}

impl std::fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// When an N-ary task stops gathering inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FanInPolicy {
    /// Stop as soon as any input ends
    #[default]
    ShortCircuit,
    /// Continue until every input ends, padding ended slots with `null`
    Longest,
}

#[derive(Clone)]
struct TaskInner {
    id: TaskId,
    name: String,
    arity: usize,
    body: TaskBody,
    sink: bool,
    fan_in: FanInPolicy,
}

/// Immutable task definition
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Define a task from a raw body.
    ///
    /// Sources must have arity 0; every other body needs at least one input.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArity` when the arity does not fit the body kind
    pub fn from_body(name: impl Into<String>, arity: usize, body: TaskBody) -> FlowResult<Self> {
        Self::with_parts(name.into(), arity, body, false)
    }

    fn with_parts(name: String, arity: usize, body: TaskBody, sink: bool) -> FlowResult<Self> {
        let reason = match (&body, arity) {
            (TaskBody::Source(_), 0) => None,
            (TaskBody::Source(_), _) => Some("sources take no inputs"),
            (_, 0) if sink => Some("sinks need at least one input"),
            (_, 0) => Some("use a source body for tasks without inputs"),
            _ => None,
        };
        if let Some(reason) = reason {
            return Err(CompositionError::InvalidArity {
                node: name,
                reason: reason.to_string(),
            }
            .into());
        }
        Ok(Self {
            inner: Arc::new(TaskInner {
                id: TaskId::new(),
                name,
                arity,
                body,
                sink,
                fan_in: FanInPolicy::default(),
            }),
        })
    }

    /// Typed blocking task. Arity 1 receives the item itself; arity N receives an N-tuple.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArity` for arity 0
    pub fn blocking<In, Out, F>(name: impl Into<String>, arity: usize, f: F) -> FlowResult<Self>
    where
        In: DeserializeOwned,
        Out: Serialize,
        F: Fn(In) -> anyhow::Result<Out> + Send + Sync + 'static,
    {
        let body = move |inputs: Vec<Value>, _ctx: &Context| -> BodyResult {
            let input = decode::<In>(arity, inputs)?;
            encode(f(input)?)
        };
        Self::from_body(name, arity, TaskBody::blocking(body))
    }

    /// Typed blocking task that also sees the run context
    ///
    /// # Errors
    ///
    /// Returns `InvalidArity` for arity 0
    pub fn blocking_with_context<In, Out, F>(
        name: impl Into<String>,
        arity: usize,
        f: F,
    ) -> FlowResult<Self>
    where
        In: DeserializeOwned,
        Out: Serialize,
        F: Fn(In, &Context) -> anyhow::Result<Out> + Send + Sync + 'static,
    {
        let body = move |inputs: Vec<Value>, ctx: &Context| -> BodyResult {
            let input = decode::<In>(arity, inputs)?;
            encode(f(input, ctx)?)
        };
        Self::from_body(name, arity, TaskBody::blocking(body))
    }

    /// Typed suspending task
    ///
    /// # Errors
    ///
    /// Returns `InvalidArity` for arity 0
    pub fn suspending<In, Out, F, Fut>(
        name: impl Into<String>,
        arity: usize,
        f: F,
    ) -> FlowResult<Self>
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
    {
        Self::suspending_with_context(name, arity, move |input: In, _ctx: Context| f(input))
    }

    /// Typed suspending task that also receives the run context
    ///
    /// # Errors
    ///
    /// Returns `InvalidArity` for arity 0
    pub fn suspending_with_context<In, Out, F, Fut>(
        name: impl Into<String>,
        arity: usize,
        f: F,
    ) -> FlowResult<Self>
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + 'static,
        F: Fn(In, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
    {
        let f = Arc::new(f);
        let body = move |inputs: Vec<Value>, ctx: Context| {
            let f = Arc::clone(&f);
            async move {
                let input = decode::<In>(arity, inputs)?;
                encode(f(input, ctx).await?)
            }
        };
        Self::from_body(name, arity, TaskBody::suspending(body))
    }

    /// Task that consumes items and produces no output channel
    ///
    /// # Errors
    ///
    /// Returns `InvalidArity` for arity 0
    pub fn sink<In, F>(name: impl Into<String>, arity: usize, f: F) -> FlowResult<Self>
    where
        In: DeserializeOwned,
        F: Fn(In) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let body = move |inputs: Vec<Value>, _ctx: &Context| -> BodyResult {
            f(decode::<In>(arity, inputs)?)?;
            Ok(None)
        };
        Self::with_parts(name.into(), arity, TaskBody::blocking(body), true)
    }

    /// Source re-emitting `items` on every bind
    ///
    /// # Errors
    ///
    /// Never fails for a well-formed name; kept fallible like every constructor
    pub fn from_iter<I, T>(name: impl Into<String>, items: I) -> FlowResult<Self>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        let items: Arc<Vec<Result<Value, TaskError>>> = Arc::new(
            items
                .into_iter()
                .map(|item| serde_json::to_value(item).map_err(TaskError::from))
                .collect(),
        );
        let body = move |_ctx: &Context| -> SourceStream {
            stream::iter(items.as_ref().clone()).boxed()
        };
        Self::from_body(name, 0, TaskBody::source(body))
    }

    /// Source backed by a stream opened per bind
    ///
    /// # Errors
    ///
    /// Never fails for a well-formed name; kept fallible like every constructor
    pub fn from_stream<F, S, T>(name: impl Into<String>, open: F) -> FlowResult<Self>
    where
        F: Fn(&Context) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<T>> + Send + 'static,
        T: Serialize,
    {
        let body = move |ctx: &Context| -> SourceStream {
            open(ctx)
                .map(|item| {
                    let item = item.map_err(TaskError::from)?;
                    serde_json::to_value(item).map_err(TaskError::from)
                })
                .boxed()
        };
        Self::from_body(name, 0, TaskBody::source(body))
    }

    /// Same definition with a different fan-in end policy
    #[must_use]
    pub fn with_fan_in(mut self, policy: FanInPolicy) -> Self {
        Arc::make_mut(&mut self.inner).fan_in = policy;
        self
    }

    /// Definition identity
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Task name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of positional inputs
    #[must_use]
    pub fn arity(&self) -> usize {
        self.inner.arity
    }

    /// Wrapped body
    #[must_use]
    pub fn body(&self) -> &TaskBody {
        &self.inner.body
    }

    /// Whether the task produces no output channel
    #[must_use]
    pub fn is_sink(&self) -> bool {
        self.inner.sink
    }

    /// Whether the task is an arity-0 producer
    #[must_use]
    pub fn is_source(&self) -> bool {
        matches!(self.inner.body, TaskBody::Source(_))
    }

    /// Fan-in end policy
    #[must_use]
    pub fn fan_in(&self) -> FanInPolicy {
        self.inner.fan_in
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("arity", &self.inner.arity)
            .field("body", &self.inner.body)
            .field("sink", &self.inner.sink)
            .field("fan_in", &self.inner.fan_in)
            .finish()
    }
}

/// Decode a positional input tuple into a typed argument
fn decode<In: DeserializeOwned>(arity: usize, mut inputs: Vec<Value>) -> Result<In, TaskError> {
    let value = if arity == 1 {
        inputs.pop().unwrap_or(Value::Null)
    } else {
        Value::Array(inputs)
    };
    Ok(serde_json::from_value(value)?)
}

fn encode<Out: Serialize>(output: Out) -> BodyResult {
    Ok(Some(serde_json::to_value(output)?))
}
