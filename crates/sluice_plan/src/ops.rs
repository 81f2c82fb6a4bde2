//! Small convenience nodes.
//!
//! Everything here is an ordinary task built from the public constructors.

use crate::task::{BodyResult, Task, TaskBody};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sluice_core::{Context, FlowResult, Value};

/// Forward every item unchanged
///
/// # Errors
///
/// Never fails; kept fallible like every constructor
pub fn identity() -> FlowResult<Task> {
    let body = |mut inputs: Vec<Value>, _ctx: &Context| -> BodyResult { Ok(inputs.pop()) };
    Task::from_body("identity", 1, TaskBody::blocking(body))
}

/// Map every item through `f`
///
/// # Errors
///
/// Never fails; kept fallible like every constructor
pub fn map<In, Out, F>(name: impl Into<String>, f: F) -> FlowResult<Task>
where
    In: DeserializeOwned,
    Out: Serialize,
    F: Fn(In) -> anyhow::Result<Out> + Send + Sync + 'static,
{
    Task::blocking(name, 1, f)
}

/// Log every item and forward it unchanged
///
/// # Errors
///
/// Never fails; kept fallible like every constructor
pub fn inspect(name: impl Into<String>) -> FlowResult<Task> {
    let name = name.into();
    let label = name.clone();
    let body = move |mut inputs: Vec<Value>, ctx: &Context| -> BodyResult {
        let item = inputs.pop();
        if let Some(item) = &item {
            tracing::info!(node = %label, run = ?ctx.run_id(), %item, "inspect");
        }
        Ok(item)
    };
    Task::from_body(name, 1, TaskBody::blocking(body))
}

/// Zip `arity` inputs into one JSON array per tuple
///
/// # Errors
///
/// Returns `InvalidArity` for arity 0
pub fn merge(arity: usize) -> FlowResult<Task> {
    let body = |inputs: Vec<Value>, _ctx: &Context| -> BodyResult { Ok(Some(Value::Array(inputs))) };
    Task::from_body("merge", arity, TaskBody::blocking(body))
}

/// Consume every item with `f`
///
/// # Errors
///
/// Never fails; kept fallible like every constructor
pub fn for_each<In, F>(name: impl Into<String>, f: F) -> FlowResult<Task>
where
    In: DeserializeOwned,
    F: Fn(In) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Task::sink(name, 1, f)
}

/// Source emitting `items` on every bind
///
/// # Errors
///
/// Never fails; kept fallible like every constructor
pub fn values<I, T>(items: I) -> FlowResult<Task>
where
    I: IntoIterator<Item = T>,
    T: Serialize,
{
    Task::from_iter("values", items)
}
