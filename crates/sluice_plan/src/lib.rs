//! SLUICE Planner
//!
//! Task and flow definitions, the composition builder, graph validation and
//! binding of flow templates into runnable task instances.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bind;
pub mod dag;
pub mod flow;
pub mod ops;
pub mod task;
pub mod validate;

pub use bind::{BoundFlow, TaskInstance};
pub use dag::{Dag, Edge, Endpoint, Node};
pub use flow::{Flow, FlowBuilder, FlowDefinition, Group, NodeDef, Port};
pub use task::{
    BlockingBody, BodyResult, FanInPolicy, SourceBody, SourceStream, SuspendingBody, Task, TaskBody,
};
pub use validate::Validator;
