//! Binding: turning a flow template into runnable task instances.
//!
//! Every task node of the flow (recursively through nested flows) becomes one
//! [`TaskInstance`] with its own readers and output channel. Readers are
//! attached while binding, so no item pushed after the run starts can be
//! missed by a downstream node.

use crate::dag::Endpoint;
use crate::flow::{Flow, NodeDef};
use crate::task::Task;
use sluice_channel::{Capacity, Channel, Reader};
use sluice_core::{CompositionError, FlowError, FlowResult, Middleware, NodeId, NodeInfo, Value};
use std::sync::Arc;

/// One bound task node
pub struct TaskInstance {
    /// Identity of this instance
    pub node: NodeInfo,
    /// Task definition
    pub task: Task,
    /// One reader per input slot
    pub inputs: Vec<Reader<Value>>,
    /// Output channel; `None` for sinks and for outputs nobody reads
    pub output: Option<Channel<Value>>,
    /// Middleware of the enclosing flows, outermost first
    pub middleware: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for TaskInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskInstance")
            .field("node", &self.node)
            .field("inputs", &self.inputs.len())
            .field("output", &self.output.as_ref().map(Channel::id))
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

/// A flow bound to concrete input channels
#[derive(Debug)]
pub struct BoundFlow {
    /// Task instances in dependency order
    pub instances: Vec<TaskInstance>,
    /// Reader on the flow's terminal output; `None` for sink flows
    pub output: Option<Reader<Value>>,
}

impl Flow {
    /// Bind this flow to `inputs`, creating fresh instances and channels.
    ///
    /// Edge channels use `capacity`. Outputs that end up with no reader are
    /// dropped so their producers never wait on them.
    ///
    /// # Errors
    ///
    /// Returns `ArityMismatch` when `inputs` does not match the flow arity
    pub fn bind(&self, inputs: &[Channel<Value>], capacity: Capacity) -> FlowResult<BoundFlow> {
        let mut binder = Binder {
            capacity,
            instances: Vec::new(),
        };
        let output = binder.bind_flow(self, inputs, self.name(), &[])?;
        let output = output.map(|channel| channel.reader());

        for instance in &mut binder.instances {
            if instance
                .output
                .as_ref()
                .is_some_and(|channel| channel.reader_count() == 0)
            {
                instance.output = None;
            }
        }

        tracing::debug!(
            flow = %self.name(),
            instances = binder.instances.len(),
            "flow bound"
        );
        Ok(BoundFlow {
            instances: binder.instances,
            output,
        })
    }
}

struct Binder {
    capacity: Capacity,
    instances: Vec<TaskInstance>,
}

impl Binder {
    fn bind_flow(
        &mut self,
        flow: &Flow,
        inputs: &[Channel<Value>],
        path: &str,
        outer: &[Arc<dyn Middleware>],
    ) -> FlowResult<Option<Channel<Value>>> {
        if inputs.len() != flow.arity() {
            return Err(CompositionError::ArityMismatch {
                node: flow.name().to_string(),
                expected: flow.arity(),
                actual: inputs.len(),
            }
            .into());
        }

        let mut middleware = outer.to_vec();
        middleware.extend(flow.middleware().iter().cloned());

        let dag = flow.dag();
        let mut outputs: Vec<Option<Channel<Value>>> = vec![None; dag.node_count()];
        let resolve = |outputs: &[Option<Channel<Value>>], endpoint: Endpoint| -> FlowResult<Channel<Value>> {
            match endpoint {
                Endpoint::Input(index) => inputs
                    .get(index)
                    .cloned()
                    .ok_or_else(|| FlowError::internal(format!("input {index} missing while binding"))),
                Endpoint::Node(index) => outputs
                    .get(index)
                    .cloned()
                    .flatten()
                    .ok_or_else(|| FlowError::internal(format!("node {index} has no output while binding"))),
            }
        };

        for index in dag.topological_order()? {
            let Some(node) = dag.node(index) else {
                continue;
            };
            let slots = node
                .inputs
                .iter()
                .enumerate()
                .map(|(slot, endpoint)| {
                    let endpoint = endpoint.ok_or_else(|| CompositionError::UnboundPort {
                        node: node.def.name().to_string(),
                        slot,
                    })?;
                    resolve(&outputs, endpoint)
                })
                .collect::<FlowResult<Vec<_>>>()?;

            let child_path = format!("{path}/{}", node.def.name());
            outputs[index] = match &node.def {
                NodeDef::Task(task) => {
                    let output = (!task.is_sink()).then(|| Channel::new(self.capacity));
                    self.instances.push(TaskInstance {
                        node: NodeInfo {
                            node_id: NodeId::new(),
                            task_id: task.id(),
                            name: task.name().to_string(),
                            path: child_path,
                        },
                        task: task.clone(),
                        inputs: slots.iter().map(Channel::reader).collect(),
                        output: output.clone(),
                        middleware: middleware.clone(),
                    });
                    output
                }
                NodeDef::Flow(sub) => self.bind_flow(sub, &slots, &child_path, &middleware)?,
            };
        }

        if flow.is_sink() {
            return Ok(None);
        }
        resolve(&outputs, flow.output()).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_channel::TryRecv;

    fn add1() -> Task {
        Task::blocking("add1", 1, |x: i64| Ok(x + 1)).unwrap()
    }

    #[test]
    fn test_bind_creates_fresh_instances() {
        let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&add1())?.pipe(&add1())).unwrap();

        let first = flow.bind(&[Channel::from_values(vec![json!(1)])], Capacity::Unbounded).unwrap();
        let second = flow.bind(&[Channel::from_values(vec![json!(1)])], Capacity::Unbounded).unwrap();

        assert_eq!(first.instances.len(), 2);
        assert_ne!(first.instances[0].node.node_id, second.instances[0].node.node_id);
        assert_eq!(first.instances[0].node.task_id, second.instances[0].node.task_id);
        assert_eq!(first.instances[1].node.path, "main/add1");
        assert!(first.output.is_some());
    }

    #[test]
    fn test_bind_wrong_input_count() {
        let flow = Flow::define("main", 2, |b| b.input(0)).unwrap();
        let err = flow.bind(&[Channel::unbounded()], Capacity::Unbounded).unwrap_err();
        assert_eq!(
            err,
            FlowError::Composition(CompositionError::ArityMismatch {
                node: "main".to_string(),
                expected: 2,
                actual: 1,
            })
        );
    }

    #[test]
    fn test_bind_nested_paths_and_middleware() {
        struct Tag;
        impl Middleware for Tag {}

        let sub = Flow::builder("sub_flow", 1)
            .middleware(Tag)
            .build(|b| b.input(0)?.pipe(&add1()))
            .unwrap();
        let main = Flow::define("main", 1, |b| b.input(0)?.pipe(&sub)?.pipe(&add1())).unwrap();

        let bound = main.bind(&[Channel::unbounded()], Capacity::Unbounded).unwrap();
        let paths: Vec<_> = bound.instances.iter().map(|i| i.node.path.as_str()).collect();
        assert_eq!(paths, vec!["main/sub_flow/add1", "main/add1"]);
        assert_eq!(bound.instances[0].middleware.len(), 1);
        assert_eq!(bound.instances[1].middleware.len(), 0);
    }

    #[test]
    fn test_identity_flow_reads_input() {
        let flow = Flow::define("identity", 1, |b| b.input(0)).unwrap();
        let input = Channel::from_values(vec![json!("a")]);
        let bound = flow.bind(&[input], Capacity::Unbounded).unwrap();

        assert!(bound.instances.is_empty());
        let mut output = bound.output.unwrap();
        assert_eq!(output.try_recv(), TryRecv::Item(json!("a")));
        assert_eq!(output.try_recv(), TryRecv::Ended);
    }

    #[test]
    fn test_unread_outputs_are_pruned() {
        let side = Task::blocking("side", 1, |x: i64| Ok(x)).unwrap();
        let flow = Flow::define("main", 1, |b| {
            let x = b.input(0)?;
            x.pipe(&side)?;
            x.pipe(&add1())
        })
        .unwrap();

        let bound = flow.bind(&[Channel::unbounded()], Capacity::Bounded(1)).unwrap();
        let side = bound.instances.iter().find(|i| i.node.name == "side").unwrap();
        let main = bound.instances.iter().find(|i| i.node.name == "add1").unwrap();
        assert!(side.output.is_none());
        assert!(main.output.is_some());
    }

    #[test]
    fn test_sink_flow_has_no_output() {
        let sink = Task::sink("drop", 1, |_: i64| Ok(())).unwrap();
        let flow = Flow::define("main", 1, |b| b.input(0)?.pipe(&sink)).unwrap();
        let bound = flow.bind(&[Channel::unbounded()], Capacity::Unbounded).unwrap();
        assert!(bound.output.is_none());
        assert!(bound.instances[0].output.is_none());
    }
}
