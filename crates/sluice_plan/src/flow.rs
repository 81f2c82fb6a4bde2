//! Flow definitions and the composition builder.
//!
//! A flow is an immutable arrangement of tasks and nested flows exposing the
//! same port contract as a task: a fixed number of positional inputs and at
//! most one output.

use crate::dag::{Dag, Endpoint};
use crate::ops;
use crate::task::Task;
use crate::validate::Validator;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sluice_core::{CompositionError, FlowError, FlowId, FlowResult, Middleware};
use std::cell::RefCell;
use std::sync::Arc;

/// A graph node: a task or a nested flow
#[derive(Debug, Clone)]
pub enum NodeDef {
    /// Single unit of work
    Task(Task),
    /// Composite node
    Flow(Flow),
}

impl NodeDef {
    /// Node name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Task(task) => task.name(),
            Self::Flow(flow) => flow.name(),
        }
    }

    /// Number of positional inputs
    #[must_use]
    pub fn arity(&self) -> usize {
        match self {
            Self::Task(task) => task.arity(),
            Self::Flow(flow) => flow.arity(),
        }
    }

    /// Whether the node has no output
    #[must_use]
    pub fn is_sink(&self) -> bool {
        match self {
            Self::Task(task) => task.is_sink(),
            Self::Flow(flow) => flow.is_sink(),
        }
    }
}

impl From<Task> for NodeDef {
    fn from(task: Task) -> Self {
        Self::Task(task)
    }
}

impl From<&Task> for NodeDef {
    fn from(task: &Task) -> Self {
        Self::Task(task.clone())
    }
}

impl From<Flow> for NodeDef {
    fn from(flow: Flow) -> Self {
        Self::Flow(flow)
    }
}

impl From<&Flow> for NodeDef {
    fn from(flow: &Flow) -> Self {
        Self::Flow(flow.clone())
    }
}

impl From<&NodeDef> for NodeDef {
    fn from(node: &NodeDef) -> Self {
        node.clone()
    }
}

struct FlowInner {
    id: FlowId,
    name: String,
    arity: usize,
    dag: Dag,
    output: Endpoint,
    sink: bool,
    middleware: Vec<Arc<dyn Middleware>>,
}

/// Immutable, validated flow definition
#[derive(Clone)]
pub struct Flow {
    inner: Arc<FlowInner>,
}

impl Flow {
    /// Define a flow by wiring nodes with a [`FlowBuilder`].
    ///
    /// The closure runs exactly once; the resulting graph is validated and frozen.
    ///
    /// # Errors
    ///
    /// Returns the builder's error or the first validation error
    pub fn define<F>(name: impl Into<String>, arity: usize, build: F) -> FlowResult<Self>
    where
        F: for<'b> FnOnce(&'b FlowBuilder) -> FlowResult<Port<'b>>,
    {
        Self::builder(name, arity).build(build)
    }

    /// Start a flow definition that carries flow-level middleware
    #[must_use]
    pub fn builder(name: impl Into<String>, arity: usize) -> FlowDefinition {
        FlowDefinition {
            name: name.into(),
            arity,
            middleware: Vec::new(),
        }
    }

    /// Freeze a hand-built DAG into a flow
    ///
    /// # Errors
    ///
    /// Returns the first validation error
    pub fn from_dag(name: impl Into<String>, arity: usize, dag: Dag, output: Endpoint) -> FlowResult<Self> {
        Self::freeze(name.into(), arity, dag, output, Vec::new())
    }

    fn freeze(
        name: String,
        arity: usize,
        dag: Dag,
        output: Endpoint,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> FlowResult<Self> {
        Validator::new(arity)
            .validate(&name, &dag, output)
            .map_err(|errors| {
                errors
                    .into_iter()
                    .next()
                    .map_or_else(|| FlowError::internal("validation failed"), FlowError::from)
            })?;
        let sink = match output {
            Endpoint::Input(_) => false,
            Endpoint::Node(index) => dag.node(index).is_some_and(|node| node.def.is_sink()),
        };
        tracing::debug!(
            flow = %name,
            arity,
            nodes = dag.node_count(),
            edges = dag.edge_count(),
            "flow defined"
        );
        Ok(Self {
            inner: Arc::new(FlowInner {
                id: FlowId::new(),
                name,
                arity,
                dag,
                output,
                sink,
                middleware,
            }),
        })
    }

    /// Definition identity
    #[must_use]
    pub fn id(&self) -> FlowId {
        self.inner.id
    }

    /// Flow name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of input ports
    #[must_use]
    pub fn arity(&self) -> usize {
        self.inner.arity
    }

    /// Internal graph
    #[must_use]
    pub fn dag(&self) -> &Dag {
        &self.inner.dag
    }

    /// Designated output endpoint
    #[must_use]
    pub fn output(&self) -> Endpoint {
        self.inner.output
    }

    /// Whether the flow ends in a sink and has no output
    #[must_use]
    pub fn is_sink(&self) -> bool {
        self.inner.sink
    }

    /// Middleware applied to every node inside this flow
    #[must_use]
    pub fn middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.inner.middleware
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("arity", &self.inner.arity)
            .field("nodes", &self.inner.dag.node_count())
            .field("output", &self.inner.output)
            .field("middleware", &self.inner.middleware.len())
            .finish()
    }
}

/// Pending flow definition with flow-level middleware
pub struct FlowDefinition {
    name: String,
    arity: usize,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl FlowDefinition {
    /// Add middleware wrapping every node of this flow, nested flows included
    #[must_use]
    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Add already shared middleware
    #[must_use]
    pub fn shared_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Run the builder closure once and freeze the result
    ///
    /// # Errors
    ///
    /// Returns the builder's error or the first validation error
    pub fn build<F>(self, build: F) -> FlowResult<Flow>
    where
        F: for<'b> FnOnce(&'b FlowBuilder) -> FlowResult<Port<'b>>,
    {
        let builder = FlowBuilder {
            name: self.name,
            arity: self.arity,
            dag: RefCell::new(Dag::new()),
        };
        let output = build(&builder)?.endpoint;
        let FlowBuilder { name, arity, dag } = builder;
        Flow::freeze(name, arity, dag.into_inner(), output, self.middleware)
    }
}

/// Wires nodes while a flow is being defined
pub struct FlowBuilder {
    name: String,
    arity: usize,
    dag: RefCell<Dag>,
}

impl FlowBuilder {
    /// Name of the flow being defined
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input port by position
    ///
    /// # Errors
    ///
    /// Returns `UnknownInput` when `index` is not below the flow arity
    pub fn input(&self, index: usize) -> FlowResult<Port<'_>> {
        if index >= self.arity {
            return Err(CompositionError::UnknownInput {
                flow: self.name.clone(),
                index,
                arity: self.arity,
            }
            .into());
        }
        Ok(self.port(Endpoint::Input(index)))
    }

    /// All input ports in order
    #[must_use]
    pub fn inputs(&self) -> Group<'_> {
        Group {
            builder: self,
            ports: (0..self.arity).map(|i| self.port(Endpoint::Input(i))).collect(),
        }
    }

    /// Apply an arity-0 node
    ///
    /// # Errors
    ///
    /// Returns `ArityMismatch` if the node takes inputs
    pub fn source(&self, node: impl Into<NodeDef>) -> FlowResult<Port<'_>> {
        self.apply(node, &[])
    }

    /// Apply a node to positional ports
    ///
    /// # Errors
    ///
    /// Returns `ArityMismatch` when the port count differs from the node arity
    /// and `ForeignPort` for a port made by another builder
    pub fn apply(&self, node: impl Into<NodeDef>, ports: &[Port<'_>]) -> FlowResult<Port<'_>> {
        let node = node.into();
        for port in ports {
            self.check_owned(port)?;
        }
        if ports.len() != node.arity() {
            return Err(CompositionError::ArityMismatch {
                node: node.name().to_string(),
                expected: node.arity(),
                actual: ports.len(),
            }
            .into());
        }
        let mut dag = self.dag.borrow_mut();
        let index = dag.add_node(node);
        for (slot, port) in ports.iter().enumerate() {
            dag.connect(port.endpoint, index, slot)?;
        }
        Ok(self.port(Endpoint::Node(index)))
    }

    /// Group ports for fan-in or parallel application
    pub fn group<'b, I>(&'b self, ports: I) -> Group<'b>
    where
        I: IntoIterator<Item = Port<'b>>,
    {
        Group {
            builder: self,
            ports: ports.into_iter().collect(),
        }
    }

    fn check_owned(&self, port: &Port<'_>) -> FlowResult<()> {
        if std::ptr::eq(port.builder, self) {
            Ok(())
        } else {
            Err(CompositionError::ForeignPort {
                flow: self.name.clone(),
            }
            .into())
        }
    }

    fn port(&self, endpoint: Endpoint) -> Port<'_> {
        Port {
            builder: self,
            endpoint,
        }
    }
}

/// Handle on a node output (or flow input) inside a builder
#[derive(Clone, Copy)]
pub struct Port<'b> {
    builder: &'b FlowBuilder,
    endpoint: Endpoint,
}

impl<'b> Port<'b> {
    /// Endpoint this port refers to
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Feed this port into an arity-1 node
    ///
    /// # Errors
    ///
    /// Returns `ArityMismatch` if the node does not take exactly one input
    pub fn pipe(self, node: impl Into<NodeDef>) -> FlowResult<Port<'b>> {
        self.builder.apply(node, &[self])
    }

    /// Map every item through `f` with an ordinary arity-1 blocking task
    ///
    /// # Errors
    ///
    /// Propagates task construction errors
    pub fn transform<In, Out, F>(self, name: impl Into<String>, f: F) -> FlowResult<Port<'b>>
    where
        In: DeserializeOwned,
        Out: Serialize,
        F: Fn(In) -> anyhow::Result<Out> + Send + Sync + 'static,
    {
        self.pipe(ops::map(name, f)?)
    }
}

impl std::fmt::Debug for Port<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port").field("endpoint", &self.endpoint).finish()
    }
}

/// Ordered list of ports
#[derive(Clone)]
pub struct Group<'b> {
    builder: &'b FlowBuilder,
    ports: Vec<Port<'b>>,
}

impl<'b> Group<'b> {
    /// Apply a node to the group.
    ///
    /// A node whose arity equals the group length receives the ports
    /// positionally. An arity-1 node is applied once per port instead.
    ///
    /// # Errors
    ///
    /// Returns `EmptyGroup` for an empty group and `ArityMismatch` otherwise
    pub fn pipe(self, node: impl Into<NodeDef>) -> FlowResult<Group<'b>> {
        let node = node.into();
        if self.ports.is_empty() {
            return Err(CompositionError::EmptyGroup {
                node: node.name().to_string(),
            }
            .into());
        }
        if node.arity() == self.ports.len() {
            let builder = self.builder;
            let port = self.fan_in(node)?;
            Ok(Group {
                builder,
                ports: vec![port],
            })
        } else if node.arity() == 1 {
            self.each(node)
        } else {
            Err(CompositionError::ArityMismatch {
                node: node.name().to_string(),
                expected: node.arity(),
                actual: self.ports.len(),
            }
            .into())
        }
    }

    /// Feed every port positionally into one instance of `node`
    ///
    /// # Errors
    ///
    /// Returns `ArityMismatch` when the group length differs from the node arity
    pub fn fan_in(self, node: impl Into<NodeDef>) -> FlowResult<Port<'b>> {
        self.builder.apply(node, &self.ports)
    }

    /// Apply an independent instance of an arity-1 node to every port
    ///
    /// # Errors
    ///
    /// Returns `ArityMismatch` if the node does not take exactly one input
    pub fn each(self, node: impl Into<NodeDef>) -> FlowResult<Group<'b>> {
        let node = node.into();
        let ports = self
            .ports
            .iter()
            .map(|port| port.pipe(&node))
            .collect::<FlowResult<Vec<_>>>()?;
        Ok(Group {
            builder: self.builder,
            ports,
        })
    }

    /// The only port of a one-element group
    ///
    /// # Errors
    ///
    /// Returns `NotSingle` for any other length
    pub fn single(self) -> FlowResult<Port<'b>> {
        match self.ports.as_slice() {
            [port] => Ok(*port),
            _ => Err(CompositionError::NotSingle {
                len: self.ports.len(),
            }
            .into()),
        }
    }

    /// Ports in order
    #[must_use]
    pub fn ports(&self) -> &[Port<'b>] {
        &self.ports
    }

    /// Take the ports out of the group
    #[must_use]
    pub fn into_ports(self) -> Vec<Port<'b>> {
        self.ports
    }

    /// Number of ports
    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether the group has no ports
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl std::fmt::Debug for Group<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ports.iter()).finish()
    }
}
