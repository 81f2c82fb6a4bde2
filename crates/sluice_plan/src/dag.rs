//! Graph of task and flow nodes.
//!
//! The DAG is the frozen body of a flow: nodes are positional, every input
//! slot of a node is fed by exactly one endpoint, and an endpoint is either a
//! flow input port or the output of another node.

use crate::flow::NodeDef;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use sluice_core::CompositionError;
use std::collections::VecDeque;

/// Where an edge starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// Flow input port by position
    Input(usize),
    /// Output of the node at this index
    Node(usize),
}

/// A positional edge: `from` feeds input `slot` of node `to`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Upstream endpoint
    pub from: Endpoint,
    /// Downstream node index
    pub to: usize,
    /// Input slot of the downstream node
    pub slot: usize,
}

/// A node in the DAG
#[derive(Debug, Clone)]
pub struct Node {
    /// Task or nested flow
    pub def: NodeDef,
    /// Endpoint bound to each input slot
    pub inputs: Vec<Option<Endpoint>>,
}

/// A directed acyclic graph of nodes
#[derive(Debug, Clone, Default)]
pub struct Dag {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl Dag {
    /// Create a new empty DAG
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with all slots unbound; returns its index
    pub fn add_node(&mut self, def: impl Into<NodeDef>) -> usize {
        let def = def.into();
        let inputs = vec![None; def.arity()];
        self.nodes.push(Node { def, inputs });
        self.nodes.len() - 1
    }

    /// Bind input `slot` of node `to` to `from`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown nodes, out-of-range or already bound slots,
    /// sink upstreams, and edges that would close a cycle
    pub fn connect(&mut self, from: Endpoint, to: usize, slot: usize) -> Result<(), CompositionError> {
        let target = self
            .nodes
            .get(to)
            .ok_or(CompositionError::UnknownNode { index: to })?;
        let target_name = target.def.name().to_string();
        match target.inputs.get(slot) {
            None => {
                return Err(CompositionError::ArityMismatch {
                    node: target_name,
                    expected: target.inputs.len(),
                    actual: slot + 1,
                });
            }
            Some(Some(_)) => {
                return Err(CompositionError::SlotAlreadyBound {
                    node: target_name,
                    slot,
                });
            }
            Some(None) => {}
        }

        if let Endpoint::Node(upstream) = from {
            let source = self
                .nodes
                .get(upstream)
                .ok_or(CompositionError::UnknownNode { index: upstream })?;
            if source.def.is_sink() {
                return Err(CompositionError::SinkHasNoOutput {
                    node: source.def.name().to_string(),
                });
            }
            if self.would_create_cycle(upstream, to) {
                return Err(CompositionError::Cycle {
                    from: source.def.name().to_string(),
                    to: target_name,
                });
            }
        }

        self.nodes[to].inputs[slot] = Some(from);
        self.edges.push(Edge { from, to, slot });
        Ok(())
    }

    /// Check if an edge `from -> to` would create a cycle
    fn would_create_cycle(&self, from: usize, to: usize) -> bool {
        let mut visited = IndexSet::new();
        let mut stack = vec![to];

        while let Some(current) = stack.pop() {
            if current == from {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            stack.extend(self.dependents(current));
        }

        false
    }

    /// Node indices in dependency order
    ///
    /// # Errors
    ///
    /// Returns `Cycle` if the graph is not acyclic
    pub fn topological_order(&self) -> Result<Vec<usize>, CompositionError> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for edge in &self.edges {
            if matches!(edge.from, Endpoint::Node(_)) {
                in_degree[edge.to] += 1;
            }
        }

        let mut ready: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| index)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(current) = ready.pop_front() {
            order.push(current);
            for next in self.dependents(current) {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = (0..self.nodes.len())
                .find(|index| in_degree[*index] > 0)
                .unwrap_or_default();
            let name = self.nodes[stuck].def.name().to_string();
            return Err(CompositionError::Cycle {
                from: name.clone(),
                to: name,
            });
        }
        Ok(order)
    }

    /// Get node by index
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    /// All nodes in insertion order
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All edges in insertion order
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Get nodes that read the given node's output
    #[must_use]
    pub fn dependents(&self, index: usize) -> Vec<usize> {
        self.edges
            .iter()
            .filter(|e| e.from == Endpoint::Node(index))
            .map(|e| e.to)
            .collect()
    }

    /// Get endpoints the given node reads from
    #[must_use]
    pub fn dependencies(&self, index: usize) -> Vec<Endpoint> {
        self.nodes
            .get(index)
            .map(|node| node.inputs.iter().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Get total node count
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get total edge count
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Check if DAG is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
