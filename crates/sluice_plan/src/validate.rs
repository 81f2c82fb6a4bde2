//! Flow validator.
//!
//! Runs once when a flow is frozen. Everything it rejects would otherwise
//! surface as a stuck or malformed run.

use crate::dag::{Dag, Endpoint};
use indexmap::IndexSet;
use sluice_core::CompositionError;

/// Validator for flow graphs
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator {
    /// Flow arity: number of input ports
    pub arity: usize,
}

impl Validator {
    /// Create a validator for a flow with `arity` input ports
    #[must_use]
    pub fn new(arity: usize) -> Self {
        Self { arity }
    }

    /// Validate a DAG and its designated output
    ///
    /// # Errors
    ///
    /// Returns every problem found, in node order
    pub fn validate(
        &self,
        name: &str,
        dag: &Dag,
        output: Endpoint,
    ) -> Result<(), Vec<CompositionError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.check_cycles(dag) {
            errors.push(e);
        }

        for node in dag.nodes() {
            for (slot, input) in node.inputs.iter().enumerate() {
                match input {
                    None => errors.push(CompositionError::UnboundPort {
                        node: node.def.name().to_string(),
                        slot,
                    }),
                    Some(endpoint) => {
                        if let Err(e) = self.check_endpoint(name, dag, *endpoint) {
                            errors.push(e);
                        }
                    }
                }
            }
        }

        if let Err(e) = self.check_endpoint(name, dag, output) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Check that an endpoint names an existing port or a non-sink node
    fn check_endpoint(&self, name: &str, dag: &Dag, endpoint: Endpoint) -> Result<(), CompositionError> {
        match endpoint {
            Endpoint::Input(index) if index >= self.arity => Err(CompositionError::UnknownInput {
                flow: name.to_string(),
                index,
                arity: self.arity,
            }),
            Endpoint::Input(_) => Ok(()),
            Endpoint::Node(index) => dag
                .node(index)
                .map(|_| ())
                .ok_or(CompositionError::UnknownNode { index }),
        }
    }

    /// Check for cycles in the DAG
    fn check_cycles(&self, dag: &Dag) -> Result<(), CompositionError> {
        let mut visited = IndexSet::new();
        let mut rec_stack = IndexSet::new();

        for index in 0..dag.node_count() {
            if let Some((from, to)) = self.dfs_cycle(index, dag, &mut visited, &mut rec_stack) {
                let name = |i: usize| {
                    dag.node(i)
                        .map(|node| node.def.name().to_string())
                        .unwrap_or_default()
                };
                return Err(CompositionError::Cycle {
                    from: name(from),
                    to: name(to),
                });
            }
        }

        Ok(())
    }

    /// DFS cycle detection over dependencies; returns the closing edge
    fn dfs_cycle(
        &self,
        index: usize,
        dag: &Dag,
        visited: &mut IndexSet<usize>,
        rec_stack: &mut IndexSet<usize>,
    ) -> Option<(usize, usize)> {
        if visited.contains(&index) {
            return None;
        }

        visited.insert(index);
        rec_stack.insert(index);

        for dep in dag.dependencies(index) {
            let Endpoint::Node(dep) = dep else {
                continue;
            };
            if rec_stack.contains(&dep) {
                return Some((dep, index));
            }
            if let Some(edge) = self.dfs_cycle(dep, dag, visited, rec_stack) {
                return Some(edge);
            }
        }

        rec_stack.shift_remove(&index);
        None
    }
}
