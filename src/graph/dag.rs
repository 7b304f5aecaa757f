//! The resource dependency graph.
//!
//! Edges point from consumer to producer. A [`ResourceGraph`] is only ever
//! produced by the [`GraphBuilder`](super::GraphBuilder), which rejects
//! cycles, so every method here may assume the graph is acyclic.

use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use super::node::{NodeStatus, Outputs, ResourceNode};
use super::value::{PropertyExpr, Reference, Resolved, resolve_properties};

/// An acyclic graph of declared resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
    producers: Vec<Vec<usize>>,
    consumers: Vec<Vec<usize>>,
    outputs: BTreeMap<String, PropertyExpr>,
}

impl ResourceGraph {
    pub(super) fn from_parts(
        nodes: Vec<ResourceNode>,
        producers: Vec<Vec<usize>>,
        outputs: BTreeMap<String, PropertyExpr>,
    ) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.name.clone(), i))
            .collect();

        let mut consumers = vec![Vec::new(); nodes.len()];
        for (consumer, list) in producers.iter().enumerate() {
            for &producer in list {
                consumers[producer].push(consumer);
            }
        }

        Self {
            nodes,
            index,
            producers,
            consumers,
            outputs,
        }
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Returns the node at the given declaration index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ResourceNode> {
        self.nodes.get(index)
    }

    /// Looks up a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&ResourceNode> {
        self.index_of(name).and_then(|i| self.nodes.get(i))
    }

    /// Returns the declaration index of a named node.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Returns the producers a node depends on, in declaration order.
    #[must_use]
    pub fn producers(&self, index: usize) -> &[usize] {
        self.producers.get(index).map_or(&[], Vec::as_slice)
    }

    /// Returns the consumers depending on a node, in declaration order.
    #[must_use]
    pub fn consumers(&self, index: usize) -> &[usize] {
        self.consumers.get(index).map_or(&[], Vec::as_slice)
    }

    /// Returns the names of the producers a node depends on.
    #[must_use]
    pub fn dependency_names(&self, index: usize) -> Vec<String> {
        self.producers(index)
            .iter()
            .map(|&p| self.nodes[p].id.name.clone())
            .collect()
    }

    /// Returns a topological order, producers first.
    ///
    /// Among nodes that are ready at the same time, the one declared first
    /// comes first, so the order is stable across runs.
    #[must_use]
    pub fn topological_order(&self) -> Vec<usize> {
        match kahn_order(&self.producers) {
            Ok(order) | Err((order, _)) => order,
        }
    }

    /// Records outputs on a node.
    pub fn set_outputs(&mut self, index: usize, outputs: Outputs) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.outputs = Some(outputs);
        }
    }

    /// Records a status on a node.
    pub fn set_status(&mut self, index: usize, status: NodeStatus) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.status = status;
        }
    }

    /// Looks up a referenced value among the nodes' current outputs.
    #[must_use]
    pub fn lookup(&self, reference: &Reference) -> Option<Value> {
        self.node(&reference.resource)?
            .outputs
            .as_ref()?
            .get(&reference.attribute)
    }

    /// Resolves a node's declared properties against current outputs.
    #[must_use]
    pub fn resolve_node(&self, index: usize) -> Option<(BTreeMap<String, Value>, Vec<Reference>)> {
        let node = self.nodes.get(index)?;
        Some(resolve_properties(&node.properties, &|r| self.lookup(r)))
    }

    /// Returns the declared stack outputs.
    #[must_use]
    pub fn outputs(&self) -> &BTreeMap<String, PropertyExpr> {
        &self.outputs
    }

    /// Resolves the stack outputs against current node outputs.
    #[must_use]
    pub fn resolve_outputs(&self) -> BTreeMap<String, Resolved> {
        self.outputs
            .iter()
            .map(|(name, expr)| (name.clone(), expr.resolve(&|r| self.lookup(r))))
            .collect()
    }
}

/// Orders nodes given each node's producers, producers first, ties broken by
/// index.
///
/// On a cycle, returns the partial order and the indices that could not be
/// placed.
pub(crate) fn kahn_order(producers: &[Vec<usize>]) -> Result<Vec<usize>, (Vec<usize>, Vec<usize>)> {
    let n = producers.len();
    let mut in_degree: Vec<usize> = producers.iter().map(Vec::len).collect();
    let mut consumers = vec![Vec::new(); n];
    for (consumer, list) in producers.iter().enumerate() {
        for &producer in list {
            consumers[producer].push(consumer);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(next)) = ready.pop() {
        order.push(next);
        for &consumer in &consumers[next] {
            in_degree[consumer] -= 1;
            if in_degree[consumer] == 0 {
                ready.push(Reverse(consumer));
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        let stuck = (0..n).filter(|i| in_degree[*i] > 0).collect();
        Err((order, stuck))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kahn_prefers_declaration_order() {
        // 0 and 2 are independent roots; 1 depends on 2.
        let producers = vec![vec![], vec![2], vec![]];
        assert_eq!(kahn_order(&producers).unwrap(), vec![0, 2, 1]);
    }

    #[test]
    fn test_kahn_reports_cycle_members() {
        let producers = vec![vec![], vec![2], vec![1]];
        let (partial, stuck) = kahn_order(&producers).unwrap_err();
        assert_eq!(partial, vec![0]);
        assert_eq!(stuck, vec![1, 2]);
    }
}
