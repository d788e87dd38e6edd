//! Graph manipulation and validation utilities.
//!
//! Edges are implicit: a node depends on every node that produces one of the
//! names it consumes. This module derives those edges and provides
//! validation, stable topological ordering and dependency closures.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use crate::error::{CoreError, Result};
use crate::tensor::Tensor;
use crate::types::{AttributeValue, GraphNode, ModelGraph, NodeId, ValueInfo, ValueType};

impl ModelGraph {
    /// Create a new empty model graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph, returning the assigned node ID.
    pub fn add_node(&mut self, mut node: GraphNode) -> NodeId {
        let node_id = self.nodes.len();
        node.id = node_id;
        self.nodes.push(node);
        node_id
    }

    /// Get a node by ID.
    pub fn get_node(&self, node_id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(node_id)
    }

    /// Get a mutable node by ID.
    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut GraphNode> {
        self.nodes.get_mut(node_id)
    }

    /// Get all nodes in the graph.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Get the number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Names of the declared graph inputs, in order.
    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|v| v.name.as_str()).collect()
    }

    /// Names of the declared graph outputs, in order.
    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|v| v.name.as_str()).collect()
    }

    /// Find nodes by operation type.
    pub fn find_nodes_by_op(&self, op_type: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.op_type == op_type)
            .map(|node| node.id)
            .collect()
    }

    /// Count nodes by operation type.
    pub fn count_ops(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for node in &self.nodes {
            *counts.entry(node.op_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Whether `name` is available before any node runs.
    pub fn is_external_value(&self, name: &str) -> bool {
        self.initializers.contains_key(name) || self.inputs.iter().any(|v| v.name == name)
    }

    /// Map from value name to the nodes that write it, in node order.
    pub fn producers(&self) -> HashMap<&str, Vec<NodeId>> {
        let mut producers: HashMap<&str, Vec<NodeId>> = HashMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            for output in node.outputs.iter().filter(|o| !o.is_empty()) {
                producers.entry(output.as_str()).or_default().push(idx);
            }
        }
        producers
    }

    /// Predecessor set of every node, derived from value names.
    ///
    /// Fails with [`CoreError::UndefinedValue`] when a node consumes a name
    /// that is neither external nor produced by any node.
    pub fn node_dependencies(&self) -> Result<Vec<BTreeSet<NodeId>>> {
        let producers = self.producers();
        let mut deps = vec![BTreeSet::new(); self.nodes.len()];

        for (idx, node) in self.nodes.iter().enumerate() {
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                match producers.get(input.as_str()) {
                    Some(writers) => deps[idx].extend(writers.iter().copied()),
                    None if self.is_external_value(input) => {}
                    None => {
                        return Err(CoreError::UndefinedValue {
                            node: node.display_name(),
                            name: input.clone(),
                        })
                    }
                }
            }
        }
        Ok(deps)
    }

    /// Stable topological ordering of all nodes.
    ///
    /// Among nodes that are ready at the same time the one that appears
    /// first in the file runs first, so an already ordered graph keeps its
    /// order.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>> {
        let deps = self.node_dependencies()?;
        let mut in_degree: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
        let mut successors: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        for (idx, preds) in deps.iter().enumerate() {
            for &pred in preds {
                successors[pred].push(idx);
            }
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for &next in &successors[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() != self.nodes.len() {
            let scheduled: HashSet<NodeId> = order.iter().copied().collect();
            let nodes = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(idx, _)| !scheduled.contains(idx))
                .map(|(_, node)| node.display_name())
                .collect();
            return Err(CoreError::CyclicGraph { nodes });
        }

        Ok(order)
    }

    /// Check if the graph has cycles.
    pub fn has_cycles(&self) -> bool {
        matches!(self.topological_sort(), Err(CoreError::CyclicGraph { .. }))
    }

    /// Nodes needed to compute `names`, walking producers backwards.
    ///
    /// Unknown names fail with [`CoreError::UndefinedValue`].
    pub fn dependency_closure(&self, names: &[&str]) -> Result<BTreeSet<NodeId>> {
        let producers = self.producers();
        let mut closure = BTreeSet::new();
        let mut pending: Vec<&str> = Vec::new();

        for &name in names {
            if !producers.contains_key(name) && !self.is_external_value(name) {
                return Err(CoreError::UndefinedValue {
                    node: self.name.clone().unwrap_or_else(|| "<graph>".to_string()),
                    name: name.to_string(),
                });
            }
            pending.push(name);
        }

        while let Some(name) = pending.pop() {
            let Some(writers) = producers.get(name) else {
                continue;
            };
            for &writer in writers {
                if closure.insert(writer) {
                    pending.extend(
                        self.nodes[writer]
                            .inputs
                            .iter()
                            .filter(|i| !i.is_empty())
                            .map(String::as_str),
                    );
                }
            }
        }

        Ok(closure)
    }

    /// Types the graph states explicitly: inputs, outputs, `value_info`
    /// and initializers.
    pub fn explicit_types(&self) -> HashMap<String, ValueType> {
        let mut types = HashMap::new();
        for (name, tensor) in &self.initializers {
            types.insert(name.clone(), ValueType::Tensor(tensor.dtype()));
        }
        for info in self
            .inputs
            .iter()
            .chain(&self.outputs)
            .chain(&self.value_info)
        {
            if let Some(value_type) = &info.value_type {
                types.insert(info.name.clone(), value_type.clone());
            }
        }
        types
    }

    /// Validate the graph structure.
    pub fn validate(&self) -> Result<()> {
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.id != idx {
                return Err(CoreError::InvalidArgument(format!(
                    "node '{}' has id {} at position {}",
                    node.display_name(),
                    node.id,
                    idx
                )));
            }
        }

        self.topological_sort()?;

        let producers = self.producers();
        for output in &self.outputs {
            if !producers.contains_key(output.name.as_str()) && !self.is_external_value(&output.name)
            {
                return Err(CoreError::UndefinedValue {
                    node: self.name.clone().unwrap_or_else(|| "<graph>".to_string()),
                    name: output.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Get graph statistics.
    pub fn statistics(&self) -> GraphStatistics {
        let deps = self.node_dependencies().ok();
        let edge_count = deps
            .as_ref()
            .map(|d| d.iter().map(BTreeSet::len).sum())
            .unwrap_or(0);
        let depth = deps.map(|d| self.calculate_depth(&d)).unwrap_or(0);

        GraphStatistics {
            node_count: self.nodes.len(),
            edge_count,
            op_counts: self.count_ops(),
            input_count: self.inputs.len(),
            output_count: self.outputs.len(),
            initializer_count: self.initializers.len(),
            depth,
        }
    }

    /// Longest chain of dependent nodes; 0 for cyclic graphs.
    fn calculate_depth(&self, deps: &[BTreeSet<NodeId>]) -> usize {
        let Ok(order) = self.topological_sort() else {
            return 0;
        };
        let mut depths = vec![0usize; self.nodes.len()];
        for &idx in &order {
            depths[idx] = deps[idx]
                .iter()
                .map(|&p| depths[p] + 1)
                .max()
                .unwrap_or(0);
        }
        depths.into_iter().max().unwrap_or(0)
    }
}

/// Graph statistics.
#[derive(Debug, Clone)]
pub struct GraphStatistics {
    /// Total number of nodes.
    pub node_count: usize,
    /// Number of producer/consumer node pairs.
    pub edge_count: usize,
    /// Count of each operation type.
    pub op_counts: HashMap<String, usize>,
    /// Number of graph inputs.
    pub input_count: usize,
    /// Number of graph outputs.
    pub output_count: usize,
    /// Number of initializers.
    pub initializer_count: usize,
    /// Maximum depth of the graph.
    pub depth: usize,
}

/// Graph builder for convenient graph construction.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: ModelGraph,
}

impl GraphBuilder {
    /// Create a new graph builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the graph name.
    pub fn name(&mut self, name: &str) -> &mut Self {
        self.graph.name = Some(name.to_string());
        self
    }

    /// Declare a graph input.
    pub fn input(&mut self, info: ValueInfo) -> &mut Self {
        self.graph.inputs.push(info);
        self
    }

    /// Declare a graph output.
    pub fn output(&mut self, info: ValueInfo) -> &mut Self {
        self.graph.outputs.push(info);
        self
    }

    /// Add a named constant.
    pub fn initializer(&mut self, name: &str, tensor: Tensor) -> &mut Self {
        self.graph.initializers.insert(name.to_string(), tensor);
        self
    }

    /// Import an opset version for a domain.
    pub fn opset(&mut self, domain: &str, version: i64) -> &mut Self {
        self.graph.opset_imports.insert(domain.to_string(), version);
        self
    }

    /// Add a fully constructed node.
    pub fn node(&mut self, node: GraphNode) -> NodeId {
        self.graph.add_node(node)
    }

    /// Add a node with the given operation type and wiring.
    pub fn add_op(&mut self, op_type: &str, inputs: &[&str], outputs: &[&str]) -> NodeId {
        self.graph.add_node(
            GraphNode::new(op_type)
                .with_inputs(inputs)
                .with_outputs(outputs),
        )
    }

    /// Add an attribute to a node.
    pub fn add_attribute(
        &mut self,
        node_id: NodeId,
        name: &str,
        value: AttributeValue,
    ) -> &mut Self {
        if let Some(node) = self.graph.get_node_mut(node_id) {
            node.attributes.insert(name.to_string(), value);
        }
        self
    }

    /// Build the graph without validating it.
    pub fn build_unchecked(self) -> ModelGraph {
        self.graph
    }

    /// Build the final graph.
    pub fn build(self) -> Result<ModelGraph> {
        self.graph.validate()?;
        Ok(self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn chain() -> ModelGraph {
        let mut builder = GraphBuilder::new();
        builder
            .input(ValueInfo::tensor("x", DataType::F32))
            .output(ValueInfo::new("c_out"));
        builder.add_op("Relu", &["x"], &["a_out"]);
        builder.add_op("Abs", &["a_out"], &["b_out"]);
        builder.add_op("Neg", &["b_out"], &["c_out"]);
        builder.build_unchecked()
    }

    #[test]
    fn test_graph_creation() {
        let mut graph = ModelGraph::new();
        assert_eq!(graph.node_count(), 0);

        let node_id = graph.add_node(
            GraphNode::new("Conv")
                .with_inputs(&["input1"])
                .with_outputs(&["output1"])
                .with_name("conv1"),
        );
        assert_eq!(node_id, 0);
        assert_eq!(graph.get_node(0).map(|n| n.op_type.as_str()), Some("Conv"));
    }

    #[test]
    fn test_topological_sort() -> Result<()> {
        assert_eq!(chain().topological_sort()?, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_topological_sort_reorders_and_is_stable() -> Result<()> {
        let mut graph = ModelGraph::new();
        graph.inputs.push(ValueInfo::new("x"));
        graph.add_node(GraphNode::new("Add").with_inputs(&["p", "q"]).with_outputs(&["y"]));
        graph.add_node(GraphNode::new("Abs").with_inputs(&["x"]).with_outputs(&["q"]));
        graph.add_node(GraphNode::new("Neg").with_inputs(&["x"]).with_outputs(&["p"]));

        assert_eq!(graph.topological_sort()?, vec![1, 2, 0]);
        Ok(())
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = ModelGraph::new();
        graph.add_node(GraphNode::new("A").with_inputs(&["b_out"]).with_outputs(&["a_out"]));
        graph.add_node(GraphNode::new("B").with_inputs(&["a_out"]).with_outputs(&["b_out"]));

        assert!(graph.has_cycles());
        match graph.topological_sort() {
            Err(CoreError::CyclicGraph { nodes }) => assert_eq!(nodes, vec!["A#0", "B#1"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_undefined_value() {
        let mut graph = ModelGraph::new();
        graph.add_node(
            GraphNode::new("Add")
                .with_name("adder")
                .with_inputs(&["x", "ghost"])
                .with_outputs(&["y"]),
        );
        graph.inputs.push(ValueInfo::new("x"));

        assert_eq!(
            graph.topological_sort(),
            Err(CoreError::UndefinedValue {
                node: "adder".to_string(),
                name: "ghost".to_string()
            })
        );
    }

    #[test]
    fn test_optional_inputs_are_ignored() -> Result<()> {
        let mut graph = ModelGraph::new();
        graph.inputs.push(ValueInfo::new("x"));
        graph.add_node(GraphNode::new("Clip").with_inputs(&["x", "", ""]).with_outputs(&["y"]));
        assert_eq!(graph.topological_sort()?, vec![0]);
        Ok(())
    }

    #[test]
    fn test_dependency_closure() -> Result<()> {
        let mut graph = chain();
        graph.add_node(GraphNode::new("Exp").with_inputs(&["x"]).with_outputs(&["side"]));

        let closure = graph.dependency_closure(&["b_out"])?;
        assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec![0, 1]);
        assert!(graph.dependency_closure(&["x"])?.is_empty());
        assert!(graph.dependency_closure(&["nowhere"]).is_err());
        Ok(())
    }

    #[test]
    fn test_statistics() {
        let stats = chain().statistics();
        assert_eq!(stats.node_count, 3);
        assert_eq!(stats.edge_count, 2);
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.op_counts.get("Abs"), Some(&1));
    }

    #[test]
    fn test_graph_builder_validates_outputs() {
        let mut builder = GraphBuilder::new();
        builder
            .input(ValueInfo::new("x"))
            .output(ValueInfo::new("missing"));
        builder.add_op("Relu", &["x"], &["y"]);
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_explicit_types() {
        let mut builder = GraphBuilder::new();
        builder
            .input(ValueInfo::tensor("x", DataType::I64))
            .initializer("w", Tensor::scalar(1.0f64));
        let types = builder.build_unchecked().explicit_types();
        assert_eq!(types["x"], ValueType::Tensor(DataType::I64));
        assert_eq!(types["w"], ValueType::Tensor(DataType::F64));
    }
}
