// Graph Intermediate Representation
//
// Arena-backed mutable graph of ONNX nodes built on petgraph. Nodes are
// addressed by stable indices, so removing a node never invalidates the ids
// a pass is still holding. Data edges mirror tensor flow; the
// `tensor_producers` map is the source of truth for which node produces a
// tensor and is what fusions rewrite when a fused node takes over outputs.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;

use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};

use super::attributes::AttrValue;
use crate::error::FormatError;
use crate::proto::{OperatorSetIdProto, StringStringEntryProto, TensorProto, ValueInfoProto};

/// Node identifier in the graph (petgraph NodeIndex)
pub type NodeId = NodeIndex;

/// Domain of the runtime contrib operators emitted by fusions
pub const MS_DOMAIN: &str = "com.microsoft";

/// Data edge: `tensor` flows from the source's output slot into the
/// destination's input slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub tensor: String,
    pub output_slot: usize,
    pub input_slot: usize,
}

/// A node in the computation graph
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    /// Node name (may be empty)
    pub name: String,
    /// Operation type (e.g., "Add", "MatMul", "Attention")
    pub op_type: String,
    /// Operator domain ("" for default ONNX)
    pub domain: String,
    /// Input tensor names; an empty name is an omitted optional input
    pub inputs: Vec<String>,
    /// Output tensor names
    pub outputs: Vec<String>,
    /// Operation attributes
    pub attributes: BTreeMap<String, AttrValue>,
    pub doc_string: String,
    /// Serialization ordering key. Loaded nodes get their file position;
    /// fused nodes inherit the key of the node they replace.
    pub order: u64,
}

impl GraphNode {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            op_type: op_type.into(),
            domain: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: BTreeMap::new(),
            doc_string: String::new(),
            order: 0,
        }
    }

    /// Get attribute by name
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(AttrValue::as_int)
    }

    pub fn attr_float(&self, name: &str) -> Option<f32> {
        self.attr(name).and_then(AttrValue::as_float)
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        self.attr(name).and_then(AttrValue::as_ints)
    }

    /// Input name at `slot`, `None` when absent or omitted
    pub fn input(&self, slot: usize) -> Option<&str> {
        self.inputs.get(slot).map(String::as_str).filter(|s| !s.is_empty())
    }

    /// Name used in logs and error messages
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.outputs.first().map(String::as_str).unwrap_or(&self.op_type)
        } else {
            &self.name
        }
    }

    /// True for nodes in the default ONNX domain
    pub fn is_onnx(&self) -> bool {
        self.domain.is_empty() || self.domain == "ai.onnx"
    }
}

/// Model-level data carried through optimization unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelMetadata {
    pub ir_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub domain: String,
    pub model_version: i64,
    pub doc_string: String,
    pub graph_name: String,
    pub graph_doc_string: String,
    pub opset_imports: Vec<OperatorSetIdProto>,
    pub metadata_props: Vec<StringStringEntryProto>,
    /// Opaque encoded messages the optimizer never inspects
    pub functions: Vec<Vec<u8>>,
    pub training_info: Vec<Vec<u8>>,
    pub quantization_annotations: Vec<Vec<u8>>,
    pub sparse_initializers: Vec<Vec<u8>>,
}

impl ModelMetadata {
    /// Version of the default-domain opset, if imported
    pub fn onnx_opset(&self) -> Option<i64> {
        self.opset_imports
            .iter()
            .filter(|o| o.domain.is_empty() || o.domain == "ai.onnx")
            .map(|o| o.version)
            .max()
    }
}

/// ONNX computation graph using petgraph
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// The underlying petgraph structure
    pub(super) graph: StableGraph<GraphNode, Dependency>,

    /// Tensor name to producer mapping: name → (node_id, output_slot)
    pub(super) tensor_producers: FxHashMap<String, (NodeId, usize)>,

    /// Node name to node ID mapping
    pub(super) name_to_id: FxHashMap<String, NodeId>,

    /// Graph inputs, declaration order
    pub(super) inputs: Vec<ValueInfoProto>,

    /// Graph outputs, declaration order
    pub(super) outputs: Vec<ValueInfoProto>,

    /// Intermediate value infos
    pub(super) value_info: Vec<ValueInfoProto>,

    /// Initializers (constant weights) ordered by name
    pub(super) initializers: BTreeMap<String, TensorProto>,

    pub metadata: ModelMetadata,

    pub(super) next_order: u64,
    name_counter: usize,
}

impl Graph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a new operation
    pub fn add_op(&mut self, op_type: impl Into<String>) -> NewOp<'_> {
        NewOp::new(self, op_type.into())
    }

    /// Insert a node, register its outputs and connect its inputs.
    ///
    /// If an output tensor already has a producer, the new node takes over:
    /// the old producer keeps the name in its output list but every consumer
    /// edge is moved to the new node.
    pub fn insert_node(&mut self, node: GraphNode) -> NodeId {
        self.next_order = self.next_order.max(node.order + 1);
        let node_id = self.graph.add_node(node);
        let node = &self.graph[node_id];

        let inputs: Vec<(usize, String)> = node
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .map(|(slot, name)| (slot, name.clone()))
            .collect();
        let outputs = node.outputs.clone();
        if !node.name.is_empty() {
            self.name_to_id.insert(node.name.clone(), node_id);
        }

        for (input_slot, tensor) in inputs {
            if let Some(&(source, output_slot)) = self.tensor_producers.get(&tensor) {
                self.graph.add_edge(
                    source,
                    node_id,
                    Dependency {
                        tensor,
                        output_slot,
                        input_slot,
                    },
                );
            }
        }

        for (slot, tensor) in outputs.into_iter().enumerate() {
            if tensor.is_empty() {
                continue;
            }
            if let Some((old, _)) = self.tensor_producers.insert(tensor.clone(), (node_id, slot)) {
                self.redirect_consumers(old, node_id, &tensor, slot);
            }
        }

        node_id
    }

    fn redirect_consumers(&mut self, from: NodeId, to: NodeId, tensor: &str, output_slot: usize) {
        let moved: Vec<_> = self
            .graph
            .edges_directed(from, Direction::Outgoing)
            .filter(|e| e.weight().tensor == tensor)
            .map(|e| (e.id(), e.target(), e.weight().input_slot))
            .collect();
        for (edge, target, input_slot) in moved {
            self.graph.remove_edge(edge);
            self.graph.add_edge(
                to,
                target,
                Dependency {
                    tensor: tensor.to_string(),
                    output_slot,
                    input_slot,
                },
            );
        }
    }

    /// Remove a node. Producer entries still pointing at it are dropped;
    /// entries taken over by another node are left alone.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<GraphNode> {
        let node = self.graph.remove_node(node_id)?;
        for tensor in &node.outputs {
            if matches!(self.tensor_producers.get(tensor), Some(&(id, _)) if id == node_id) {
                self.tensor_producers.remove(tensor);
            }
        }
        if self.name_to_id.get(&node.name) == Some(&node_id) {
            self.name_to_id.remove(&node.name);
        }
        Some(node)
    }

    /// Get node by ID
    pub fn node(&self, node_id: NodeId) -> Option<&GraphNode> {
        self.graph.node_weight(node_id)
    }

    /// Get node by name
    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_id.get(name).copied()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.graph.contains_node(node_id)
    }

    /// Node ids in arena order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_indices().collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &GraphNode)> {
        self.graph.node_indices().map(move |id| (id, &self.graph[id]))
    }

    /// Number of nodes with the given op type
    pub fn count_op(&self, op_type: &str) -> usize {
        self.graph.node_weights().filter(|n| n.op_type == op_type).count()
    }

    /// Producer of a tensor: (node, output slot)
    pub fn producer(&self, tensor: &str) -> Option<(NodeId, usize)> {
        self.tensor_producers.get(tensor).copied()
    }

    pub fn producer_node(&self, tensor: &str) -> Option<NodeId> {
        self.producer(tensor).map(|(id, _)| id)
    }

    /// Consumers of a tensor as (node, input slot), ordered by node id then slot
    pub fn consumers_of(&self, tensor: &str) -> Vec<(NodeId, usize)> {
        let mut consumers: Vec<(NodeId, usize)> = match self.producer(tensor) {
            Some((source, _)) => self
                .graph
                .edges_directed(source, Direction::Outgoing)
                .filter(|e| e.weight().tensor == tensor)
                .map(|e| (e.target(), e.weight().input_slot))
                .collect(),
            None => self
                .nodes()
                .flat_map(|(id, node)| {
                    node.inputs
                        .iter()
                        .enumerate()
                        .filter(|(_, name)| name.as_str() == tensor)
                        .map(move |(slot, _)| (id, slot))
                })
                .collect(),
        };
        consumers.sort();
        consumers
    }

    /// Direct upstream nodes, one entry per connected input
    pub fn predecessors(&self, node_id: NodeId) -> Vec<NodeId> {
        self.graph
            .edges_directed(node_id, Direction::Incoming)
            .map(|e| e.source())
            .collect()
    }

    pub fn is_graph_input(&self, tensor: &str) -> bool {
        self.inputs.iter().any(|i| i.name == tensor)
    }

    pub fn is_graph_output(&self, tensor: &str) -> bool {
        self.outputs.iter().any(|o| o.name == tensor)
    }

    /// True when `tensor` is defined by a producer, a graph input or an initializer
    pub fn is_defined(&self, tensor: &str) -> bool {
        self.tensor_producers.contains_key(tensor)
            || self.initializers.contains_key(tensor)
            || self.is_graph_input(tensor)
    }

    /// Get graph inputs
    pub fn graph_inputs(&self) -> &[ValueInfoProto] {
        &self.inputs
    }

    /// Get graph outputs
    pub fn graph_outputs(&self) -> &[ValueInfoProto] {
        &self.outputs
    }

    pub fn value_info(&self) -> &[ValueInfoProto] {
        &self.value_info
    }

    pub fn add_input(&mut self, info: ValueInfoProto) {
        self.inputs.push(info);
    }

    pub fn add_output(&mut self, info: ValueInfoProto) {
        self.outputs.push(info);
    }

    pub fn add_value_info(&mut self, info: ValueInfoProto) {
        self.value_info.push(info);
    }

    /// Keep only the graph inputs for which `keep` returns true; returns the
    /// number removed
    pub fn retain_inputs(&mut self, mut keep: impl FnMut(&ValueInfoProto) -> bool) -> usize {
        let before = self.inputs.len();
        self.inputs.retain(|i| keep(i));
        before - self.inputs.len()
    }

    pub fn retain_value_info(&mut self, mut keep: impl FnMut(&ValueInfoProto) -> bool) -> usize {
        let before = self.value_info.len();
        self.value_info.retain(|i| keep(i));
        before - self.value_info.len()
    }

    /// Get initializers map
    pub fn initializers(&self) -> &BTreeMap<String, TensorProto> {
        &self.initializers
    }

    pub fn initializer(&self, name: &str) -> Option<&TensorProto> {
        self.initializers.get(name)
    }

    /// Add or replace an initializer under its own name
    pub fn add_initializer(&mut self, tensor: TensorProto) {
        self.initializers.insert(tensor.name.clone(), tensor);
    }

    pub fn remove_initializer(&mut self, name: &str) -> Option<TensorProto> {
        self.initializers.remove(name)
    }

    /// Constant tensor behind a name: an initializer, or the `value`
    /// attribute of a `Constant` node
    pub fn constant_value(&self, tensor: &str) -> Option<&TensorProto> {
        if let Some(init) = self.initializers.get(tensor) {
            return Some(init);
        }
        let node = self.node(self.producer_node(tensor)?)?;
        if node.op_type == "Constant" {
            node.attr("value").and_then(AttrValue::as_tensor)
        } else {
            None
        }
    }

    pub fn is_constant(&self, tensor: &str) -> bool {
        self.constant_value(tensor).is_some()
    }

    /// Unused tensor name derived from `base`: `base` itself, else the first
    /// free `base_N`
    pub fn fresh_tensor_name(&self, base: &str) -> String {
        if !self.is_name_taken(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|candidate| !self.is_name_taken(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Unused node name derived from `base`
    pub fn fresh_node_name(&mut self, base: &str) -> String {
        if !self.name_to_id.contains_key(base) {
            return base.to_string();
        }
        loop {
            self.name_counter += 1;
            let candidate = format!("{base}_{}", self.name_counter);
            if !self.name_to_id.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn is_name_taken(&self, name: &str) -> bool {
        self.is_defined(name) || self.is_graph_output(name)
    }

    /// Stable topological order.
    ///
    /// Kahn's algorithm with a min-heap on (ordering key, arena index), so the
    /// original relative order is preserved wherever dependencies allow.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, FormatError> {
        let mut in_degree: FxHashMap<NodeId, usize> = FxHashMap::default();
        let mut ready = BinaryHeap::new();
        for id in self.graph.node_indices() {
            let degree = self.graph.edges_directed(id, Direction::Incoming).count();
            in_degree.insert(id, degree);
            if degree == 0 {
                ready.push(Reverse((self.graph[id].order, id.index())));
            }
        }

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, index))) = ready.pop() {
            let id = NodeIndex::new(index);
            order.push(id);
            for edge in self.graph.edges_directed(id, Direction::Outgoing) {
                let target = edge.target();
                if let Some(degree) = in_degree.get_mut(&target) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.graph[target].order, target.index())));
                    }
                }
            }
        }

        if order.len() == self.graph.node_count() {
            Ok(order)
        } else {
            Err(FormatError::Cycle)
        }
    }

    /// Topological rank of every node
    pub fn topological_ranks(&self) -> Result<FxHashMap<NodeId, usize>, FormatError> {
        Ok(self
            .topological_order()?
            .into_iter()
            .enumerate()
            .map(|(rank, id)| (id, rank))
            .collect())
    }

    /// Structural equality: same nodes in the same stable order (ignoring
    /// arena ids and ordering keys), same initializers, inputs, outputs,
    /// value infos and opset imports.
    pub fn structurally_eq(&self, other: &Graph) -> bool {
        let (Ok(a), Ok(b)) = (self.topological_order(), other.topological_order()) else {
            return false;
        };
        if a.len() != b.len() {
            return false;
        }
        let same_nodes = a.iter().zip(&b).all(|(&x, &y)| {
            let (n, m) = (&self.graph[x], &other.graph[y]);
            n.name == m.name
                && n.op_type == m.op_type
                && n.domain == m.domain
                && n.inputs == m.inputs
                && n.outputs == m.outputs
                && n.attributes == m.attributes
        });
        same_nodes
            && self.initializers == other.initializers
            && self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.value_info == other.value_info
            && self.metadata.opset_imports == other.metadata.opset_imports
    }

    /// Tensors read by live nodes or declared as graph outputs
    pub fn referenced_tensors(&self) -> FxHashSet<&str> {
        self.graph
            .node_weights()
            .flat_map(|n| n.inputs.iter())
            .chain(self.outputs.iter().map(|o| &o.name))
            .filter(|name| !name.is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Get graph statistics
    pub fn statistics(&self) -> GraphStatistics {
        let mut op_type_counts: BTreeMap<String, usize> = BTreeMap::new();
        for node in self.graph.node_weights() {
            *op_type_counts.entry(node.op_type.clone()).or_insert(0) += 1;
        }

        GraphStatistics {
            total_nodes: self.graph.node_count(),
            total_edges: self.graph.edge_count(),
            num_inputs: self.inputs.len(),
            num_outputs: self.outputs.len(),
            num_initializers: self.initializers.len(),
            opset: self.metadata.onnx_opset(),
            op_type_counts,
        }
    }
}

/// Builder for adding operations to the graph
pub struct NewOp<'a> {
    graph: &'a mut Graph,
    node_data: GraphNode,
    explicit_order: bool,
}

impl<'a> NewOp<'a> {
    fn new(graph: &'a mut Graph, op_type: String) -> Self {
        Self {
            graph,
            node_data: GraphNode::new(op_type),
            explicit_order: false,
        }
    }

    /// Set node name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.node_data.name = name.into();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.node_data.domain = domain.into();
        self
    }

    /// Append an input tensor
    pub fn input(mut self, tensor: impl Into<String>) -> Self {
        self.node_data.inputs.push(tensor.into());
        self
    }

    pub fn inputs<I, S>(mut self, tensors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_data.inputs.extend(tensors.into_iter().map(Into::into));
        self
    }

    /// Append an output tensor
    pub fn output(mut self, tensor: impl Into<String>) -> Self {
        self.node_data.outputs.push(tensor.into());
        self
    }

    pub fn outputs<I, S>(mut self, tensors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_data.outputs.extend(tensors.into_iter().map(Into::into));
        self
    }

    /// Add an attribute
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.node_data.attributes.insert(name.into(), value.into());
        self
    }

    /// Use an explicit ordering key instead of appending
    pub fn order(mut self, order: u64) -> Self {
        self.node_data.order = order;
        self.explicit_order = true;
        self
    }

    /// Finish building and add to graph
    pub fn finish(mut self) -> NodeId {
        if !self.explicit_order {
            self.node_data.order = self.graph.next_order;
        }
        self.graph.insert_node(self.node_data)
    }
}

/// Graph statistics
#[derive(Debug, Clone)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub num_initializers: usize,
    pub opset: Option<i64>,
    pub op_type_counts: BTreeMap<String, usize>,
}

impl fmt::Display for GraphStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph Statistics:")?;
        if let Some(opset) = self.opset {
            writeln!(f, "  Opset: {}", opset)?;
        }
        writeln!(f, "  Total nodes: {}", self.total_nodes)?;
        writeln!(f, "  Total edges: {}", self.total_edges)?;
        writeln!(f, "  Graph inputs: {}", self.num_inputs)?;
        writeln!(f, "  Graph outputs: {}", self.num_outputs)?;
        writeln!(f, "  Initializers: {}", self.num_initializers)?;
        writeln!(f, "  Operation types:")?;

        let mut sorted_ops: Vec<_> = self.op_type_counts.iter().collect();
        sorted_ops.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        for (op_type, count) in sorted_ops {
            writeln!(f, "    {}: {}", op_type, count)?;
        }

        Ok(())
    }
}
