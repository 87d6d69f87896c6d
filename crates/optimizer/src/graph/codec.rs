// ONNX protobuf <-> Graph conversion
//
// Loading validates everything the optimizer relies on before any pass runs:
// a default-domain opset in the supported range, unique producers, resolvable
// references and an acyclic node list. A model rejected here is never
// mutated or written.

use std::path::Path;

use petgraph::stable_graph::NodeIndex;
use prost::Message;
use tracing::debug;

use super::attributes::AttrValue;
use super::ir::{Dependency, Graph, GraphNode, ModelMetadata, MS_DOMAIN};
use crate::error::{FormatError, OptimizerError, Result};
use crate::proto::{GraphProto, ModelProto, NodeProto, OperatorSetIdProto};

/// Supported default-domain opset versions
pub const SUPPORTED_OPSETS: std::ops::RangeInclusive<i64> = 7..=21;

/// Decode and validate a serialized model
pub fn load(bytes: &[u8]) -> std::result::Result<Graph, FormatError> {
    let model = ModelProto::decode(bytes)?;
    Graph::from_model(model)
}

/// Encode a graph as a serialized model
pub fn save(graph: &Graph) -> Result<Vec<u8>> {
    Ok(graph.to_model()?.encode_to_vec())
}

/// Read and load a model file
pub fn load_file(path: impl AsRef<Path>) -> Result<Graph> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    debug!("Read {} bytes from {}", bytes.len(), path.display());
    Ok(load(&bytes)?)
}

/// Serialize and write a model file
pub fn save_file(graph: &Graph, path: impl AsRef<Path>) -> Result<()> {
    let bytes = save(graph)?;
    std::fs::write(path.as_ref(), &bytes)?;
    debug!("Wrote {} bytes to {}", bytes.len(), path.as_ref().display());
    Ok(())
}

impl Graph {
    /// Convert from an ONNX ModelProto
    pub fn from_model(model: ModelProto) -> std::result::Result<Self, FormatError> {
        let metadata = ModelMetadata {
            ir_version: model.ir_version,
            producer_name: model.producer_name,
            producer_version: model.producer_version,
            domain: model.domain,
            model_version: model.model_version,
            doc_string: model.doc_string,
            graph_name: String::new(),
            graph_doc_string: String::new(),
            opset_imports: model.opset_import,
            metadata_props: model.metadata_props,
            functions: model.functions,
            training_info: model.training_info,
            quantization_annotations: Vec::new(),
            sparse_initializers: Vec::new(),
        };
        let opset = metadata.onnx_opset().ok_or(FormatError::MissingOpset)?;
        if !SUPPORTED_OPSETS.contains(&opset) {
            return Err(FormatError::UnsupportedOpset(opset));
        }

        let onnx_graph = model.graph.ok_or(FormatError::MissingGraph)?;
        let mut hir = Graph::new();
        hir.metadata = metadata;
        hir.metadata.graph_name = onnx_graph.name;
        hir.metadata.graph_doc_string = onnx_graph.doc_string;
        hir.inputs = onnx_graph.input;
        hir.outputs = onnx_graph.output;
        hir.value_info = onnx_graph.value_info;
        hir.metadata.quantization_annotations = onnx_graph.quantization_annotation;
        hir.metadata.sparse_initializers = onnx_graph.sparse_initializer;
        for init in onnx_graph.initializer {
            hir.initializers.insert(init.name.clone(), init);
        }

        // Add all nodes, registering producers
        for (position, onnx_node) in onnx_graph.node.into_iter().enumerate() {
            let node = GraphNode::from_onnx_node(onnx_node, position as u64);
            if node.op_type.is_empty() {
                return Err(FormatError::MissingOpType(node_label(&node, position)));
            }
            let node_id = hir.graph.add_node(node);
            let node = &hir.graph[node_id];
            for (slot, output) in node.outputs.iter().enumerate() {
                if output.is_empty() {
                    continue;
                }
                if let Some(&(first, _)) = hir.tensor_producers.get(output) {
                    return Err(FormatError::DuplicateProducer {
                        tensor: output.clone(),
                        first: node_label(&hir.graph[first], first.index()),
                        second: node_label(node, position),
                    });
                }
                hir.tensor_producers.insert(output.clone(), (node_id, slot));
            }
            if !node.name.is_empty() {
                hir.name_to_id.insert(node.name.clone(), node_id);
            }
        }
        hir.next_order = hir.graph.node_count() as u64;

        // Connect inputs; collect first to avoid borrowing the graph mutably
        let mut edges: Vec<(NodeIndex, NodeIndex, Dependency)> = Vec::new();
        for node_id in hir.graph.node_indices() {
            let node = &hir.graph[node_id];
            for (input_slot, tensor) in node.inputs.iter().enumerate() {
                if tensor.is_empty() {
                    continue;
                }
                match hir.tensor_producers.get(tensor) {
                    Some(&(source, output_slot)) => edges.push((
                        source,
                        node_id,
                        Dependency {
                            tensor: tensor.clone(),
                            output_slot,
                            input_slot,
                        },
                    )),
                    None if hir.initializers.contains_key(tensor) || hir.is_graph_input(tensor) => {}
                    None => {
                        return Err(FormatError::DanglingInput {
                            node: node_label(node, node_id.index()),
                            tensor: tensor.clone(),
                        })
                    }
                }
            }
        }
        for (source, target, dependency) in edges {
            hir.graph.add_edge(source, target, dependency);
        }

        if let Some(output) = hir.outputs.iter().find(|o| !hir.is_defined(&o.name)) {
            return Err(FormatError::DanglingOutput(output.name.clone()));
        }

        hir.topological_order()?;
        Ok(hir)
    }

    /// Convert back to an ONNX ModelProto
    pub fn to_model(&self) -> Result<ModelProto> {
        let order = self
            .topological_order()
            .map_err(|e| OptimizerError::Graph(e.to_string()))?;

        let mut opset_import = self.metadata.opset_imports.clone();
        let uses_contrib = self.graph.node_weights().any(|n| n.domain == MS_DOMAIN);
        if uses_contrib && !opset_import.iter().any(|o| o.domain == MS_DOMAIN) {
            opset_import.push(OperatorSetIdProto {
                domain: MS_DOMAIN.to_string(),
                version: 1,
            });
        }

        let onnx_graph = GraphProto {
            node: order.into_iter().map(|id| self.graph[id].to_onnx_node()).collect(),
            name: self.metadata.graph_name.clone(),
            initializer: self.initializers.values().cloned().collect(),
            doc_string: self.metadata.graph_doc_string.clone(),
            input: self.inputs.clone(),
            output: self.outputs.clone(),
            value_info: self.value_info.clone(),
            quantization_annotation: self.metadata.quantization_annotations.clone(),
            sparse_initializer: self.metadata.sparse_initializers.clone(),
        };

        Ok(ModelProto {
            ir_version: self.metadata.ir_version,
            opset_import,
            producer_name: self.metadata.producer_name.clone(),
            producer_version: self.metadata.producer_version.clone(),
            domain: self.metadata.domain.clone(),
            model_version: self.metadata.model_version,
            doc_string: self.metadata.doc_string.clone(),
            graph: Some(onnx_graph),
            metadata_props: self.metadata.metadata_props.clone(),
            training_info: self.metadata.training_info.clone(),
            functions: self.metadata.functions.clone(),
        })
    }
}

impl GraphNode {
    /// Create from ONNX NodeProto
    pub fn from_onnx_node(node: NodeProto, order: u64) -> Self {
        Self {
            attributes: node
                .attribute
                .iter()
                .map(|a| (a.name.clone(), AttrValue::from_proto(a)))
                .collect(),
            name: node.name,
            op_type: node.op_type,
            domain: node.domain,
            inputs: node.input,
            outputs: node.output,
            doc_string: node.doc_string,
            order,
        }
    }

    pub fn to_onnx_node(&self) -> NodeProto {
        NodeProto {
            input: self.inputs.clone(),
            output: self.outputs.clone(),
            name: self.name.clone(),
            op_type: self.op_type.clone(),
            domain: self.domain.clone(),
            attribute: self
                .attributes
                .iter()
                .map(|(name, value)| value.to_proto(name))
                .collect(),
            doc_string: self.doc_string.clone(),
        }
    }
}

fn node_label(node: &GraphNode, position: usize) -> String {
    if node.name.is_empty() {
        format!("#{} ({})", position, node.op_type)
    } else {
        node.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tensor::{float_tensor, value_info, Dim};
    use crate::proto::tensor_proto::DataType;

    fn model(nodes: Vec<NodeProto>, opset: Option<(&str, i64)>) -> ModelProto {
        let x = value_info("x", DataType::Float, &[Dim::Fixed(2)]);
        let y = value_info("y", DataType::Float, &[Dim::Fixed(2)]);
        ModelProto {
            ir_version: 7,
            opset_import: opset
                .into_iter()
                .map(|(domain, version)| OperatorSetIdProto {
                    domain: domain.into(),
                    version,
                })
                .collect(),
            graph: Some(GraphProto {
                node: nodes,
                name: "g".into(),
                initializer: vec![float_tensor("w", &[2], &[1.0, 2.0])],
                input: vec![x],
                output: vec![y],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(op: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
        NodeProto {
            op_type: op.into(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn valid_nodes() -> Vec<NodeProto> {
        vec![node("Add", &["x", "w"], &["t"]), node("Relu", &["t"], &["y"])]
    }

    #[test]
    fn test_load_valid_model() {
        let bytes = model(valid_nodes(), Some(("", 12))).encode_to_vec();
        let graph = load(&bytes).unwrap();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.metadata.onnx_opset(), Some(12));
        assert_eq!(graph.statistics().total_edges, 1);
    }

    #[test]
    fn test_round_trip_is_structurally_equal() {
        let bytes = model(valid_nodes(), Some(("ai.onnx", 13))).encode_to_vec();
        let graph = load(&bytes).unwrap();
        let reloaded = load(&save(&graph).unwrap()).unwrap();
        assert!(graph.structurally_eq(&reloaded));
    }

    #[test]
    fn test_round_trip_keeps_opaque_sections() {
        // FunctionProto { name: "f" (field 1), domain: "local" (field 10) }
        let function = vec![0x0a, 0x01, b'f', 0x52, 0x05, b'l', b'o', b'c', b'a', b'l'];
        let mut m = model(valid_nodes(), Some(("", 12)));
        m.functions = vec![function.clone()];
        m.training_info = vec![vec![0x0a, 0x00]];
        let graph_proto = m.graph.as_mut().unwrap();
        graph_proto.quantization_annotation = vec![vec![0x0a, 0x01, b't']];
        graph_proto.sparse_initializer = vec![vec![0x18, 0x02]];

        let graph = load(&m.encode_to_vec()).unwrap();
        let saved = ModelProto::decode(save(&graph).unwrap().as_slice()).unwrap();
        assert_eq!(saved.functions, vec![function]);
        assert_eq!(saved.training_info, m.training_info);
        let saved_graph = saved.graph.unwrap();
        assert_eq!(saved_graph.quantization_annotation, vec![vec![0x0a, 0x01, b't']]);
        assert_eq!(saved_graph.sparse_initializer, vec![vec![0x18, 0x02]]);
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        assert!(matches!(load(&[0xff, 0xff, 0xff]), Err(FormatError::Decode(_))));
    }

    #[test]
    fn test_missing_opset_rejected() {
        let bytes = model(valid_nodes(), None).encode_to_vec();
        assert!(matches!(load(&bytes), Err(FormatError::MissingOpset)));

        let bytes = model(valid_nodes(), Some((MS_DOMAIN, 1))).encode_to_vec();
        assert!(matches!(load(&bytes), Err(FormatError::MissingOpset)));
    }

    #[test]
    fn test_unsupported_opset_rejected() {
        let bytes = model(valid_nodes(), Some(("", 6))).encode_to_vec();
        assert!(matches!(load(&bytes), Err(FormatError::UnsupportedOpset(6))));
    }

    #[test]
    fn test_missing_graph_rejected() {
        let mut m = model(valid_nodes(), Some(("", 12)));
        m.graph = None;
        assert!(matches!(load(&m.encode_to_vec()), Err(FormatError::MissingGraph)));
    }

    #[test]
    fn test_dangling_input_rejected() {
        let nodes = vec![node("Add", &["x", "missing"], &["y"])];
        let bytes = model(nodes, Some(("", 12))).encode_to_vec();
        assert!(matches!(load(&bytes), Err(FormatError::DanglingInput { .. })));
    }

    #[test]
    fn test_dangling_output_rejected() {
        let nodes = vec![node("Relu", &["x"], &["t"])];
        let bytes = model(nodes, Some(("", 12))).encode_to_vec();
        assert!(matches!(load(&bytes), Err(FormatError::DanglingOutput(name)) if name == "y"));
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let nodes = vec![node("Relu", &["x"], &["y"]), node("Neg", &["x"], &["y"])];
        let bytes = model(nodes, Some(("", 12))).encode_to_vec();
        assert!(matches!(load(&bytes), Err(FormatError::DuplicateProducer { .. })));
    }

    #[test]
    fn test_cycle_rejected() {
        let nodes = vec![node("Add", &["x", "b"], &["a"]), node("Relu", &["a"], &["b"])];
        let mut m = model(nodes, Some(("", 12)));
        m.graph.as_mut().unwrap().output[0].name = "a".into();
        assert!(matches!(load(&m.encode_to_vec()), Err(FormatError::Cycle)));
    }

    #[test]
    fn test_missing_op_type_rejected() {
        let nodes = vec![node("", &["x"], &["y"])];
        let bytes = model(nodes, Some(("", 12))).encode_to_vec();
        assert!(matches!(load(&bytes), Err(FormatError::MissingOpType(_))));
    }

    #[test]
    fn test_save_adds_contrib_opset() {
        let bytes = model(valid_nodes(), Some(("", 12))).encode_to_vec();
        let mut graph = load(&bytes).unwrap();
        graph
            .add_op("Gelu")
            .domain(MS_DOMAIN)
            .input("t")
            .output("g")
            .finish();
        let saved = ModelProto::decode(save(&graph).unwrap().as_slice()).unwrap();
        assert!(saved
            .opset_import
            .iter()
            .any(|o| o.domain == MS_DOMAIN && o.version == 1));
    }
}
