// EmbedLayerNormalization fusion
//
// LayerNormalization(Add(Add(Gather, Gather), Gather)) over the word,
// position and segment tables becomes one EmbedLayerNormalization node. The
// tables are told apart by row count: the largest is the vocabulary, the
// smallest the segment table. Token and segment ids are cast to int32 once;
// position ids are passed only when they come from a graph input, an
// `arange` constant is implied by the operator.

use super::{FusedNodeSpec, Fusion, FusionContext, FusionKind};
use crate::error::FusionError;
use crate::graph::tensor::i64_values;
use crate::graph::{AttrValue, Graph, GraphNode, MS_DOMAIN};
use crate::matcher::{Match, PathStep, Pattern};
use crate::proto::tensor_proto::DataType;

pub struct EmbedLayerNormFusion;

/// One embedding lookup: table initializer and index tensor
struct Lookup<'a> {
    table: &'a str,
    indices: &'a str,
    rows: i64,
    width: i64,
}

impl Fusion for EmbedLayerNormFusion {
    fn kind(&self) -> FusionKind {
        FusionKind::EmbedLayerNormalization
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::new("embed_layer_norm", "LayerNormalization")
            .path([PathStep::at("Add", 0)])
            .path_from(0, 0, [PathStep::any("Add")])
            .path_from(0, 0, [PathStep::any("Gather")])
            .path_from(1, 0, [PathStep::at("Gather", 0)])
            .path_from(1, 0, [PathStep::at("Gather", 1)])]
    }

    fn plan(&self, m: &Match, graph: &Graph, _ctx: &FusionContext) -> Result<FusedNodeSpec, FusionError> {
        let ln = graph.node(m.anchor).ok_or(FusionError::NoMatch)?;
        if !ln.is_onnx() || ln.attr_int("axis").unwrap_or(-1) != -1 {
            return Err(FusionError::NoMatch);
        }
        let gamma = ln.input(1).ok_or(FusionError::NoMatch)?;
        let beta = ln.input(2).ok_or(FusionError::NoMatch)?;
        let epsilon = ln.attr_float("epsilon").unwrap_or(1e-12);

        let mut lookups = [m.node(2, 0), m.node(3, 0), m.node(4, 0)]
            .into_iter()
            .map(|id| graph.node(id).ok_or(FusionError::NoMatch).and_then(|g| lookup(graph, g)))
            .collect::<Result<Vec<_>, _>>()?;

        let hidden = graph
            .constant_value(gamma)
            .and_then(|t| t.dims.last().copied())
            .ok_or(FusionError::NoMatch)?;
        if lookups.iter().any(|l| l.width != hidden) {
            return Err(FusionError::NoMatch);
        }

        lookups.sort_by_key(|l| l.rows);
        if lookups[0].rows == lookups[1].rows || lookups[1].rows == lookups[2].rows {
            return Err(FusionError::UnderSpecified(
                "embedding tables cannot be told apart by size".into(),
            ));
        }
        let (segment, position, word) = (&lookups[0], &lookups[1], &lookups[2]);

        for ids in [word.indices, segment.indices] {
            if graph.is_constant(ids) {
                return Err(FusionError::NoMatch);
            }
        }

        let mut spec = FusedNodeSpec::new("EmbedLayerNormalization", MS_DOMAIN)
            .name_hint("EmbedLayerNorm")
            .attr("epsilon", epsilon);

        let word_ids = int32_ids(graph, word.indices, &mut spec);
        let segment_ids = int32_ids(graph, segment.indices, &mut spec);
        let mut inputs = vec![
            word_ids,
            segment_ids,
            word.table.to_string(),
            position.table.to_string(),
            segment.table.to_string(),
            gamma.to_string(),
            beta.to_string(),
            String::new(),
        ];

        match graph.constant_value(position.indices) {
            Some(tensor) => {
                let values = i64_values(tensor).ok_or_else(|| {
                    FusionError::UnderSpecified("position ids constant has no readable values".into())
                })?;
                let is_arange = values.iter().enumerate().all(|(i, &v)| v == i as i64);
                if !is_arange {
                    return Err(FusionError::UnderSpecified(
                        "position ids are a constant other than 0..n".into(),
                    ));
                }
            }
            None if graph.is_graph_input(position.indices) => {
                inputs.push(int32_ids(graph, position.indices, &mut spec));
            }
            None => {
                return Err(FusionError::UnderSpecified(format!(
                    "position ids '{}' are neither a graph input nor a constant",
                    position.indices
                )))
            }
        }

        Ok(spec.inputs(inputs))
    }
}

fn lookup<'a>(graph: &Graph, gather: &'a GraphNode) -> Result<Lookup<'a>, FusionError> {
    if gather.attr_int("axis").unwrap_or(0) != 0 {
        return Err(FusionError::NoMatch);
    }
    let table = gather.input(0).ok_or(FusionError::NoMatch)?;
    let indices = gather.input(1).ok_or(FusionError::NoMatch)?;
    let dims = &graph.initializer(table).ok_or(FusionError::NoMatch)?.dims;
    match dims.as_slice() {
        &[rows, width] => Ok(Lookup {
            table,
            indices,
            rows,
            width,
        }),
        _ => Err(FusionError::NoMatch),
    }
}

/// Name of the int32 view of `ids`, adding the shared cast to `spec`
fn int32_ids(graph: &Graph, ids: &str, spec: &mut FusedNodeSpec) -> String {
    let name = format!("{ids}_int32");
    if graph.producer(&name).is_none() {
        let mut cast = GraphNode::new("Cast");
        cast.name = format!("Cast_{ids}_int32");
        cast.inputs = vec![ids.to_string()];
        cast.outputs = vec![name.clone()];
        cast.attributes
            .insert("to".into(), AttrValue::Int(DataType::Int32 as i64));
        spec.prelude.push(cast);
    }
    name
}
