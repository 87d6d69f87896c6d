// Multi-head self-attention fusion
//
// Anchored at the Reshape that merges heads back into [B, S, H]:
//
//   q = Transpose(Reshape(Add(MatMul(x, Wq), bq)), [0,2,1,3])
//   k = Transpose(Reshape(Add(MatMul(x, Wk), bk)), [0,2,3,1])
//   v = Transpose(Reshape(Add(MatMul(x, Wv), bv)), [0,2,1,3])
//   p = Softmax(Div(MatMul(q, k), c) [+ mask])      (or Mul by 1/c)
//   out = Reshape(Transpose(MatMul(p, v), [0,2,1,3]))
//
// becomes Attention(x, Wqkv, bqkv[, mask_index]). The mask bias chain
// Unsqueeze -> Unsqueeze -> Cast -> Sub(1, .) -> Mul(., -10000) is traced
// back to its graph input, which is cast to int32 once and shared.

use super::{approx_eq, other_input, reduce_axes, split_constant, FusedNodeSpec, Fusion, FusionContext, FusionKind};
use crate::error::FusionError;
use crate::graph::tensor::{f32_values, float_tensor, i64_values, is_structure_only, structure_only};
use crate::graph::{AttrValue, Graph, GraphNode, NodeId, MS_DOMAIN};
use crate::matcher::{match_parent_path, Match, PathStep, Pattern, DEFAULT_PASS_THROUGH};
use crate::proto::tensor_proto::DataType;
use crate::proto::TensorProto;

pub struct AttentionFusion;

const CONTEXT: usize = 0;
const VALUE: usize = 1;
const SCORES: usize = 2;
const QUERY: usize = 3;
const KEY: usize = 4;

/// Mask multiplier at or below this marks an additive attention mask
const MASK_FILL_LIMIT: f32 = -1000.0;

/// One projection branch: MatMul -> Add(bias) -> Reshape -> Transpose
struct Projection<'a> {
    input: &'a str,
    weight: &'a TensorProto,
    bias: &'a TensorProto,
    head_shape: Vec<i64>,
    perm: &'a [i64],
}

impl<'a> Projection<'a> {
    fn resolve(graph: &'a Graph, path: &[NodeId]) -> Result<Self, FusionError> {
        let node = |i: usize| path.get(i).and_then(|&id| graph.node(id)).ok_or(FusionError::NoMatch);
        let (transpose, reshape, add, matmul) = (node(0)?, node(1)?, node(2)?, node(3)?);

        let perm = transpose.attr_ints("perm").ok_or(FusionError::NoMatch)?;
        let head_shape = reshape
            .input(1)
            .and_then(|s| graph.constant_value(s))
            .and_then(i64_values)
            .ok_or(FusionError::NoMatch)?;

        let projected = matmul.outputs.first().ok_or(FusionError::NoMatch)?;
        let bias = other_input(add, projected)
            .and_then(|b| graph.constant_value(b))
            .filter(|t| t.dims.len() == 1)
            .ok_or(FusionError::NoMatch)?;

        let input = matmul.input(0).ok_or(FusionError::NoMatch)?;
        let weight = matmul
            .input(1)
            .and_then(|w| graph.constant_value(w))
            .filter(|t| t.dims.len() == 2)
            .ok_or(FusionError::NoMatch)?;
        if graph.is_constant(input) {
            return Err(FusionError::NoMatch);
        }

        Ok(Self {
            input,
            weight,
            bias,
            head_shape,
            perm,
        })
    }

    fn width(&self) -> i64 {
        self.weight.dims[1]
    }
}

impl Fusion for AttentionFusion {
    fn kind(&self) -> FusionKind {
        FusionKind::Attention
    }

    fn patterns(&self) -> Vec<Pattern> {
        [
            ("attention_masked", "Div", true),
            ("attention_masked_mul_scale", "Mul", true),
            ("attention", "Div", false),
            ("attention_mul_scale", "Mul", false),
        ]
        .into_iter()
        .map(|(name, scale_op, masked)| attention_pattern(name, scale_op, masked))
        .collect()
    }

    fn plan(&self, m: &Match, graph: &Graph, ctx: &FusionContext) -> Result<FusedNodeSpec, FusionError> {
        let node = |id: NodeId| graph.node(id).ok_or(FusionError::NoMatch);
        let merge = node(m.anchor)?;
        let context_transpose = node(m.node(CONTEXT, 0))?;
        if context_transpose.attr_ints("perm") != Some(&[0, 2, 1, 3][..]) {
            return Err(FusionError::NoMatch);
        }

        let scores = &m.paths[SCORES];
        let softmax = node(scores[0])?;
        if !softmax_over_last_axis(graph, softmax) {
            return Err(FusionError::NoMatch);
        }
        let scale_node = node(scores[scores.len() - 2])?;
        let masked_add = if scores.len() == 4 { Some(node(scores[1])?) } else { None };

        let q = Projection::resolve(graph, &m.paths[QUERY])?;
        let k = Projection::resolve(graph, &m.paths[KEY])?;
        let v = Projection::resolve(graph, &m.paths[VALUE])?;
        if q.perm != [0, 2, 1, 3] || k.perm != [0, 2, 3, 1] || v.perm != [0, 2, 1, 3] {
            return Err(FusionError::NoMatch);
        }
        if q.input != k.input || q.input != v.input {
            return Err(FusionError::NoMatch);
        }

        let input_width = q.weight.dims[0];
        let hidden = q.width();
        let regular = [&k, &v]
            .iter()
            .all(|p| p.weight.dims == q.weight.dims && p.head_shape == q.head_shape)
            && [&q, &k, &v].iter().all(|p| p.bias.dims == [p.width()]);
        if !regular {
            return Err(FusionError::UnderSpecified(format!(
                "irregular Q/K/V shapes at '{}': weights {:?} {:?} {:?}",
                merge.display_name(),
                q.weight.dims,
                k.weight.dims,
                v.weight.dims
            )));
        }

        let (heads, head_size) = head_layout(&q.head_shape, hidden, ctx)?;
        if heads * head_size != hidden {
            return Err(FusionError::UnderSpecified(format!(
                "{heads} heads of size {head_size} do not cover hidden size {hidden}"
            )));
        }
        if let Some(declared) = ctx.num_heads.filter(|&n| n as i64 != heads) {
            return Err(FusionError::HyperparameterMismatch {
                parameter: "num_heads".into(),
                declared: declared as i64,
                discovered: heads,
            });
        }
        if let Some(declared) = ctx.hidden_size.filter(|&h| h as i64 != hidden) {
            return Err(FusionError::HyperparameterMismatch {
                parameter: "hidden_size".into(),
                declared: declared as i64,
                discovered: hidden,
            });
        }

        let merged_shape = merge
            .input(1)
            .and_then(|s| graph.constant_value(s))
            .and_then(i64_values)
            .ok_or(FusionError::NoMatch)?;
        if !matches!(merged_shape.as_slice(), [0, 0, last] if *last == hidden || *last == -1) {
            return Err(FusionError::NoMatch);
        }

        let scale = explicit_scale(graph, scale_node, head_size)?;

        let weight_name = graph.fresh_tensor_name(&format!("{}_qkv_weight", q.weight.name));
        let bias_name = graph.fresh_tensor_name(&format!("{}_qkv_bias", q.bias.name));
        let weight = pack(&weight_name, [q.weight, k.weight, v.weight], input_width, hidden)?;
        let bias = pack(&bias_name, [q.bias, k.bias, v.bias], 1, hidden)?;

        let mut spec = FusedNodeSpec::new("Attention", MS_DOMAIN)
            .attr("num_heads", heads)
            .initializer(weight)
            .initializer(bias);
        if let Some(scale) = scale {
            spec = spec.attr("scale", scale);
        }

        let mut inputs = vec![q.input.to_string(), weight_name, bias_name];
        if let Some(add) = masked_add {
            let mask = trace_mask(graph, add, scale_node)?;
            let mask_index = format!("{mask}_mask_index");
            if graph.producer(&mask_index).is_none() {
                let mut cast = GraphNode::new("Cast");
                cast.name = format!("Cast_{mask_index}");
                cast.inputs = vec![mask.to_string()];
                cast.outputs = vec![mask_index.clone()];
                cast.attributes
                    .insert("to".into(), AttrValue::Int(DataType::Int32 as i64));
                spec = spec.prelude(cast);
            }
            inputs.push(mask_index);
        }

        Ok(spec.inputs(inputs))
    }
}

fn attention_pattern(name: &'static str, scale_op: &'static str, masked: bool) -> Pattern {
    let mut scores = vec![PathStep::at("Softmax", 0)];
    if masked {
        scores.push(PathStep::at("Add", 0));
    }
    scores.push(PathStep::any(scale_op));
    scores.push(PathStep::any("MatMul"));
    let last = scores.len() - 1;

    let projection = |slot: usize| {
        [
            PathStep::at("Transpose", slot),
            PathStep::at("Reshape", 0),
            PathStep::at("Add", 0),
            PathStep::any("MatMul"),
        ]
    };

    Pattern::new(name, "Reshape")
        .path([PathStep::at("Transpose", 0), PathStep::at("MatMul", 0)])
        .path_from(CONTEXT, 1, projection(1))
        .path_from(CONTEXT, 1, scores)
        .path_from(SCORES, last, projection(0))
        .path_from(SCORES, last, projection(1))
}

/// Softmax must normalize the last axis of the 4-D scores. Before opset 13
/// the default axis is 1 and the input is coerced to 2-D.
fn softmax_over_last_axis(graph: &Graph, softmax: &GraphNode) -> bool {
    let opset = graph.metadata.onnx_opset().unwrap_or(13);
    let default_axis = if opset >= 13 { -1 } else { 1 };
    matches!(softmax.attr_int("axis").unwrap_or(default_axis), -1 | 3)
}

/// (heads, head size) from the `[0, 0, N, D]` reshape target, falling back to
/// the declared head count
fn head_layout(shape: &[i64], hidden: i64, ctx: &FusionContext) -> Result<(i64, i64), FusionError> {
    match *shape {
        [_, _, n, d] if n > 0 && d > 0 => Ok((n, d)),
        [_, _, n, -1] if n > 0 => Ok((n, hidden / n)),
        [_, _, -1, d] if d > 0 => Ok((hidden / d, d)),
        _ => match ctx.num_heads {
            Some(n) if n > 0 => Ok((n as i64, hidden / n as i64)),
            _ => Err(FusionError::UnderSpecified(format!(
                "head count cannot be read from reshape target {shape:?}"
            ))),
        },
    }
}

/// `Some(scale)` when the score scaling differs from 1/sqrt(head size)
fn explicit_scale(graph: &Graph, node: &GraphNode, head_size: i64) -> Result<Option<f32>, FusionError> {
    let (c, _) = split_constant(graph, node).ok_or(FusionError::NoMatch)?;
    let root = (head_size as f32).sqrt();
    match node.op_type.as_str() {
        "Div" => {
            if graph.is_constant(node.input(0).unwrap_or_default()) || c == 0.0 {
                return Err(FusionError::NoMatch);
            }
            Ok((!approx_eq(c, root)).then(|| 1.0 / c))
        }
        _ => Ok((!approx_eq(c, 1.0 / root)).then_some(c)),
    }
}

/// Graph input feeding the additive mask of `add`
fn trace_mask<'a>(graph: &'a Graph, add: &GraphNode, scale_node: &GraphNode) -> Result<&'a str, FusionError> {
    let unresolved = || {
        FusionError::UnderSpecified(format!(
            "attention mask at '{}' cannot be traced to a graph input",
            add.display_name()
        ))
    };

    let scaled = scale_node.outputs.first().ok_or(FusionError::NoMatch)?;
    let bias = other_input(add, scaled).ok_or_else(unresolved)?;
    let start = graph.producer_node(bias).ok_or_else(unresolved)?;
    let start_node = graph.node(start).ok_or_else(unresolved)?;
    if start_node.op_type != "Mul" {
        return Err(unresolved());
    }

    let steps = [
        PathStep::any("Sub"),
        PathStep::any("Cast"),
        PathStep::at("Unsqueeze", 0),
        PathStep::at("Unsqueeze", 0),
    ];
    let (chain, _) = match_parent_path(graph, start, &steps, DEFAULT_PASS_THROUGH).ok_or_else(unresolved)?;
    let nodes = chain
        .iter()
        .map(|&id| graph.node(id))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(unresolved)?;
    let (sub, cast, outer, inner) = (nodes[0], nodes[1], nodes[2], nodes[3]);

    let (fill, _) = split_constant(graph, start_node).ok_or_else(unresolved)?;
    if fill > MASK_FILL_LIMIT {
        return Err(unresolved());
    }
    let one = sub.input(0).and_then(|c| graph.constant_value(c)).and_then(crate::graph::tensor::scalar_f32);
    if one.map_or(true, |v| !approx_eq(v, 1.0)) || sub.input(1) != cast.outputs.first().map(String::as_str) {
        return Err(unresolved());
    }
    if reduce_axes(graph, outer).as_deref() != Some(&[2][..]) || reduce_axes(graph, inner).as_deref() != Some(&[1][..])
    {
        return Err(unresolved());
    }

    let mask = inner.input(0).ok_or_else(unresolved)?;
    if !graph.is_graph_input(mask) {
        return Err(unresolved());
    }
    Ok(mask)
}

/// Concatenate Q, K and V row-wise: `rows` rows of `width` columns each
fn pack(name: &str, parts: [&TensorProto; 3], rows: i64, width: i64) -> Result<TensorProto, FusionError> {
    let dims: Vec<i64> = if parts[0].dims.len() == 2 {
        vec![rows, 3 * width]
    } else {
        vec![3 * width]
    };
    if parts.iter().any(|t| is_structure_only(t)) {
        return Ok(structure_only(name, &dims, DataType::Float));
    }

    let values = parts
        .iter()
        .map(|t| f32_values(t).filter(|v| v.len() == (rows * width) as usize))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| FusionError::UnderSpecified(format!("weights for '{name}' are not readable floats")))?;

    let width = width as usize;
    let mut packed = Vec::with_capacity(values.len() * values[0].len());
    for row in 0..rows as usize {
        for part in &values {
            packed.extend_from_slice(&part[row * width..(row + 1) * width]);
        }
    }
    Ok(float_tensor(name, &dims, &packed))
}
