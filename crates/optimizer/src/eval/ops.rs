// Operator kernels for the reference evaluator
//
// Straightforward single-threaded implementations, written for agreement
// with the ONNX and contrib operator definitions rather than speed.

use super::tensor::{broadcast_binary, eval_error, normalize_axis, permute, strides, Data, Tensor};
use crate::graph::{AttrValue, GraphNode};
use crate::proto::tensor_proto::DataType;
use crate::Result;

/// Default fill for masked attention positions
const MASK_FILL: f32 = -10000.0;

const SQRT_2_OVER_PI: f32 = 0.797_884_6;

/// Run one node
pub fn execute(node: &GraphNode, inputs: &[Option<&Tensor>], opset: i64) -> Result<Vec<Tensor>> {
    let input = |slot: usize| {
        inputs
            .get(slot)
            .copied()
            .flatten()
            .ok_or_else(|| eval_error(format!("{} '{}' is missing input {slot}", node.op_type, node.display_name())))
    };
    let optional = |slot: usize| inputs.get(slot).copied().flatten();

    let output = match node.op_type.as_str() {
        "Identity" => input(0)?.clone(),
        "Constant" => constant(node)?,
        "Add" | "Sub" | "Mul" | "Div" | "Pow" => binary(&node.op_type, input(0)?, input(1)?)?,
        "Sqrt" => unary(input(0)?, f32::sqrt)?,
        "Erf" => unary(input(0)?, libm::erff)?,
        "Tanh" => unary(input(0)?, f32::tanh)?,
        "Cast" => cast(input(0)?, node.attr_int("to").unwrap_or(DataType::Float as i64))?,
        "Reshape" => reshape(input(0)?, input(1)?, node.attr_int("allowzero").unwrap_or(0) == 1)?,
        "Transpose" => transpose(input(0)?, node.attr_ints("perm"))?,
        "Unsqueeze" => {
            let axes = match node.attr_ints("axes") {
                Some(axes) => axes.to_vec(),
                None => input(1)?.to_i64(),
            };
            unsqueeze(input(0)?, &axes)?
        }
        "Gather" => gather(input(0)?, input(1)?, node.attr_int("axis").unwrap_or(0))?,
        "ReduceMean" => {
            let axes = match node.attr_ints("axes") {
                Some(axes) => Some(axes.to_vec()),
                None => optional(1).map(Tensor::to_i64),
            };
            reduce_mean(input(0)?, axes.as_deref(), node.attr_int("keepdims").unwrap_or(1) != 0)?
        }
        "Softmax" => {
            let default_axis = if opset >= 13 { -1 } else { 1 };
            softmax(input(0)?, node.attr_int("axis").unwrap_or(default_axis), opset < 13)?
        }
        "MatMul" => matmul(input(0)?, input(1)?)?,
        "LayerNormalization" => {
            let x = input(0)?;
            let axis = normalize_axis(node.attr_int("axis").unwrap_or(-1), x.rank())?;
            let epsilon = node.attr_float("epsilon").unwrap_or(1e-5);
            layer_norm(x.as_f32()?, &x.shape, axis, input(1)?.as_f32()?, optional(2), epsilon)?
        }
        "SkipLayerNormalization" => {
            let x = input(0)?;
            let mut sum = binary("Add", x, input(1)?)?;
            if let Some(bias) = optional(4) {
                sum = binary("Add", &sum, bias)?;
            }
            let axis = sum.rank().saturating_sub(1);
            let epsilon = node.attr_float("epsilon").unwrap_or(1e-12);
            layer_norm(sum.as_f32()?, &sum.shape, axis, input(2)?.as_f32()?, optional(3), epsilon)?
        }
        "EmbedLayerNormalization" => embed_layer_norm(node, inputs)?,
        "Attention" => attention(node, input(0)?, input(1)?, input(2)?, optional(3))?,
        "Gelu" => unary(input(0)?, |x| x * 0.5 * (1.0 + libm::erff(x / std::f32::consts::SQRT_2)))?,
        "FastGelu" => unary(input(0)?, |x| {
            0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
        })?,
        other => return Err(eval_error(format!("operator {other} is not supported by the evaluator"))),
    };
    Ok(vec![output])
}

fn constant(node: &GraphNode) -> Result<Tensor> {
    match node.attr("value") {
        Some(AttrValue::Tensor(t)) => return Tensor::from_proto(t),
        Some(_) => return Err(eval_error("Constant 'value' is not a tensor")),
        None => {}
    }
    if let Some(v) = node.attr_float("value_float") {
        return Ok(Tensor::scalar(v));
    }
    if let Some(v) = node.attr_int("value_int") {
        return Ok(Tensor::from_i64(Vec::new(), vec![v]));
    }
    if let Some(v) = node.attr_ints("value_ints") {
        return Ok(Tensor::from_i64(vec![v.len()], v.to_vec()));
    }
    if let Some(AttrValue::Floats(v)) = node.attr("value_floats") {
        return Ok(Tensor::from_f32(vec![v.len()], v.clone()));
    }
    Err(eval_error(format!("Constant '{}' has no supported value", node.display_name())))
}

fn binary(op: &str, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    match (&a.data, &b.data) {
        (Data::I64(x), Data::I64(y)) => {
            let f: fn(i64, i64) -> i64 = match op {
                "Add" => |p: i64, q: i64| p + q,
                "Sub" => |p: i64, q: i64| p - q,
                "Mul" => |p: i64, q: i64| p * q,
                "Div" => |p: i64, q: i64| if q == 0 { 0 } else { p / q },
                _ => |p: i64, q: i64| p.pow(q.max(0) as u32),
            };
            let (shape, values) = broadcast_binary(x, &a.shape, y, &b.shape, f)?;
            Ok(Tensor::from_i64(shape, values))
        }
        _ => {
            let (x, y) = (a.to_f32(), b.to_f32());
            let f: fn(f32, f32) -> f32 = match op {
                "Add" => |p: f32, q: f32| p + q,
                "Sub" => |p: f32, q: f32| p - q,
                "Mul" => |p: f32, q: f32| p * q,
                "Div" => |p: f32, q: f32| p / q,
                _ => |p: f32, q: f32| p.powf(q),
            };
            let (shape, values) = broadcast_binary(&x, &a.shape, &y, &b.shape, f)?;
            Ok(Tensor::from_f32(shape, values))
        }
    }
}

fn unary(x: &Tensor, f: impl Fn(f32) -> f32) -> Result<Tensor> {
    let values = x.as_f32()?.iter().map(|&v| f(v)).collect();
    Ok(Tensor::from_f32(x.shape.clone(), values))
}

fn cast(x: &Tensor, to: i64) -> Result<Tensor> {
    let to = DataType::try_from(to as i32).map_err(|_| eval_error(format!("Cast to unknown type {to}")))?;
    match to {
        DataType::Float | DataType::Double => Ok(Tensor::from_f32(x.shape.clone(), x.to_f32())),
        DataType::Int64 | DataType::Int32 => Ok(Tensor::from_i64(x.shape.clone(), x.to_i64())),
        DataType::Bool => {
            let values = x.to_f32().into_iter().map(|v| i64::from(v != 0.0)).collect();
            Ok(Tensor::from_i64(x.shape.clone(), values))
        }
        other => Err(eval_error(format!("Cast to {other:?} is not supported"))),
    }
}

fn reshape(x: &Tensor, shape: &Tensor, allowzero: bool) -> Result<Tensor> {
    let target = shape.to_i64();
    let mut dims = Vec::with_capacity(target.len());
    let mut inferred = None;
    for (i, &d) in target.iter().enumerate() {
        match d {
            0 if !allowzero => dims.push(
                *x.shape
                    .get(i)
                    .ok_or_else(|| eval_error(format!("Reshape copies missing dim {i} of {:?}", x.shape)))?,
            ),
            -1 if inferred.is_none() => {
                inferred = Some(i);
                dims.push(1);
            }
            d if d >= 0 => dims.push(d as usize),
            _ => return Err(eval_error(format!("invalid Reshape target {target:?}"))),
        }
    }
    if let Some(i) = inferred {
        let known: usize = dims.iter().product();
        if known == 0 || x.len() % known != 0 {
            return Err(eval_error(format!("cannot infer Reshape {target:?} from {:?}", x.shape)));
        }
        dims[i] = x.len() / known;
    }
    x.reshaped(dims)
}

fn transpose(x: &Tensor, perm: Option<&[i64]>) -> Result<Tensor> {
    let perm: Vec<usize> = match perm {
        Some(p) => p
            .iter()
            .map(|&a| normalize_axis(a, x.rank()))
            .collect::<Result<_>>()?,
        None => (0..x.rank()).rev().collect(),
    };
    if perm.len() != x.rank() {
        return Err(eval_error(format!("perm {perm:?} does not match rank {}", x.rank())));
    }
    Ok(match &x.data {
        Data::F32(v) => {
            let (shape, out) = permute(v, &x.shape, &perm);
            Tensor::from_f32(shape, out)
        }
        Data::I64(v) => {
            let (shape, out) = permute(v, &x.shape, &perm);
            Tensor::from_i64(shape, out)
        }
    })
}

fn unsqueeze(x: &Tensor, axes: &[i64]) -> Result<Tensor> {
    let rank = x.rank() + axes.len();
    let mut axes = axes
        .iter()
        .map(|&a| normalize_axis(a, rank))
        .collect::<Result<Vec<_>>>()?;
    axes.sort_unstable();
    let mut shape = x.shape.clone();
    for axis in axes {
        shape.insert(axis, 1);
    }
    x.reshaped(shape)
}

fn gather(data: &Tensor, indices: &Tensor, axis: i64) -> Result<Tensor> {
    let axis = normalize_axis(axis, data.rank())?;
    let dim = data.shape[axis];
    let outer: usize = data.shape[..axis].iter().product();
    let inner: usize = data.shape[axis + 1..].iter().product();

    let positions = indices
        .to_i64()
        .into_iter()
        .map(|i| {
            let resolved = if i < 0 { i + dim as i64 } else { i };
            usize::try_from(resolved)
                .ok()
                .filter(|&r| r < dim)
                .ok_or_else(|| eval_error(format!("Gather index {i} out of range for dim {dim}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut shape = data.shape[..axis].to_vec();
    shape.extend_from_slice(&indices.shape);
    shape.extend_from_slice(&data.shape[axis + 1..]);

    fn take<T: Copy>(values: &[T], outer: usize, dim: usize, inner: usize, positions: &[usize]) -> Vec<T> {
        let mut out = Vec::with_capacity(outer * positions.len() * inner);
        for o in 0..outer {
            for &p in positions {
                let start = (o * dim + p) * inner;
                out.extend_from_slice(&values[start..start + inner]);
            }
        }
        out
    }

    Ok(match &data.data {
        Data::F32(v) => Tensor::from_f32(shape, take(v, outer, dim, inner, &positions)),
        Data::I64(v) => Tensor::from_i64(shape, take(v, outer, dim, inner, &positions)),
    })
}

fn reduce_mean(x: &Tensor, axes: Option<&[i64]>, keepdims: bool) -> Result<Tensor> {
    let values = x.as_f32()?;
    let rank = x.rank();
    let reduced: Vec<usize> = match axes {
        Some(axes) if !axes.is_empty() => axes
            .iter()
            .map(|&a| normalize_axis(a, rank))
            .collect::<Result<_>>()?,
        _ => (0..rank).collect(),
    };

    let kept_shape: Vec<usize> = x
        .shape
        .iter()
        .enumerate()
        .map(|(i, &d)| if reduced.contains(&i) { 1 } else { d })
        .collect();
    let out_strides = strides(&kept_shape);
    let count: usize = reduced.iter().map(|&i| x.shape[i]).product();

    let mut sums = vec![0.0f32; kept_shape.iter().product()];
    let mut index = vec![0usize; rank];
    for &v in values {
        let offset: usize = (0..rank)
            .filter(|d| !reduced.contains(d))
            .map(|d| index[d] * out_strides[d])
            .sum();
        sums[offset] += v;
        for d in (0..rank).rev() {
            index[d] += 1;
            if index[d] < x.shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    let means = sums.into_iter().map(|s| s / count.max(1) as f32).collect();

    let shape = if keepdims {
        kept_shape
    } else {
        x.shape
            .iter()
            .enumerate()
            .filter(|(i, _)| !reduced.contains(i))
            .map(|(_, &d)| d)
            .collect()
    };
    Ok(Tensor::from_f32(shape, means))
}

/// Softmax along `axis`; `coerce_2d` flattens everything from `axis` on into
/// one row, as opsets before 13 define it
fn softmax(x: &Tensor, axis: i64, coerce_2d: bool) -> Result<Tensor> {
    let axis = normalize_axis(axis, x.rank())?;
    let values = x.as_f32()?;
    let outer: usize = x.shape[..axis].iter().product();
    let (dim, inner) = if coerce_2d {
        (x.shape[axis..].iter().product::<usize>(), 1)
    } else {
        (x.shape[axis], x.shape[axis + 1..].iter().product::<usize>())
    };

    let mut out = vec![0.0f32; values.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * dim + k) * inner + i;
            let max = (0..dim).map(|k| values[at(k)]).fold(f32::NEG_INFINITY, f32::max);
            let mut total = 0.0;
            for k in 0..dim {
                let e = (values[at(k)] - max).exp();
                out[at(k)] = e;
                total += e;
            }
            for k in 0..dim {
                out[at(k)] /= total;
            }
        }
    }
    Ok(Tensor::from_f32(x.shape.clone(), out))
}

/// Batched matrix product with broadcast batch dims
fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.rank() < 2 || b.rank() < 2 {
        return Err(eval_error("MatMul operands must have rank >= 2"));
    }
    let (x, y) = (a.as_f32()?, b.as_f32()?);
    let (m, k) = (a.shape[a.rank() - 2], a.shape[a.rank() - 1]);
    let (k2, n) = (b.shape[b.rank() - 2], b.shape[b.rank() - 1]);
    if k != k2 {
        return Err(eval_error(format!("MatMul shapes {:?} and {:?} do not align", a.shape, b.shape)));
    }

    let (a_batch, b_batch) = (&a.shape[..a.rank() - 2], &b.shape[..b.rank() - 2]);
    let a_matrices: Vec<usize> = (0..a_batch.iter().product()).collect();
    let b_matrices: Vec<usize> = (0..b_batch.iter().product()).collect();
    // pair up matrix ordinals by broadcasting the batch dims
    let (batch_shape, pairs) = broadcast_binary(&a_matrices, a_batch, &b_matrices, b_batch, |i, j| (i, j))?;

    let mut out = vec![0.0f32; pairs.len() * m * n];
    for (batch, (ia, ib)) in pairs.into_iter().enumerate() {
        let lhs = &x[ia * m * k..(ia + 1) * m * k];
        let rhs = &y[ib * k * n..(ib + 1) * k * n];
        let dst = &mut out[batch * m * n..(batch + 1) * m * n];
        for i in 0..m {
            for p in 0..k {
                let l = lhs[i * k + p];
                if l == 0.0 {
                    continue;
                }
                for j in 0..n {
                    dst[i * n + j] += l * rhs[p * n + j];
                }
            }
        }
    }

    let mut shape = batch_shape;
    shape.extend([m, n]);
    Ok(Tensor::from_f32(shape, out))
}

/// Normalize over every axis from `axis` on
fn layer_norm(
    values: &[f32],
    shape: &[usize],
    axis: usize,
    gamma: &[f32],
    beta: Option<&Tensor>,
    epsilon: f32,
) -> Result<Tensor> {
    let size: usize = shape[axis..].iter().product();
    let beta = beta.map(Tensor::as_f32).transpose()?;
    if size == 0 || gamma.len() != size || beta.is_some_and(|b| b.len() != size) {
        return Err(eval_error(format!(
            "normalization scale of {} values does not match {size}",
            gamma.len()
        )));
    }

    let mut out = Vec::with_capacity(values.len());
    for row in values.chunks(size) {
        let mean = row.iter().sum::<f32>() / size as f32;
        let variance = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / size as f32;
        let denom = (variance + epsilon).sqrt();
        for (i, v) in row.iter().enumerate() {
            let shift = beta.map_or(0.0, |b| b[i]);
            out.push((v - mean) / denom * gamma[i] + shift);
        }
    }
    Ok(Tensor::from_f32(shape.to_vec(), out))
}

fn embed_layer_norm(node: &GraphNode, inputs: &[Option<&Tensor>]) -> Result<Tensor> {
    let get = |slot: usize| inputs.get(slot).copied().flatten();
    let required = |slot: usize| {
        get(slot).ok_or_else(|| eval_error(format!("EmbedLayerNormalization is missing input {slot}")))
    };
    let (ids, word, position, gamma) = (required(0)?, required(2)?, required(3)?, required(5)?);
    if ids.rank() != 2 {
        return Err(eval_error("EmbedLayerNormalization ids must be [batch, sequence]"));
    }
    let (batch, sequence) = (ids.shape[0], ids.shape[1]);

    let position_ids = match get(8) {
        Some(p) => p.clone(),
        None => {
            let arange: Vec<i64> = (0..batch).flat_map(|_| 0..sequence as i64).collect();
            Tensor::from_i64(vec![batch, sequence], arange)
        }
    };

    let mut sum = binary("Add", &gather(word, ids, 0)?, &gather(position, &position_ids, 0)?)?;
    if let (Some(segment_ids), Some(segment)) = (get(1), get(4)) {
        sum = binary("Add", &sum, &gather(segment, segment_ids, 0)?)?;
    }
    let epsilon = node.attr_float("epsilon").unwrap_or(1e-12);
    layer_norm(sum.as_f32()?, &sum.shape, 2, gamma.as_f32()?, get(6), epsilon)
}

fn attention(node: &GraphNode, x: &Tensor, weight: &Tensor, bias: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    let heads = node
        .attr_int("num_heads")
        .and_then(|n| usize::try_from(n).ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| eval_error("Attention needs a positive num_heads"))?;
    if x.rank() != 3 || weight.rank() != 2 {
        return Err(eval_error("Attention expects input [B, S, H_in] and weight [H_in, 3H]"));
    }
    let (batch, sequence) = (x.shape[0], x.shape[1]);
    let hidden = weight.shape[1] / 3;
    if hidden % heads != 0 {
        return Err(eval_error(format!("hidden size {hidden} is not divisible by {heads} heads")));
    }
    let head_size = hidden / heads;
    let scale = node.attr_float("scale").unwrap_or(1.0 / (head_size as f32).sqrt());

    let projected = binary("Add", &matmul(x, weight)?, bias)?;
    let qkv = projected.as_f32()?;
    let mask = mask.map(Tensor::to_i64);
    if let Some(m) = mask.as_ref().filter(|m| m.len() != batch * sequence) {
        return Err(eval_error(format!(
            "attention mask has {} elements, expected [{batch}, {sequence}]",
            m.len()
        )));
    }
    let width = 3 * hidden;
    let at = |b: usize, s: usize, part: usize, h: usize, d: usize| {
        qkv[(b * sequence + s) * width + part * hidden + h * head_size + d]
    };

    let mut out = vec![0.0f32; batch * sequence * hidden];
    let mut scores = vec![0.0f32; sequence];
    for b in 0..batch {
        for h in 0..heads {
            for i in 0..sequence {
                for (j, score) in scores.iter_mut().enumerate() {
                    let dot: f32 = (0..head_size).map(|d| at(b, i, 0, h, d) * at(b, j, 1, h, d)).sum();
                    let masked = mask.as_ref().is_some_and(|m| m[b * sequence + j] == 0);
                    *score = dot * scale + if masked { MASK_FILL } else { 0.0 };
                }
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut total = 0.0f32;
                for s in scores.iter_mut() {
                    *s = (*s - max).exp();
                    total += *s;
                }
                for d in 0..head_size {
                    let value: f32 = (0..sequence).map(|j| scores[j] / total * at(b, j, 2, h, d)).sum();
                    out[(b * sequence + i) * hidden + h * head_size + d] = value;
                }
            }
        }
    }
    Ok(Tensor::from_f32(vec![batch, sequence, hidden], out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(op: &str) -> GraphNode {
        GraphNode::new(op)
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = Tensor::from_f32(vec![2, 3], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let y = softmax(&x, -1, false).unwrap();
        let v = y.as_f32().unwrap();
        assert!((v[0..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((v[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_matmul_broadcasts_weight() {
        let a = Tensor::from_f32(vec![2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let w = Tensor::from_f32(vec![2, 1], vec![10.0, 1.0]);
        let y = matmul(&a, &w).unwrap();
        assert_eq!(y.shape, vec![2, 1, 1]);
        assert_eq!(y.as_f32().unwrap(), &[12.0, 34.0]);
    }

    #[test]
    fn test_reshape_copies_and_infers() {
        let x = Tensor::from_f32(vec![2, 3, 4], vec![0.0; 24]);
        let shape = Tensor::from_i64(vec![3], vec![0, -1, 2]);
        assert_eq!(reshape(&x, &shape, false).unwrap().shape, vec![2, 6, 2]);
    }

    #[test]
    fn test_reduce_mean_last_axis() {
        let x = Tensor::from_f32(vec![2, 2], vec![1.0, 3.0, 5.0, 7.0]);
        let y = reduce_mean(&x, Some(&[-1]), true).unwrap();
        assert_eq!(y.shape, vec![2, 1]);
        assert_eq!(y.as_f32().unwrap(), &[2.0, 6.0]);
    }

    #[test]
    fn test_gather_rows() {
        let table = Tensor::from_f32(vec![3, 2], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let ids = Tensor::from_i64(vec![1, 2], vec![2, 0]);
        let y = gather(&table, &ids, 0).unwrap();
        assert_eq!(y.shape, vec![1, 2, 2]);
        assert_eq!(y.as_f32().unwrap(), &[4.0, 5.0, 0.0, 1.0]);
    }

    #[test]
    fn test_gelu_matches_definition() {
        let x = Tensor::from_f32(vec![3], vec![-1.0, 0.0, 2.0]);
        let y = execute(&node("Gelu"), &[Some(&x)], 13).unwrap().remove(0);
        let v = y.as_f32().unwrap();
        assert!((v[0] + 0.158_655).abs() < 1e-5);
        assert_eq!(v[1], 0.0);
        assert!((v[2] - 1.954_5).abs() < 1e-3);
    }

    #[test]
    fn test_attention_rejects_short_mask() {
        let mut attention_node = node("Attention");
        attention_node.attributes.insert("num_heads".into(), AttrValue::Int(1));
        let x = Tensor::from_f32(vec![2, 4, 3], vec![0.5; 24]);
        let weight = Tensor::from_f32(vec![3, 9], vec![0.1; 27]);
        let bias = Tensor::from_f32(vec![9], vec![0.0; 9]);
        let mask = Tensor::from_i64(vec![1, 2], vec![1, 1]);

        let err = attention(&attention_node, &x, &weight, &bias, Some(&mask)).unwrap_err();
        assert!(err.to_string().contains("attention mask has 2 elements"));

        let full = Tensor::from_i64(vec![2, 4], vec![1; 8]);
        let y = attention(&attention_node, &x, &weight, &bias, Some(&full)).unwrap();
        assert_eq!(y.shape, vec![2, 4, 3]);
    }

    #[test]
    fn test_unsupported_operator() {
        assert!(execute(&node("Conv"), &[], 13).is_err());
    }
}
