//! Reference evaluator.
//!
//! A small CPU interpreter for the operators found in unfused and fused
//! encoder graphs. It exists to check that an optimized model still computes
//! what the original did: [`compare_models`] feeds both graphs the same
//! seeded random inputs and compares every declared output within
//! `|a - b| <= atol + rtol * |b|`.

mod ops;
mod tensor;

pub use tensor::{Data, Tensor};

use std::collections::BTreeMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

use crate::graph::tensor::declared_type;
use crate::graph::Graph;
use crate::proto::tensor_proto::DataType;
use crate::Result;
use tensor::eval_error;

pub const DEFAULT_RTOL: f32 = 1e-5;
pub const DEFAULT_ATOL: f32 = 1e-4;

/// Run `graph` on `inputs`, returning every declared output by name
pub fn run(graph: &Graph, inputs: &BTreeMap<String, Tensor>) -> Result<BTreeMap<String, Tensor>> {
    let opset = graph.metadata.onnx_opset().unwrap_or(13);
    let order = graph.topological_order()?;
    let mut values: FxHashMap<String, Tensor> = inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

    for id in order {
        let Some(node) = graph.node(id) else {
            continue;
        };
        for name in node.inputs.iter().filter(|n| !n.is_empty()) {
            if values.contains_key(name) {
                continue;
            }
            let tensor = graph
                .initializer(name)
                .ok_or_else(|| eval_error(format!("no value for '{name}' feeding '{}'", node.display_name())))?;
            values.insert(name.clone(), Tensor::from_proto(tensor)?);
        }

        let args: Vec<Option<&Tensor>> = node
            .inputs
            .iter()
            .map(|n| if n.is_empty() { None } else { values.get(n) })
            .collect();
        let outputs = ops::execute(node, &args, opset)?;
        for (name, tensor) in node.outputs.iter().zip(outputs) {
            if !name.is_empty() {
                values.insert(name.clone(), tensor);
            }
        }
    }

    graph
        .graph_outputs()
        .iter()
        .map(|output| {
            let value = match values.remove(&output.name) {
                Some(v) => v,
                None => Tensor::from_proto(
                    graph
                        .initializer(&output.name)
                        .ok_or_else(|| eval_error(format!("output '{}' was not computed", output.name)))?,
                )?,
            };
            Ok((output.name.clone(), value))
        })
        .collect()
}

/// Settings for [`compare_models`]
#[derive(Debug, Clone, PartialEq)]
pub struct CompareOptions {
    pub seed: u64,
    /// Concrete shapes for named inputs; other dynamic dims default to 1
    pub shape_overrides: BTreeMap<String, Vec<usize>>,
    pub rtol: f32,
    pub atol: f32,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            shape_overrides: BTreeMap::new(),
            rtol: DEFAULT_RTOL,
            atol: DEFAULT_ATOL,
        }
    }
}

/// Parse a `name:d1,d2,...` shape override
pub fn parse_shape_override(spec: &str) -> Result<(String, Vec<usize>)> {
    let (name, dims) = spec
        .split_once(':')
        .ok_or_else(|| eval_error(format!("shape override '{spec}' is not of the form name:d1,d2")))?;
    let dims = dims
        .split(',')
        .map(|d| {
            d.trim()
                .parse::<usize>()
                .map_err(|_| eval_error(format!("invalid dimension '{d}' in '{spec}'")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((name.to_string(), dims))
}

/// Comparison of one declared output
#[derive(Debug, Clone, Serialize)]
pub struct OutputComparison {
    pub name: String,
    pub shape: Vec<usize>,
    pub max_abs_diff: f32,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub outputs: Vec<OutputComparison>,
    pub passed: bool,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for output in &self.outputs {
            writeln!(
                f,
                "  {:<24} {:?}  max |diff| {:.3e}  {}",
                output.name,
                output.shape,
                output.max_abs_diff,
                if output.passed { "ok" } else { "MISMATCH" }
            )?;
        }
        Ok(())
    }
}

/// Run both graphs on identical random inputs and compare their outputs
pub fn compare_models(original: &Graph, optimized: &Graph, options: &CompareOptions) -> Result<Comparison> {
    let inputs = random_inputs(original, options)?;
    let expected = run(original, &inputs)?;

    let kept: BTreeMap<String, Tensor> = inputs
        .into_iter()
        .filter(|(name, _)| optimized.is_graph_input(name))
        .collect();
    let mut actual = run(optimized, &kept)?;

    let mut outputs = Vec::with_capacity(expected.len());
    for (name, reference) in expected {
        let Some(candidate) = actual.remove(&name) else {
            return Err(eval_error(format!("optimized model lost output '{name}'")));
        };
        outputs.push(compare_output(name, &reference, &candidate, options));
    }

    let passed = outputs.iter().all(|o| o.passed);
    debug!("compared {} outputs, passed = {}", outputs.len(), passed);
    Ok(Comparison { outputs, passed })
}

fn compare_output(name: String, reference: &Tensor, candidate: &Tensor, options: &CompareOptions) -> OutputComparison {
    if reference.shape != candidate.shape {
        return OutputComparison {
            name,
            shape: candidate.shape.clone(),
            max_abs_diff: f32::INFINITY,
            passed: false,
        };
    }
    let (b, a) = (reference.to_f32(), candidate.to_f32());
    let mut max_abs_diff = 0.0f32;
    let mut passed = true;
    for (&a, &b) in a.iter().zip(&b) {
        let diff = (a - b).abs();
        max_abs_diff = max_abs_diff.max(diff);
        if diff.is_nan() || diff > options.atol + options.rtol * b.abs() {
            passed = false;
        }
    }
    OutputComparison {
        name,
        shape: reference.shape.clone(),
        max_abs_diff,
        passed,
    }
}

/// Seeded inputs for every declared graph input. Integer inputs that index a
/// `Gather` table draw values below the table size; other integer inputs are
/// all-ones masks.
pub fn random_inputs(graph: &Graph, options: &CompareOptions) -> Result<BTreeMap<String, Tensor>> {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut inputs = BTreeMap::new();

    for info in graph.graph_inputs() {
        if graph.initializer(&info.name).is_some() {
            continue;
        }
        let (dtype, declared) =
            declared_type(info).ok_or_else(|| eval_error(format!("input '{}' has no tensor type", info.name)))?;
        let shape: Vec<usize> = match options.shape_overrides.get(&info.name) {
            Some(dims) => dims.clone(),
            None => declared
                .iter()
                .map(|d| d.filter(|&v| v > 0).map_or(1, |v| v as usize))
                .collect(),
        };
        let count: usize = shape.iter().product();

        let tensor = match dtype {
            DataType::Float | DataType::Double => {
                Tensor::from_f32(shape, (0..count).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            }
            DataType::Int64 | DataType::Int32 | DataType::Bool => match gather_rows(graph, &info.name) {
                Some(rows) => Tensor::from_i64(shape, (0..count).map(|_| rng.gen_range(0..rows)).collect()),
                None => Tensor::from_i64(shape, vec![1; count]),
            },
            other => {
                return Err(eval_error(format!(
                    "input '{}' has unsupported type {:?}",
                    info.name, other
                )))
            }
        };
        inputs.insert(info.name.clone(), tensor);
    }
    Ok(inputs)
}

/// Smallest table height among the Gathers indexed by `input`
fn gather_rows(graph: &Graph, input: &str) -> Option<i64> {
    graph
        .nodes()
        .filter(|(_, n)| n.op_type == "Gather" && n.input(1) == Some(input))
        .filter_map(|(_, n)| graph.constant_value(n.input(0)?))
        .filter_map(|table| table.dims.first().copied())
        .filter(|&rows| rows > 0)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tensor::{float_tensor, value_info, Dim};

    fn scaled_graph(factor: f32) -> Graph {
        let mut g = Graph::new();
        g.add_input(value_info("x", DataType::Float, &[Dim::Symbolic("batch".into()), Dim::Fixed(4)]));
        g.add_initializer(float_tensor("k", &[], &[factor]));
        g.add_op("Mul").inputs(["x", "k"]).output("y").finish();
        g.add_output(value_info("y", DataType::Float, &[]));
        g
    }

    #[test]
    fn test_run_simple_graph() {
        let g = scaled_graph(2.0);
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), Tensor::from_f32(vec![1, 2], vec![1.0, -3.0]));
        let out = run(&g, &inputs).unwrap();
        assert_eq!(out["y"].as_f32().unwrap(), &[2.0, -6.0]);
    }

    #[test]
    fn test_compare_detects_difference() {
        let same = compare_models(&scaled_graph(2.0), &scaled_graph(2.0), &CompareOptions::default()).unwrap();
        assert!(same.passed);
        let different = compare_models(&scaled_graph(2.0), &scaled_graph(2.5), &CompareOptions::default()).unwrap();
        assert!(!different.passed);
    }

    #[test]
    fn test_shape_override() {
        assert_eq!(parse_shape_override("input_ids:2,16").unwrap(), ("input_ids".to_string(), vec![2, 16]));
        assert!(parse_shape_override("input_ids").is_err());
        assert!(parse_shape_override("x:2,a").is_err());

        let mut options = CompareOptions::default();
        options.shape_overrides.insert("x".into(), vec![3, 4]);
        let inputs = random_inputs(&scaled_graph(1.0), &options).unwrap();
        assert_eq!(inputs["x"].shape, vec![3, 4]);
    }

    #[test]
    fn test_random_inputs_are_seeded() {
        let g = scaled_graph(1.0);
        let a = random_inputs(&g, &CompareOptions::default()).unwrap();
        let b = random_inputs(&g, &CompareOptions::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a["x"].shape, vec![1, 4]);
    }
}
