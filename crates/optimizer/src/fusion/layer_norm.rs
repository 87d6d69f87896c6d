// LayerNormalization fusion
//
//   mean = ReduceMean(x)          d = Sub(x, mean)
//   var  = ReduceMean(Pow(d, 2))  n = Div(d, Sqrt(Add(var, eps)))
//   out  = Add(Mul(n, gamma), beta)
//
// becomes LayerNormalization(x, gamma, beta) with axis = -1.

use super::{approx_eq, other_input, reduce_axes, split_constant, FusedNodeSpec, Fusion, FusionContext, FusionKind};
use crate::error::FusionError;
use crate::graph::tensor::declared_type;
use crate::graph::{Graph, GraphNode};
use crate::matcher::{Match, PathStep, Pattern};

pub struct LayerNormFusion;

const ANCHOR_ADD: usize = 0;

impl Fusion for LayerNormFusion {
    fn kind(&self) -> FusionKind {
        FusionKind::LayerNormalization
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::new("layer_norm", "Add").path([
            PathStep::any("Mul"),
            PathStep::any("Div"),
            PathStep::at("Sqrt", 1),
            PathStep::any("Add"),
            PathStep::at("ReduceMean", 0),
            PathStep::at("Pow", 0),
            PathStep::at("Sub", 0),
            PathStep::at("ReduceMean", 1),
        ])]
    }

    fn plan(&self, m: &Match, graph: &Graph, _ctx: &FusionContext) -> Result<FusedNodeSpec, FusionError> {
        let node = |step: usize| graph.node(m.node(ANCHOR_ADD, step)).ok_or(FusionError::NoMatch);
        let anchor = graph.node(m.anchor).ok_or(FusionError::NoMatch)?;
        let (mul, div, _sqrt, add_eps, var_mean, pow, sub, mean) =
            (node(0)?, node(1)?, node(2)?, node(3)?, node(4)?, node(5)?, node(6)?, node(7)?);

        let x = sub.input(0).ok_or(FusionError::NoMatch)?;
        let d = sub.outputs.first().ok_or(FusionError::NoMatch)?;
        if mean.input(0) != Some(x) || div.input(0) != Some(d.as_str()) {
            return Err(FusionError::NoMatch);
        }

        let (exponent, _) = split_constant(graph, pow).ok_or(FusionError::NoMatch)?;
        if !approx_eq(exponent, 2.0) {
            return Err(FusionError::NoMatch);
        }
        let (epsilon, _) = split_constant(graph, add_eps).ok_or(FusionError::NoMatch)?;

        if !last_axis_only(graph, mean) || !last_axis_only(graph, var_mean) {
            return Err(FusionError::NoMatch);
        }

        let gamma = other_input(mul, &div.outputs[0]).ok_or(FusionError::NoMatch)?;
        let beta = other_input(anchor, &mul.outputs[0]).ok_or(FusionError::NoMatch)?;
        let (Some(scale), Some(shift)) = (graph.constant_value(gamma), graph.constant_value(beta)) else {
            return Err(FusionError::NoMatch);
        };
        let width = declared_last_dim(graph, x);
        let fits = |dims: &[i64]| matches!(dims, [w] if width.map_or(true, |width| width == *w));
        if !fits(&scale.dims) || scale.dims != shift.dims {
            return Err(FusionError::UnderSpecified(format!(
                "gamma {:?} and beta {:?} do not match the normalized axis of '{x}' ({})",
                scale.dims,
                shift.dims,
                width.map_or_else(|| "unknown".to_string(), |w| w.to_string())
            )));
        }

        Ok(FusedNodeSpec::new("LayerNormalization", "")
            .name_hint("LayerNorm")
            .inputs([x, gamma, beta])
            .attr("axis", -1i64)
            .attr("epsilon", epsilon))
    }
}

/// Last dimension of `x` when a value info declares it
fn declared_last_dim(graph: &Graph, x: &str) -> Option<i64> {
    graph
        .graph_inputs()
        .iter()
        .chain(graph.value_info())
        .chain(graph.graph_outputs())
        .find(|info| info.name == x)
        .and_then(declared_type)
        .and_then(|(_, dims)| dims.last().copied().flatten())
}

/// Mean over the last axis with dims kept
fn last_axis_only(graph: &Graph, node: &GraphNode) -> bool {
    node.attr_int("keepdims").unwrap_or(1) != 0 && reduce_axes(graph, node).as_deref() == Some(&[-1][..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::FusionPass;
    use crate::graph::tensor::{float_tensor, int64_tensor, value_info, Dim};
    use crate::proto::tensor_proto::DataType;

    fn decomposed_layer_norm(graph: &mut Graph, x: &str, prefix: &str, axes: &[i64], axes_as_input: bool) -> String {
        let p = |s: &str| format!("{prefix}_{s}");
        graph.add_initializer(float_tensor(p("gamma"), &[4], &[1.0, 1.0, 1.0, 1.0]));
        graph.add_initializer(float_tensor(p("beta"), &[4], &[0.0; 4]));
        graph.add_initializer(float_tensor(p("two"), &[], &[2.0]));
        graph.add_initializer(float_tensor(p("eps"), &[], &[1e-12]));
        graph.add_initializer(int64_tensor(p("axes"), &[axes.len() as i64], axes));
        let reduce_mean = |graph: &mut Graph, input: String, output: String| {
            let op = graph.add_op("ReduceMean").input(input).output(output);
            if axes_as_input {
                op.input(p("axes")).finish()
            } else {
                op.attr("axes", axes.to_vec()).finish()
            }
        };
        reduce_mean(graph, x.to_string(), p("mean"));
        graph.add_op("Sub").inputs([x.to_string(), p("mean")]).output(p("d")).finish();
        graph.add_op("Pow").inputs([p("d"), p("two")]).output(p("sq")).finish();
        reduce_mean(graph, p("sq"), p("var"));
        graph.add_op("Add").inputs([p("var"), p("eps")]).output(p("ve")).finish();
        graph.add_op("Sqrt").input(p("ve")).output(p("std")).finish();
        graph.add_op("Div").inputs([p("d"), p("std")]).output(p("n")).finish();
        graph.add_op("Mul").inputs([p("n"), p("gamma")]).output(p("scaled")).finish();
        graph.add_op("Add").inputs([p("scaled"), p("beta")]).output(p("out")).finish();
        p("out")
    }

    fn graph_with(axes: &[i64]) -> Graph {
        let mut graph = Graph::new();
        graph.add_input(value_info("x", DataType::Float, &[Dim::Fixed(2), Dim::Fixed(4)]));
        let out = decomposed_layer_norm(&mut graph, "x", "ln", axes, false);
        graph.add_output(value_info(out, DataType::Float, &[Dim::Fixed(2), Dim::Fixed(4)]));
        graph
    }

    #[test]
    fn test_fuses_decomposition() {
        let mut graph = graph_with(&[-1]);
        let outcome = FusionPass::new(Box::new(LayerNormFusion), FusionContext::default()).apply(&mut graph);
        assert_eq!(outcome.applied, 1);
        assert!(outcome.failures.is_empty());

        let (id, _) = graph.producer("ln_out").unwrap();
        let fused = graph.node(id).unwrap();
        assert_eq!(fused.op_type, "LayerNormalization");
        assert_eq!(fused.inputs, vec!["x", "ln_gamma", "ln_beta"]);
        assert_eq!(fused.attr_int("axis"), Some(-1));
        assert_eq!(fused.attr_float("epsilon"), Some(1e-12));
    }

    #[test]
    fn test_affine_shape_must_match_normalized_axis() {
        let mut graph = graph_with(&[-1]);
        graph.add_initializer(float_tensor("ln_gamma", &[3], &[1.0; 3]));
        graph.add_initializer(float_tensor("ln_beta", &[3], &[0.0; 3]));
        let outcome = FusionPass::new(Box::new(LayerNormFusion), FusionContext::default()).apply(&mut graph);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(outcome.failures[0].error, FusionError::UnderSpecified(_)));

        let mut graph = graph_with(&[-1]);
        graph.add_initializer(float_tensor("ln_beta", &[1, 4], &[0.0; 4]));
        let outcome = FusionPass::new(Box::new(LayerNormFusion), FusionContext::default()).apply(&mut graph);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.failures.len(), 1);
    }

    #[test]
    fn test_other_axis_not_fused() {
        let mut graph = graph_with(&[0]);
        let outcome = FusionPass::new(Box::new(LayerNormFusion), FusionContext::default()).apply(&mut graph);
        assert_eq!(outcome.applied, 0);
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn test_axes_from_input() {
        // opset 18 style: axes passed as a second input
        let mut graph = Graph::new();
        graph.add_input(value_info("x", DataType::Float, &[]));
        let out = decomposed_layer_norm(&mut graph, "x", "ln", &[-1], true);
        graph.add_output(value_info(out, DataType::Float, &[]));

        let outcome = FusionPass::new(Box::new(LayerNormFusion), FusionContext::default()).apply(&mut graph);
        assert_eq!(outcome.applied, 1);
    }
}
