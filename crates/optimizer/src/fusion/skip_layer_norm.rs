// SkipLayerNormalization fusion
//
// A LayerNormalization over a residual Add of two activations becomes
// SkipLayerNormalization(input, skip, gamma, beta[, bias]). When one operand
// is itself Add(t, bias) with a 1-D constant bias read only by the residual
// Add, the bias is absorbed.

use super::{FusedNodeSpec, Fusion, FusionContext, FusionKind};
use crate::error::FusionError;
use crate::graph::{Graph, GraphNode, MS_DOMAIN};
use crate::matcher::{Match, PathStep, Pattern};

pub struct SkipLayerNormFusion;

impl Fusion for SkipLayerNormFusion {
    fn kind(&self) -> FusionKind {
        FusionKind::SkipLayerNormalization
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![
            Pattern::new("skip_layer_norm_bias", "LayerNormalization")
                .path([PathStep::at("Add", 0), PathStep::any("Add")]),
            Pattern::new("skip_layer_norm", "LayerNormalization").path([PathStep::at("Add", 0)]),
        ]
    }

    fn plan(&self, m: &Match, graph: &Graph, _ctx: &FusionContext) -> Result<FusedNodeSpec, FusionError> {
        let ln = graph.node(m.anchor).ok_or(FusionError::NoMatch)?;
        if !ln.is_onnx() || ln.attr_int("axis").unwrap_or(-1) != -1 {
            return Err(FusionError::NoMatch);
        }
        let gamma = ln.input(1).ok_or(FusionError::NoMatch)?;
        let beta = ln.input(2).unwrap_or_default();
        let epsilon = ln.attr_float("epsilon").unwrap_or(1e-5);

        let residual = graph.node(m.node(0, 0)).ok_or(FusionError::NoMatch)?;
        let (a, b) = (
            residual.input(0).ok_or(FusionError::NoMatch)?,
            residual.input(1).ok_or(FusionError::NoMatch)?,
        );
        if graph.is_constant(a) || graph.is_constant(b) {
            return Err(FusionError::NoMatch);
        }

        let spec = FusedNodeSpec::new("SkipLayerNormalization", MS_DOMAIN)
            .name_hint("SkipLayerNorm")
            .attr("epsilon", epsilon);

        if m.paths[0].len() == 1 {
            return Ok(spec.inputs([a, b, gamma, beta]));
        }

        let bias_add = graph.node(m.node(0, 1)).ok_or(FusionError::NoMatch)?;
        let (input, bias) = bias_operands(graph, bias_add).ok_or(FusionError::NoMatch)?;
        let bias_out = bias_add.outputs.first().ok_or(FusionError::NoMatch)?;
        if graph.consumers_of(bias_out).len() != 1 || graph.is_graph_output(bias_out) {
            return Err(FusionError::NoMatch);
        }
        let skip = if a == bias_out.as_str() { b } else { a };

        Ok(spec.inputs([input, skip, gamma, beta, bias]))
    }
}

/// (activation, bias) of `Add(t, bias)` with a 1-D constant bias
fn bias_operands<'a>(graph: &Graph, add: &'a GraphNode) -> Option<(&'a str, &'a str)> {
    let (x, y) = (add.input(0)?, add.input(1)?);
    let is_bias = |name: &str| graph.constant_value(name).is_some_and(|t| t.dims.len() == 1);
    match (is_bias(x), is_bias(y)) {
        (false, true) if !graph.is_constant(x) => Some((x, y)),
        (true, false) if !graph.is_constant(y) => Some((y, x)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::FusionPass;
    use crate::graph::tensor::{float_tensor, value_info};
    use crate::proto::tensor_proto::DataType;

    fn residual_graph(with_bias: bool, bias_shared: bool) -> Graph {
        let mut g = Graph::new();
        g.add_input(value_info("x", DataType::Float, &[]));
        g.add_input(value_info("residual", DataType::Float, &[]));
        g.add_initializer(float_tensor("w", &[4, 4], &[0.5; 16]));
        g.add_initializer(float_tensor("b", &[4], &[0.1; 4]));
        g.add_initializer(float_tensor("gamma", &[4], &[1.0; 4]));
        g.add_initializer(float_tensor("beta", &[4], &[0.0; 4]));

        g.add_op("MatMul").inputs(["x", "w"]).output("mm").finish();
        let branch = if with_bias {
            g.add_op("Add").name("bias_add").inputs(["mm", "b"]).output("biased").finish();
            "biased"
        } else {
            "mm"
        };
        g.add_op("Add").name("residual_add").inputs([branch, "residual"]).output("sum").finish();
        g.add_op("LayerNormalization")
            .name("ln")
            .inputs(["sum", "gamma", "beta"])
            .attr("axis", -1i64)
            .attr("epsilon", 1e-12f32)
            .output("y")
            .finish();
        g.add_output(value_info("y", DataType::Float, &[]));
        if bias_shared {
            g.add_op("Relu").input("biased").output("side").finish();
            g.add_output(value_info("side", DataType::Float, &[]));
        }
        g
    }

    fn run(g: &mut Graph) -> usize {
        FusionPass::new(Box::new(SkipLayerNormFusion), FusionContext::default())
            .apply(g)
            .applied
    }

    fn fused(g: &Graph) -> GraphNode {
        let (id, _) = g.producer("y").unwrap();
        g.node(id).unwrap().clone()
    }

    #[test]
    fn test_bias_absorbed() {
        let mut g = residual_graph(true, false);
        assert_eq!(run(&mut g), 1);
        let node = fused(&g);
        assert_eq!(node.op_type, "SkipLayerNormalization");
        assert_eq!(node.domain, MS_DOMAIN);
        assert_eq!(node.inputs, vec!["mm", "residual", "gamma", "beta", "b"]);
        assert_eq!(node.attr_float("epsilon"), Some(1e-12));
    }

    #[test]
    fn test_without_bias() {
        let mut g = residual_graph(false, false);
        assert_eq!(run(&mut g), 1);
        assert_eq!(fused(&g).inputs, vec!["mm", "residual", "gamma", "beta"]);
    }

    #[test]
    fn test_shared_bias_falls_back_to_plain() {
        let mut g = residual_graph(true, true);
        let outcome = FusionPass::new(Box::new(SkipLayerNormFusion), FusionContext::default()).apply(&mut g);
        assert_eq!(outcome.applied, 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(fused(&g).inputs, vec!["biased", "residual", "gamma", "beta"]);
    }

    #[test]
    fn test_constant_operand_not_fused() {
        let mut g = Graph::new();
        g.add_input(value_info("x", DataType::Float, &[]));
        g.add_initializer(float_tensor("c", &[4], &[1.0; 4]));
        g.add_initializer(float_tensor("gamma", &[4], &[1.0; 4]));
        g.add_op("Add").inputs(["x", "c"]).output("sum").finish();
        g.add_op("LayerNormalization").inputs(["sum", "gamma"]).output("y").finish();
        g.add_output(value_info("y", DataType::Float, &[]));
        assert_eq!(run(&mut g), 0);
    }
}
