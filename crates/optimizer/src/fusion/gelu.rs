// Gelu and FastGelu fusion
//
// Exact Gelu, x * 0.5 * (1 + erf(x / sqrt(2))), is exported in three operand
// arrangements:
//
//   nested A:  Mul(Mul(x, Add(Erf(Div(x, sqrt2)), 1)), 0.5)
//   nested B:  Mul(x, Mul(Add(Erf(Div(x, sqrt2)), 1), 0.5))
//   split:     Mul(Mul(x, 0.5), Add(Erf(Div(x, sqrt2)), 1))
//
// The tanh approximation 0.5x(1 + tanh(sqrt(2/pi)(x + 0.044715x^3))) comes in
// the same arrangements and becomes FastGelu. Both fused ops take `x` only.

use super::{approx_eq, other_input, split_constant, FusedNodeSpec, Fusion, FusionContext, FusionKind};
use crate::error::FusionError;
use crate::graph::{Graph, GraphNode, MS_DOMAIN};
use crate::matcher::{Match, PathStep, Pattern};

pub struct GeluFusion;

const SQRT_2: f32 = std::f32::consts::SQRT_2;
const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const CUBIC_COEFFICIENT: f32 = 0.044_715;

const ERF_NESTED: &str = "gelu_erf_nested";
const ERF_SPLIT: &str = "gelu_erf_split";
const TANH_NESTED: &str = "fast_gelu_nested";
const TANH_SPLIT: &str = "fast_gelu_split";

impl Fusion for GeluFusion {
    fn kind(&self) -> FusionKind {
        FusionKind::Gelu
    }

    fn patterns(&self) -> Vec<Pattern> {
        let erf = [PathStep::any("Add"), PathStep::at("Erf", 0), PathStep::at("Div", 0)];
        let tanh = [
            PathStep::any("Add"),
            PathStep::any("Tanh"),
            PathStep::any("Mul"),
            PathStep::any("Add"),
            PathStep::any("Mul"),
            PathStep::any("Pow"),
        ];
        let nested = |steps: &[PathStep]| {
            let mut path = vec![PathStep::any("Mul")];
            path.extend_from_slice(steps);
            path
        };

        vec![
            Pattern::new(TANH_NESTED, "Mul").path(nested(&tanh)),
            Pattern::new(TANH_SPLIT, "Mul")
                .path(tanh.to_vec())
                .path([PathStep::any("Mul")]),
            Pattern::new(ERF_NESTED, "Mul").path(nested(&erf)),
            Pattern::new(ERF_SPLIT, "Mul")
                .path(erf.to_vec())
                .path([PathStep::any("Mul")]),
        ]
    }

    fn plan(&self, m: &Match, graph: &Graph, _ctx: &FusionContext) -> Result<FusedNodeSpec, FusionError> {
        let node = |path: usize, step: usize| graph.node(m.node(path, step)).ok_or(FusionError::NoMatch);
        let anchor = graph.node(m.anchor).ok_or(FusionError::NoMatch)?;

        let nested = matches!(m.pattern, ERF_NESTED | TANH_NESTED);
        let exact = matches!(m.pattern, ERF_NESTED | ERF_SPLIT);
        // offset of the `Add(., 1)` step in path 0
        let base = usize::from(nested);

        let plus_one = node(0, base)?;
        let x = if exact {
            check_erf(graph, plus_one, node(0, base + 1)?, node(0, base + 2)?)?
        } else {
            check_tanh(
                graph,
                plus_one,
                [node(0, base + 2)?, node(0, base + 3)?, node(0, base + 4)?, node(0, base + 5)?],
            )?
        };

        let plus_one_out = first_output(plus_one)?;
        let factors = if nested {
            let inner = node(0, 0)?;
            [
                other_input(anchor, first_output(inner)?),
                other_input(inner, plus_one_out),
            ]
        } else {
            let half = node(1, 0)?;
            if other_input(anchor, first_output(half)?) != Some(plus_one_out) {
                return Err(FusionError::NoMatch);
            }
            [half.input(0), half.input(1)]
        };
        if !half_and_x(graph, factors, x) {
            return Err(FusionError::NoMatch);
        }

        let op = if exact { "Gelu" } else { "FastGelu" };
        Ok(FusedNodeSpec::new(op, MS_DOMAIN).inputs([x]))
    }
}

fn first_output(node: &GraphNode) -> Result<&str, FusionError> {
    node.outputs.first().map(String::as_str).ok_or(FusionError::NoMatch)
}

/// `Add(Erf(Div(x, sqrt2)), 1)`, returning `x`
fn check_erf<'a>(graph: &Graph, plus_one: &GraphNode, erf: &GraphNode, div: &'a GraphNode) -> Result<&'a str, FusionError> {
    let (one, _) = split_constant(graph, plus_one).ok_or(FusionError::NoMatch)?;
    let (divisor, x) = split_constant(graph, div).ok_or(FusionError::NoMatch)?;
    if !approx_eq(one, 1.0) || !approx_eq(divisor, SQRT_2) || div.input(0) != Some(x) || erf.inputs.len() != 1 {
        return Err(FusionError::NoMatch);
    }
    Ok(x)
}

/// `Add(Tanh(Mul(Add(x, Mul(Pow(x, 3), c)), sqrt(2/pi))), 1)`, returning `x`
fn check_tanh<'a>(graph: &Graph, plus_one: &GraphNode, chain: [&'a GraphNode; 4]) -> Result<&'a str, FusionError> {
    let [scale, sum, cubic, pow] = chain;
    let (one, _) = split_constant(graph, plus_one).ok_or(FusionError::NoMatch)?;
    let (sqrt_2_over_pi, _) = split_constant(graph, scale).ok_or(FusionError::NoMatch)?;
    let (coefficient, _) = split_constant(graph, cubic).ok_or(FusionError::NoMatch)?;
    let (exponent, x) = split_constant(graph, pow).ok_or(FusionError::NoMatch)?;

    let constants_ok = approx_eq(one, 1.0)
        && approx_eq(sqrt_2_over_pi, SQRT_2_OVER_PI)
        && approx_eq(coefficient, CUBIC_COEFFICIENT)
        && approx_eq(exponent, 3.0);
    if !constants_ok || pow.input(0) != Some(x) || other_input(sum, first_output(cubic)?) != Some(x) {
        return Err(FusionError::NoMatch);
    }
    Ok(x)
}

/// The two remaining factors are `x` and the constant 0.5, in either order
fn half_and_x(graph: &Graph, factors: [Option<&str>; 2], x: &str) -> bool {
    let is_half = |name: &str| {
        graph
            .constant_value(name)
            .and_then(crate::graph::tensor::scalar_f32)
            .is_some_and(|v| approx_eq(v, 0.5))
    };
    match factors {
        [Some(a), Some(b)] => (a == x && is_half(b)) || (b == x && is_half(a)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::FusionPass;
    use crate::graph::tensor::{float_tensor, value_info};
    use crate::proto::tensor_proto::DataType;

    #[derive(Clone, Copy)]
    enum Arrangement {
        NestedA,
        NestedB,
        Split,
    }

    fn base_graph() -> Graph {
        let mut g = Graph::new();
        g.add_input(value_info("x", DataType::Float, &[]));
        g.add_initializer(float_tensor("sqrt2", &[], &[SQRT_2]));
        g.add_initializer(float_tensor("one", &[], &[1.0]));
        g.add_initializer(float_tensor("half", &[], &[0.5]));
        g.add_initializer(float_tensor("three", &[], &[3.0]));
        g.add_initializer(float_tensor("cubic", &[], &[CUBIC_COEFFICIENT]));
        g.add_initializer(float_tensor("s2pi", &[], &[SQRT_2_OVER_PI]));
        g
    }

    fn finish(g: &mut Graph, arrangement: Arrangement) {
        match arrangement {
            Arrangement::NestedA => {
                g.add_op("Mul").inputs(["x", "p1"]).output("inner").finish();
                g.add_op("Mul").inputs(["inner", "half"]).output("y").finish();
            }
            Arrangement::NestedB => {
                g.add_op("Mul").inputs(["p1", "half"]).output("inner").finish();
                g.add_op("Mul").inputs(["x", "inner"]).output("y").finish();
            }
            Arrangement::Split => {
                g.add_op("Mul").inputs(["half", "x"]).output("hx").finish();
                g.add_op("Mul").inputs(["hx", "p1"]).output("y").finish();
            }
        }
        g.add_output(value_info("y", DataType::Float, &[]));
    }

    fn erf_graph(arrangement: Arrangement) -> Graph {
        let mut g = base_graph();
        g.add_op("Div").inputs(["x", "sqrt2"]).output("d").finish();
        g.add_op("Erf").input("d").output("e").finish();
        g.add_op("Add").inputs(["e", "one"]).output("p1").finish();
        finish(&mut g, arrangement);
        g
    }

    fn tanh_graph(arrangement: Arrangement) -> Graph {
        let mut g = base_graph();
        g.add_op("Pow").inputs(["x", "three"]).output("x3").finish();
        g.add_op("Mul").inputs(["cubic", "x3"]).output("cx3").finish();
        g.add_op("Add").inputs(["x", "cx3"]).output("inner_sum").finish();
        g.add_op("Mul").inputs(["inner_sum", "s2pi"]).output("scaled").finish();
        g.add_op("Tanh").input("scaled").output("t").finish();
        g.add_op("Add").inputs(["one", "t"]).output("p1").finish();
        finish(&mut g, arrangement);
        g
    }

    fn fused_op(mut g: Graph) -> Option<String> {
        let outcome = FusionPass::new(Box::new(GeluFusion), FusionContext::default()).apply(&mut g);
        assert!(outcome.failures.is_empty());
        if outcome.applied == 0 {
            return None;
        }
        let (id, _) = g.producer("y")?;
        let node = g.node(id)?;
        assert_eq!(node.inputs, vec!["x"]);
        Some(node.op_type.clone())
    }

    #[test]
    fn test_erf_arrangements() {
        for arrangement in [Arrangement::NestedA, Arrangement::NestedB, Arrangement::Split] {
            assert_eq!(fused_op(erf_graph(arrangement)).as_deref(), Some("Gelu"));
        }
    }

    #[test]
    fn test_tanh_arrangements() {
        for arrangement in [Arrangement::NestedA, Arrangement::NestedB, Arrangement::Split] {
            assert_eq!(fused_op(tanh_graph(arrangement)).as_deref(), Some("FastGelu"));
        }
    }

    #[test]
    fn test_wrong_constant_not_fused() {
        let mut g = erf_graph(Arrangement::Split);
        g.add_initializer(float_tensor("half", &[], &[0.25]));
        assert_eq!(fused_op(g), None);
    }
}
