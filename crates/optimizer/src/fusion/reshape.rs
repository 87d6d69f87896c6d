// Consecutive Reshape collapsing
//
// Reshape(Reshape(x, s1), s2) with constant shapes becomes Reshape(x, s2'),
// where each 0 in s2 (copy the input dim) is replaced by the matching entry
// of s1. The inner Reshape is dropped by the pruner once nothing reads it.

use super::{FusedNodeSpec, Fusion, FusionContext, FusionKind};
use crate::error::FusionError;
use crate::graph::tensor::{i64_values, int64_tensor};
use crate::graph::{Graph, GraphNode};
use crate::matcher::{Match, PathStep, Pattern};

pub struct ReshapeCollapseFusion;

impl Fusion for ReshapeCollapseFusion {
    fn kind(&self) -> FusionKind {
        FusionKind::ReshapeCollapse
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::new("reshape_reshape", "Reshape").path([PathStep::at("Reshape", 0)])]
    }

    fn plan(&self, m: &Match, graph: &Graph, _ctx: &FusionContext) -> Result<FusedNodeSpec, FusionError> {
        let outer = graph.node(m.anchor).ok_or(FusionError::NoMatch)?;
        let inner = graph.node(m.node(0, 0)).ok_or(FusionError::NoMatch)?;
        let first = target_shape(graph, inner)?;
        let second = target_shape(graph, outer)?;

        let collapsed = collapse(&first, &second).ok_or(FusionError::NoMatch)?;
        let x = inner.input(0).ok_or(FusionError::NoMatch)?;
        let out = outer.outputs.first().ok_or(FusionError::NoMatch)?;
        let shape_name = graph.fresh_tensor_name(&format!("{out}_collapsed_shape"));

        Ok(FusedNodeSpec::new("Reshape", "")
            .inputs([x, shape_name.as_str()])
            .initializer(int64_tensor(shape_name.as_str(), &[collapsed.len() as i64], &collapsed)))
    }
}

/// Constant target shape of a Reshape without `allowzero`
fn target_shape(graph: &Graph, reshape: &GraphNode) -> Result<Vec<i64>, FusionError> {
    if reshape.attr_int("allowzero").unwrap_or(0) == 1 {
        return Err(FusionError::NoMatch);
    }
    reshape
        .input(1)
        .and_then(|s| graph.constant_value(s))
        .and_then(i64_values)
        .ok_or(FusionError::NoMatch)
}

/// `second` with zeros resolved against `first`; `None` when a zero has no
/// counterpart or the result would infer more than one dimension
fn collapse(first: &[i64], second: &[i64]) -> Option<Vec<i64>> {
    let collapsed = second
        .iter()
        .enumerate()
        .map(|(i, &d)| if d == 0 { first.get(i).copied() } else { Some(d) })
        .collect::<Option<Vec<_>>>()?;
    (collapsed.iter().filter(|&&d| d == -1).count() <= 1).then_some(collapsed)
}
