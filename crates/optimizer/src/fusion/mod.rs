//! Operator fusion.
//!
//! Each [`Fusion`] describes one motif: the [`Pattern`]s that locate it and a
//! `plan` step that validates a structural match and produces a
//! [`FusedNodeSpec`]. [`fuse`] performs the rewrite and [`FusionPass`] drives
//! one fusion over a whole graph. Fused nodes take over the span's external
//! outputs; the replaced nodes are left unreferenced for the pruner.

mod attention;
mod embed_layer_norm;
mod gelu;
mod layer_norm;
mod reshape;
mod skip_layer_norm;

pub use attention::AttentionFusion;
pub use embed_layer_norm::EmbedLayerNormFusion;
pub use gelu::GeluFusion;
pub use layer_norm::LayerNormFusion;
pub use reshape::ReshapeCollapseFusion;
pub use skip_layer_norm::SkipLayerNormFusion;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rustc_hash::FxHashSet;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::FusionError;
use crate::graph::tensor::{i64_values, scalar_f32};
use crate::graph::{AttrValue, Graph, GraphNode, NodeId};
use crate::matcher::{candidates, Match, Pattern};
use crate::passes::OptimizationPass;
use crate::proto::TensorProto;

/// Fusion kinds, in the order the pipeline applies them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FusionKind {
    ReshapeCollapse,
    LayerNormalization,
    EmbedLayerNormalization,
    SkipLayerNormalization,
    Attention,
    Gelu,
}

impl FusionKind {
    pub const ALL: [FusionKind; 6] = [
        FusionKind::ReshapeCollapse,
        FusionKind::LayerNormalization,
        FusionKind::EmbedLayerNormalization,
        FusionKind::SkipLayerNormalization,
        FusionKind::Attention,
        FusionKind::Gelu,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FusionKind::ReshapeCollapse => "ReshapeCollapse",
            FusionKind::LayerNormalization => "LayerNormalization",
            FusionKind::EmbedLayerNormalization => "EmbedLayerNormalization",
            FusionKind::SkipLayerNormalization => "SkipLayerNormalization",
            FusionKind::Attention => "Attention",
            FusionKind::Gelu => "Gelu",
        }
    }

    /// Fusion implementation for this kind
    pub fn fusion(&self) -> Box<dyn Fusion> {
        match self {
            FusionKind::ReshapeCollapse => Box::new(ReshapeCollapseFusion),
            FusionKind::LayerNormalization => Box::new(LayerNormFusion),
            FusionKind::EmbedLayerNormalization => Box::new(EmbedLayerNormFusion),
            FusionKind::SkipLayerNormalization => Box::new(SkipLayerNormFusion),
            FusionKind::Attention => Box::new(AttentionFusion),
            FusionKind::Gelu => Box::new(GeluFusion),
        }
    }
}

impl fmt::Display for FusionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FusionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "reshape" | "reshapecollapse" => Ok(FusionKind::ReshapeCollapse),
            "layernorm" | "layernormalization" => Ok(FusionKind::LayerNormalization),
            "embedlayernorm" | "embedlayernormalization" | "embedding" => Ok(FusionKind::EmbedLayerNormalization),
            "skiplayernorm" | "skiplayernormalization" => Ok(FusionKind::SkipLayerNormalization),
            "attention" => Ok(FusionKind::Attention),
            "gelu" | "fastgelu" => Ok(FusionKind::Gelu),
            _ => Err(format!(
                "unknown fusion '{s}' (expected one of: reshape, layernorm, embedlayernorm, skiplayernorm, attention, gelu)"
            )),
        }
    }
}

/// Declared hyperparameters visible to every fusion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FusionContext {
    /// Declared attention head count, `None` to infer
    pub num_heads: Option<usize>,
    /// Declared hidden size, `None` to infer
    pub hidden_size: Option<usize>,
}

/// Replacement for a matched span
#[derive(Debug, Clone, PartialEq)]
pub struct FusedNodeSpec {
    pub op_type: String,
    pub domain: String,
    pub name_hint: String,
    /// Canonical ordered inputs; an empty string omits an optional input
    pub inputs: Vec<String>,
    pub attributes: BTreeMap<String, AttrValue>,
    pub new_initializers: Vec<TensorProto>,
    /// Helper nodes inserted ahead of the fused node. A helper whose outputs
    /// already exist is shared rather than inserted again.
    pub prelude: Vec<GraphNode>,
}

impl FusedNodeSpec {
    pub fn new(op_type: impl Into<String>, domain: impl Into<String>) -> Self {
        let op_type = op_type.into();
        Self {
            name_hint: op_type.clone(),
            op_type,
            domain: domain.into(),
            inputs: Vec::new(),
            attributes: BTreeMap::new(),
            new_initializers: Vec::new(),
            prelude: Vec::new(),
        }
    }

    pub fn name_hint(mut self, hint: impl Into<String>) -> Self {
        self.name_hint = hint.into();
        self
    }

    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn initializer(mut self, tensor: TensorProto) -> Self {
        self.new_initializers.push(tensor);
        self
    }

    pub fn prelude(mut self, node: GraphNode) -> Self {
        self.prelude.push(node);
        self
    }
}

/// A fusion motif: how to find it and how to rewrite it
pub trait Fusion {
    fn kind(&self) -> FusionKind;

    /// Patterns tried for this fusion; the longest match per anchor wins and
    /// shorter alternatives are tried when planning it fails
    fn patterns(&self) -> Vec<Pattern>;

    /// Validate a structural match and describe its replacement
    fn plan(&self, m: &Match, graph: &Graph, ctx: &FusionContext) -> Result<FusedNodeSpec, FusionError>;
}

/// Replace the span of `m` with the node described by `spec`.
///
/// The span's external outputs (tensors consumed outside the span or declared
/// as graph outputs) must come from a single node and resolve to a single
/// tensor, and every spec input must be defined outside the span. The fused
/// node inherits the ordering key of the anchor.
pub fn fuse(graph: &mut Graph, m: &Match, spec: FusedNodeSpec) -> Result<NodeId, FusionError> {
    let span: FxHashSet<NodeId> = m.span.iter().copied().collect();

    let mut external: Vec<(NodeId, usize, String)> = Vec::new();
    for &id in &m.span {
        let node = graph
            .node(id)
            .ok_or_else(|| FusionError::AmbiguousWiring(format!("span node {} no longer exists", id.index())))?;
        for (slot, tensor) in node.outputs.iter().enumerate() {
            if tensor.is_empty() || graph.producer(tensor) != Some((id, slot)) {
                continue;
            }
            let escapes = graph.is_graph_output(tensor)
                || graph.consumers_of(tensor).iter().any(|(c, _)| !span.contains(c));
            if escapes {
                external.push((id, slot, tensor.clone()));
            }
        }
    }

    let output = match external.as_slice() {
        [(_, _, tensor)] => tensor.clone(),
        [] => return Err(FusionError::AmbiguousWiring("span has no external output".into())),
        many => {
            let names: Vec<&str> = many.iter().map(|(_, _, t)| t.as_str()).collect();
            return Err(FusionError::AmbiguousWiring(format!(
                "outputs leave the span through {}",
                names.join(", ")
            )));
        }
    };

    let provided: FxHashSet<&str> = spec
        .new_initializers
        .iter()
        .map(|t| t.name.as_str())
        .chain(spec.prelude.iter().flat_map(|n| n.outputs.iter().map(String::as_str)))
        .collect();
    for input in spec.inputs.iter().filter(|i| !i.is_empty()) {
        if provided.contains(input.as_str()) {
            continue;
        }
        if !graph.is_defined(input) {
            return Err(FusionError::AmbiguousWiring(format!("input '{input}' is not defined")));
        }
        if graph.producer_node(input).is_some_and(|p| span.contains(&p)) {
            return Err(FusionError::AmbiguousWiring(format!(
                "input '{input}' is produced inside the span"
            )));
        }
    }

    let order = graph.node(m.anchor).map(|n| n.order).unwrap_or_default();

    for tensor in spec.new_initializers {
        graph.add_initializer(tensor);
    }
    for mut helper in spec.prelude {
        if helper.outputs.iter().all(|o| graph.producer(o).is_some()) {
            continue;
        }
        helper.name = graph.fresh_node_name(&helper.name);
        helper.order = order;
        graph.insert_node(helper);
    }

    let name = graph.fresh_node_name(&spec.name_hint);
    let fused = GraphNode {
        name,
        op_type: spec.op_type,
        domain: spec.domain,
        inputs: spec.inputs,
        outputs: vec![output],
        attributes: spec.attributes,
        doc_string: String::new(),
        order,
    };
    Ok(graph.insert_node(fused))
}

/// A recorded, non-silent fusion failure
#[derive(Debug, Clone, PartialEq)]
pub struct FusionFailure {
    pub kind: FusionKind,
    pub pattern: &'static str,
    /// Display name of the anchor node
    pub anchor: String,
    pub error: FusionError,
}

impl fmt::Display for FusionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at '{}' ({}): {}", self.kind, self.anchor, self.pattern, self.error)
    }
}

impl Serialize for FusionFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FusionFailure", 5)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("pattern", self.pattern)?;
        state.serialize_field("anchor", &self.anchor)?;
        state.serialize_field("error", self.error.label())?;
        state.serialize_field("message", &self.error.to_string())?;
        state.end()
    }
}

/// Result of running one fusion pass
#[derive(Debug, Clone, Default)]
pub struct FusionOutcome {
    pub applied: usize,
    pub failures: Vec<FusionFailure>,
    /// A fatal error stopped the pass early
    pub aborted: bool,
}

/// Runs one fusion over a graph snapshot
pub struct FusionPass {
    fusion: Box<dyn Fusion>,
    context: FusionContext,
}

impl FusionPass {
    pub fn new(fusion: Box<dyn Fusion>, context: FusionContext) -> Self {
        Self { fusion, context }
    }

    pub fn kind(&self) -> FusionKind {
        self.fusion.kind()
    }

    /// Match every pattern against the current graph, then plan and fuse
    /// candidates greedily (longest span first, earliest start on ties).
    ///
    /// A candidate overlapping an already fused span is skipped. `NoMatch`
    /// is silent; other errors are recorded once per anchor and forgotten if
    /// another pattern for the same anchor later succeeds. A fatal error
    /// stops the pass.
    pub fn apply(&self, graph: &mut Graph) -> FusionOutcome {
        let kind = self.fusion.kind();
        let mut all: Vec<Match> = self
            .fusion
            .patterns()
            .iter()
            .flat_map(|pattern| candidates(graph, pattern))
            .collect();
        all.sort_by(|a, b| {
            b.len()
                .cmp(&a.len())
                .then(a.start_rank().cmp(&b.start_rank()))
                .then(a.anchor_rank().cmp(&b.anchor_rank()))
        });

        let mut outcome = FusionOutcome::default();
        let mut claimed: FxHashSet<NodeId> = FxHashSet::default();
        let mut fused_anchors: FxHashSet<NodeId> = FxHashSet::default();
        let mut failures: BTreeMap<usize, FusionFailure> = BTreeMap::new();

        for m in &all {
            if fused_anchors.contains(&m.anchor) || m.span.iter().any(|id| claimed.contains(id)) {
                continue;
            }
            let anchor_name = graph
                .node(m.anchor)
                .map(|n| n.display_name().to_string())
                .unwrap_or_default();

            let result = self
                .fusion
                .plan(m, graph, &self.context)
                .and_then(|spec| fuse(graph, m, spec));

            match result {
                Ok(fused) => {
                    claimed.extend(m.span.iter().copied());
                    fused_anchors.insert(m.anchor);
                    failures.remove(&m.anchor_rank());
                    outcome.applied += 1;
                    debug!(
                        "{}: fused {} nodes at '{}' into '{}'",
                        kind,
                        m.len(),
                        anchor_name,
                        graph.node(fused).map(|n| n.name.as_str()).unwrap_or_default()
                    );
                }
                Err(FusionError::NoMatch) => {}
                Err(error) => {
                    let fatal = error.is_fatal();
                    failures.entry(m.anchor_rank()).or_insert(FusionFailure {
                        kind,
                        pattern: m.pattern,
                        anchor: anchor_name,
                        error,
                    });
                    if fatal {
                        outcome.aborted = true;
                        break;
                    }
                }
            }
        }

        outcome.failures = failures.into_values().collect();
        for failure in &outcome.failures {
            warn!("{}", failure);
        }
        outcome
    }
}

impl OptimizationPass for FusionPass {
    fn name(&self) -> &str {
        self.fusion.kind().name()
    }

    fn run(&self, graph: &mut Graph) -> crate::Result<bool> {
        Ok(self.apply(graph).applied > 0)
    }
}

/// The other input of a binary node, given one of them
pub(crate) fn other_input<'a>(node: &'a GraphNode, known: &str) -> Option<&'a str> {
    match (node.input(0), node.input(1)) {
        (Some(a), Some(b)) if a == known => Some(b),
        (Some(a), Some(b)) if b == known => Some(a),
        _ => None,
    }
}

/// Scalar constant among a binary node's inputs, with the non-constant one
pub(crate) fn split_constant<'a>(graph: &Graph, node: &'a GraphNode) -> Option<(f32, &'a str)> {
    let (a, b) = (node.input(0)?, node.input(1)?);
    if let Some(v) = graph.constant_value(b).and_then(scalar_f32) {
        if !graph.is_constant(a) {
            return Some((v, a));
        }
    }
    if let Some(v) = graph.constant_value(a).and_then(scalar_f32) {
        if !graph.is_constant(b) {
            return Some((v, b));
        }
    }
    None
}

/// Approximate float equality for exported constants
pub(crate) fn approx_eq(a: f32, b: f32) -> bool {
    (a - b).abs() <= 1e-4 * b.abs().max(1.0)
}

/// Reduction axes from the `axes` attribute or, from opset 18, input 1
pub(crate) fn reduce_axes(graph: &Graph, node: &GraphNode) -> Option<Vec<i64>> {
    if let Some(axes) = node.attr_ints("axes") {
        return Some(axes.to_vec());
    }
    let tensor = graph.constant_value(node.input(1)?)?;
    i64_values(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tensor::value_info;
    use crate::matcher::{find, PathStep};
    use crate::proto::tensor_proto::DataType;

    fn output(g: &mut Graph, name: &str) {
        g.add_output(value_info(name, DataType::Float, &[]));
    }

    // x -> Neg -> Relu -> y, with Neg output also read by Sigmoid -> z
    fn escaping_graph() -> Graph {
        let mut g = Graph::new();
        g.add_op("Neg").name("neg").input("x").output("n").finish();
        g.add_op("Relu").name("relu").input("n").output("y").finish();
        g.add_op("Sigmoid").name("sig").input("n").output("z").finish();
        output(&mut g, "y");
        output(&mut g, "z");
        g
    }

    fn neg_relu() -> Pattern {
        Pattern::new("neg_relu", "Relu").path([PathStep::at("Neg", 0)])
    }

    #[test]
    fn test_fuse_takes_over_outputs() {
        let mut g = Graph::new();
        g.add_input(value_info("x", DataType::Float, &[]));
        g.add_op("Neg").name("neg").input("x").output("n").finish();
        let relu = g.add_op("Relu").name("relu").input("n").output("y").finish();
        let tail = g.add_op("Exp").name("exp").input("y").output("e").finish();

        let m = find(&g, &neg_relu()).remove(0);
        let fused = fuse(&mut g, &m, FusedNodeSpec::new("NegRelu", "test").inputs(["x"])).unwrap();

        assert_eq!(g.producer("y"), Some((fused, 0)));
        assert_eq!(g.consumers_of("y"), vec![(tail, 0)]);
        assert_eq!(g.node(fused).unwrap().order, g.node(relu).unwrap().order);
    }

    #[test]
    fn test_fuse_rejects_escaping_outputs() {
        let mut g = escaping_graph();
        let m = find(&g, &neg_relu()).remove(0);
        let err = fuse(&mut g, &m, FusedNodeSpec::new("NegRelu", "").inputs(["x"])).unwrap_err();
        assert!(matches!(err, FusionError::AmbiguousWiring(_)));
    }

    #[test]
    fn test_fuse_rejects_inputs_from_inside_span() {
        let mut g = Graph::new();
        g.add_op("Neg").name("neg").input("x").output("n").finish();
        g.add_op("Relu").name("relu").input("n").output("y").finish();
        output(&mut g, "y");
        let m = find(&g, &neg_relu()).remove(0);
        let err = fuse(&mut g, &m, FusedNodeSpec::new("NegRelu", "").inputs(["n"])).unwrap_err();
        assert!(matches!(err, FusionError::AmbiguousWiring(_)));
    }

    #[test]
    fn test_shared_prelude_inserted_once() {
        let mut g = Graph::new();
        g.add_op("Neg").input("x").output("n1").finish();
        g.add_op("Relu").input("n1").output("y1").finish();
        g.add_op("Neg").input("x").output("n2").finish();
        g.add_op("Relu").input("n2").output("y2").finish();
        output(&mut g, "y1");
        output(&mut g, "y2");

        let helper = {
            let mut node = GraphNode::new("Cast");
            node.name = "cast".into();
            node.inputs = vec!["x".into()];
            node.outputs = vec!["x_cast".into()];
            node
        };
        for m in find(&g, &neg_relu()) {
            let spec = FusedNodeSpec::new("NegRelu", "")
                .inputs(["x_cast"])
                .prelude(helper.clone());
            fuse(&mut g, &m, spec).unwrap();
        }
        assert_eq!(g.count_op("Cast"), 1);
        assert_eq!(g.count_op("NegRelu"), 2);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("attention".parse::<FusionKind>(), Ok(FusionKind::Attention));
        assert_eq!("skip-layer-norm".parse::<FusionKind>(), Ok(FusionKind::SkipLayerNormalization));
        assert_eq!("FastGelu".parse::<FusionKind>(), Ok(FusionKind::Gelu));
        assert!("conv".parse::<FusionKind>().is_err());
    }

    #[test]
    fn test_split_constant() {
        use crate::graph::tensor::float_tensor;
        let mut g = Graph::new();
        g.add_initializer(float_tensor("half", &[], &[0.5]));
        let id = g.add_op("Mul").inputs(["half", "x"]).output("y").finish();
        let node = g.node(id).unwrap().clone();
        assert_eq!(split_constant(&g, &node), Some((0.5, "x")));
        assert_eq!(other_input(&node, "x"), Some("half"));
    }
}
