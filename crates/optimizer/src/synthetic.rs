//! Synthetic encoder models.
//!
//! [`BertGraphBuilder`] emits an unfused opset-12 BERT encoder in the shape
//! PyTorch exporters produce: three embedding lookups with a decomposed
//! LayerNormalization, `L` self-attention layers with the additive mask
//! chain, erf or tanh Gelu feed-forward blocks, and a question-answering
//! head. It is used by tests and by the `generate` command for smoke runs.
//!
//! ```
//! use bert_fusion_optimizer::synthetic::BertGraphBuilder;
//!
//! let graph = BertGraphBuilder::new().layers(2).heads(2).hidden(8).build()?;
//! assert_eq!(graph.count_op("Softmax"), 2);
//! # Ok::<(), bert_fusion_optimizer::OptimizerError>(())
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::OptimizerError;
use crate::graph::tensor::{float_tensor, int64_tensor, structure_only, value_info, Dim};
use crate::graph::Graph;
use crate::proto::tensor_proto::DataType;
use crate::proto::OperatorSetIdProto;
use crate::Result;

/// Exported form of the feed-forward activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeluForm {
    /// `x * 0.5 * (1 + erf(x / sqrt(2)))`
    #[default]
    Erf,
    /// `0.5x(1 + tanh(sqrt(2/pi)(x + 0.044715x^3)))`
    Tanh,
}

const OPSET: i64 = 12;
const TYPE_VOCAB: i64 = 2;
const MASK_FILL: f32 = -10000.0;
const EPSILON: f32 = 1e-12;

/// Builder for unfused BERT encoder graphs
#[derive(Debug, Clone)]
pub struct BertGraphBuilder {
    layers: usize,
    heads: usize,
    hidden: usize,
    intermediate: Option<usize>,
    vocab: usize,
    seq_len: usize,
    gelu: GeluForm,
    mask: bool,
    redundant_reshape: bool,
    structure_only: bool,
    seed: u64,
    irregular_layer: Option<usize>,
}

impl Default for BertGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BertGraphBuilder {
    pub fn new() -> Self {
        Self {
            layers: 2,
            heads: 2,
            hidden: 8,
            intermediate: None,
            vocab: 16,
            seq_len: 4,
            gelu: GeluForm::Erf,
            mask: true,
            redundant_reshape: false,
            structure_only: false,
            seed: 0,
            irregular_layer: None,
        }
    }

    pub fn layers(mut self, layers: usize) -> Self {
        self.layers = layers;
        self
    }

    pub fn heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    pub fn hidden(mut self, hidden: usize) -> Self {
        self.hidden = hidden;
        self
    }

    /// Feed-forward width, 4 × hidden by default
    pub fn intermediate(mut self, intermediate: usize) -> Self {
        self.intermediate = Some(intermediate);
        self
    }

    pub fn vocab(mut self, vocab: usize) -> Self {
        self.vocab = vocab;
        self
    }

    /// Fixed sequence length; also the position table height
    pub fn seq_len(mut self, seq_len: usize) -> Self {
        self.seq_len = seq_len;
        self
    }

    pub fn gelu(mut self, form: GeluForm) -> Self {
        self.gelu = form;
        self
    }

    /// Emit the `attention_mask` input and the additive mask chain
    pub fn mask(mut self, mask: bool) -> Self {
        self.mask = mask;
        self
    }

    /// Insert a collapsible Reshape pair in front of the head
    pub fn redundant_reshape(mut self, enabled: bool) -> Self {
        self.redundant_reshape = enabled;
        self
    }

    /// Weights carry dims and dtype but no payload
    pub fn structure_only(mut self, enabled: bool) -> Self {
        self.structure_only = enabled;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Give one layer Q and K projections of half width, which no
    /// Attention node can express
    pub fn irregular_layer(mut self, layer: Option<usize>) -> Self {
        self.irregular_layer = layer;
        self
    }

    pub fn build(&self) -> Result<Graph> {
        self.validate()?;
        let mut emitter = Emitter {
            graph: Graph::new(),
            rng: StdRng::seed_from_u64(self.seed),
            structure_only: self.structure_only,
            hidden: self.hidden as i64,
        };
        emitter.graph.metadata.ir_version = 7;
        emitter.graph.metadata.producer_name = "bert-fusion".into();
        emitter.graph.metadata.graph_name = "bert_encoder".into();
        emitter.graph.metadata.opset_imports = vec![OperatorSetIdProto {
            domain: String::new(),
            version: OPSET,
        }];

        let s = self.seq_len as i64;
        let ids = [Dim::Symbolic("batch".into()), Dim::Fixed(s)];
        emitter.graph.add_input(value_info("input_ids", DataType::Int64, &ids));
        if self.mask {
            emitter.graph.add_input(value_info("attention_mask", DataType::Int64, &ids));
        }
        emitter.graph.add_input(value_info("token_type_ids", DataType::Int64, &ids));

        emitter.shared_constants();
        let mut hidden_state = emitter.embeddings(self.vocab as i64, s);
        let mask_bias = self.mask.then(|| emitter.mask_chain());

        let intermediate = self.intermediate.unwrap_or(4 * self.hidden) as i64;
        for layer in 0..self.layers {
            let prefix = format!("layer{layer}");
            let irregular = self.irregular_layer == Some(layer);
            let attended = emitter.attention(&prefix, &hidden_state, mask_bias.as_deref(), self.heads as i64, irregular);
            hidden_state = emitter.feed_forward(&prefix, &attended, intermediate, self.gelu);
        }

        let dims = [Dim::Symbolic("batch".into()), Dim::Fixed(s), Dim::Fixed(self.hidden as i64)];
        emitter
            .graph
            .add_output(value_info(hidden_state.as_str(), DataType::Float, &dims));

        let head_input = if self.redundant_reshape {
            emitter.reshape_pair(&hidden_state)
        } else {
            hidden_state
        };
        emitter.qa_head(&head_input);
        let logits = [Dim::Symbolic("batch".into()), Dim::Fixed(s), Dim::Fixed(2)];
        emitter.graph.add_output(value_info("qa_logits", DataType::Float, &logits));

        Ok(emitter.graph)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(OptimizerError::Graph(msg)) };
        if self.heads == 0 || self.hidden == 0 || self.hidden % self.heads != 0 {
            return invalid(format!(
                "hidden size {} is not a multiple of {} heads",
                self.hidden, self.heads
            ));
        }
        if !(self.vocab > self.seq_len && self.seq_len > TYPE_VOCAB as usize) {
            return invalid(format!(
                "embedding tables must differ in height: vocab {} > seq_len {} > {}",
                self.vocab, self.seq_len, TYPE_VOCAB
            ));
        }
        if let Some(layer) = self.irregular_layer {
            if layer >= self.layers || (self.hidden / self.heads) % 2 != 0 {
                return invalid(format!(
                    "irregular layer {layer} needs an existing layer and an even head size"
                ));
            }
        }
        Ok(())
    }
}

struct Emitter {
    graph: Graph,
    rng: StdRng,
    structure_only: bool,
    hidden: i64,
}

impl Emitter {
    /// Learned parameter: random values around `center`, or dims only
    fn weight(&mut self, name: &str, dims: &[i64], center: f32, spread: f32) -> String {
        let tensor = if self.structure_only {
            structure_only(name, dims, DataType::Float)
        } else {
            let count: i64 = dims.iter().product();
            let values: Vec<f32> = (0..count)
                .map(|_| center + self.rng.gen_range(-spread..spread))
                .collect();
            float_tensor(name, dims, &values)
        };
        self.graph.add_initializer(tensor);
        name.to_string()
    }

    fn scalar(&mut self, name: &str, value: f32) -> String {
        self.graph.add_initializer(float_tensor(name, &[], &[value]));
        name.to_string()
    }

    fn shape(&mut self, name: &str, dims: &[i64]) -> String {
        self.graph.add_initializer(int64_tensor(name, &[dims.len() as i64], dims));
        name.to_string()
    }

    fn shared_constants(&mut self) {
        self.scalar("const_one", 1.0);
        self.scalar("const_two", 2.0);
        self.scalar("const_half", 0.5);
        self.scalar("const_epsilon", EPSILON);
        self.scalar("const_sqrt_two", std::f32::consts::SQRT_2);
        self.scalar("const_three", 3.0);
        self.scalar("const_cubic", 0.044_715);
        self.scalar("const_sqrt_two_over_pi", 0.797_884_6);
        self.scalar("const_mask_fill", MASK_FILL);
    }

    fn embeddings(&mut self, vocab: i64, seq_len: i64) -> String {
        let h = self.hidden;
        let word = self.weight("embeddings.word_embeddings.weight", &[vocab, h], 0.0, 0.1);
        let position = self.weight("embeddings.position_embeddings.weight", &[seq_len, h], 0.0, 0.1);
        let segment = self.weight("embeddings.token_type_embeddings.weight", &[TYPE_VOCAB, h], 0.0, 0.1);
        let positions: Vec<i64> = (0..seq_len).collect();
        self.graph
            .add_initializer(int64_tensor("position_ids", &[1, seq_len], &positions));

        let g = &mut self.graph;
        g.add_op("Gather")
            .name("embeddings/word/Gather")
            .inputs([word.as_str(), "input_ids"])
            .output("embeddings.word")
            .finish();
        g.add_op("Gather")
            .name("embeddings/position/Gather")
            .inputs([position.as_str(), "position_ids"])
            .output("embeddings.position")
            .finish();
        g.add_op("Gather")
            .name("embeddings/token_type/Gather")
            .inputs([segment.as_str(), "token_type_ids"])
            .output("embeddings.token_type")
            .finish();
        g.add_op("Add")
            .name("embeddings/Add")
            .inputs(["embeddings.word", "embeddings.position"])
            .output("embeddings.word_position")
            .finish();
        g.add_op("Add")
            .name("embeddings/Add_1")
            .inputs(["embeddings.word_position", "embeddings.token_type"])
            .output("embeddings.sum")
            .finish();

        self.layer_norm("embeddings/LayerNorm", "embeddings.sum")
    }

    /// `(1 - Cast(Unsqueeze(Unsqueeze(mask, 1), 2))) * -10000`
    fn mask_chain(&mut self) -> String {
        let g = &mut self.graph;
        g.add_op("Unsqueeze")
            .name("mask/Unsqueeze")
            .input("attention_mask")
            .attr("axes", vec![1i64])
            .output("mask.unsqueezed")
            .finish();
        g.add_op("Unsqueeze")
            .name("mask/Unsqueeze_1")
            .input("mask.unsqueezed")
            .attr("axes", vec![2i64])
            .output("mask.extended")
            .finish();
        g.add_op("Cast")
            .name("mask/Cast")
            .input("mask.extended")
            .attr("to", DataType::Float as i64)
            .output("mask.float")
            .finish();
        g.add_op("Sub")
            .name("mask/Sub")
            .inputs(["const_one", "mask.float"])
            .output("mask.inverted")
            .finish();
        g.add_op("Mul")
            .name("mask/Mul")
            .inputs(["mask.inverted", "const_mask_fill"])
            .output("mask.bias")
            .finish();
        "mask.bias".to_string()
    }

    /// Decomposed LayerNormalization over the last axis
    fn layer_norm(&mut self, prefix: &str, x: &str) -> String {
        let h = self.hidden;
        let gamma = self.weight(&format!("{prefix}.weight"), &[h], 1.0, 0.1);
        let beta = self.weight(&format!("{prefix}.bias"), &[h], 0.0, 0.1);
        let t = |s: &str| format!("{prefix}.{s}");
        let n = |s: &str| format!("{prefix}/{s}");

        let g = &mut self.graph;
        g.add_op("ReduceMean")
            .name(n("ReduceMean"))
            .input(x)
            .attr("axes", vec![-1i64])
            .output(t("mean"))
            .finish();
        g.add_op("Sub")
            .name(n("Sub"))
            .inputs([x.to_string(), t("mean")])
            .output(t("centered"))
            .finish();
        g.add_op("Pow")
            .name(n("Pow"))
            .inputs([t("centered"), "const_two".into()])
            .output(t("squared"))
            .finish();
        g.add_op("ReduceMean")
            .name(n("ReduceMean_1"))
            .input(t("squared"))
            .attr("axes", vec![-1i64])
            .output(t("variance"))
            .finish();
        g.add_op("Add")
            .name(n("Add"))
            .inputs([t("variance"), "const_epsilon".into()])
            .output(t("variance_eps"))
            .finish();
        g.add_op("Sqrt")
            .name(n("Sqrt"))
            .input(t("variance_eps"))
            .output(t("stddev"))
            .finish();
        g.add_op("Div")
            .name(n("Div"))
            .inputs([t("centered"), t("stddev")])
            .output(t("normalized"))
            .finish();
        g.add_op("Mul")
            .name(n("Mul"))
            .inputs([t("normalized"), gamma])
            .output(t("scaled"))
            .finish();
        g.add_op("Add")
            .name(n("Add_1"))
            .inputs([t("scaled"), beta])
            .output(t("output"))
            .finish();
        t("output")
    }

    /// `Add(MatMul(x, W), b)`, returning the biased output
    fn dense(&mut self, prefix: &str, x: &str, rows: i64, cols: i64) -> String {
        let weight = self.weight(&format!("{prefix}.weight"), &[rows, cols], 0.0, 0.2);
        let bias = self.weight(&format!("{prefix}.bias"), &[cols], 0.0, 0.1);
        let projected = format!("{prefix}.projected");
        let output = format!("{prefix}.output");
        self.graph
            .add_op("MatMul")
            .name(format!("{prefix}/MatMul"))
            .inputs([x.to_string(), weight])
            .output(projected.as_str())
            .finish();
        self.graph
            .add_op("Add")
            .name(format!("{prefix}/Add"))
            .inputs([projected, bias])
            .output(output.as_str())
            .finish();
        output
    }

    /// Projection split into heads: `[B, S, N, D]` transposed by `perm`
    fn heads(&mut self, prefix: &str, x: &str, heads: i64, head_size: i64, perm: Vec<i64>) -> String {
        let biased = self.dense(prefix, x, self.hidden, heads * head_size);
        let shape = self.shape(&format!("{prefix}.head_shape"), &[0, 0, heads, head_size]);
        let split = format!("{prefix}.split");
        let output = format!("{prefix}.transposed");
        self.graph
            .add_op("Reshape")
            .name(format!("{prefix}/Reshape"))
            .inputs([biased, shape])
            .output(split.as_str())
            .finish();
        self.graph
            .add_op("Transpose")
            .name(format!("{prefix}/Transpose"))
            .input(split)
            .attr("perm", perm)
            .output(output.as_str())
            .finish();
        output
    }

    fn attention(&mut self, layer: &str, x: &str, mask_bias: Option<&str>, heads: i64, irregular: bool) -> String {
        let prefix = format!("{layer}/attention");
        let head_size = self.hidden / heads;
        let qk_head_size = if irregular { head_size / 2 } else { head_size };

        let q = self.heads(&format!("{prefix}/query"), x, heads, qk_head_size, vec![0, 2, 1, 3]);
        let k = self.heads(&format!("{prefix}/key"), x, heads, qk_head_size, vec![0, 2, 3, 1]);
        let v = self.heads(&format!("{prefix}/value"), x, heads, head_size, vec![0, 2, 1, 3]);
        let divisor = self.scalar(&format!("{prefix}.scale_divisor"), (qk_head_size as f32).sqrt());
        let merged_shape = self.shape(&format!("{prefix}.merged_shape"), &[0, 0, self.hidden]);

        let t = |s: &str| format!("{prefix}.{s}");
        let n = |s: &str| format!("{prefix}/{s}");
        let g = &mut self.graph;
        g.add_op("MatMul")
            .name(n("MatMul"))
            .inputs([q, k])
            .output(t("scores"))
            .finish();
        g.add_op("Div")
            .name(n("Div"))
            .inputs([t("scores"), divisor])
            .output(t("scaled_scores"))
            .finish();
        let logits = match mask_bias {
            Some(bias) => {
                g.add_op("Add")
                    .name(n("Add"))
                    .inputs([t("scaled_scores"), bias.to_string()])
                    .output(t("masked_scores"))
                    .finish();
                t("masked_scores")
            }
            None => t("scaled_scores"),
        };
        g.add_op("Softmax")
            .name(n("Softmax"))
            .input(logits)
            .attr("axis", -1i64)
            .output(t("probs"))
            .finish();
        g.add_op("MatMul")
            .name(n("MatMul_1"))
            .inputs([t("probs"), v])
            .output(t("context"))
            .finish();
        g.add_op("Transpose")
            .name(n("Transpose"))
            .input(t("context"))
            .attr("perm", vec![0i64, 2, 1, 3])
            .output(t("context_transposed"))
            .finish();
        g.add_op("Reshape")
            .name(n("Reshape"))
            .inputs([t("context_transposed"), merged_shape])
            .output(t("merged"))
            .finish();

        let h = self.hidden;
        let projected = self.dense(&format!("{layer}/attention/output/dense"), &t("merged"), h, h);
        let residual = format!("{layer}/attention/output.residual");
        self.graph
            .add_op("Add")
            .name(format!("{layer}/attention/output/Add"))
            .inputs([projected.as_str(), x])
            .output(residual.as_str())
            .finish();
        self.layer_norm(&format!("{layer}/attention/output/LayerNorm"), &residual)
    }

    fn feed_forward(&mut self, layer: &str, x: &str, intermediate: i64, form: GeluForm) -> String {
        let h = self.hidden;
        let expanded = self.dense(&format!("{layer}/intermediate/dense"), x, h, intermediate);
        let activated = self.gelu(&format!("{layer}/intermediate/gelu"), &expanded, form);
        let reduced = self.dense(&format!("{layer}/output/dense"), &activated, intermediate, h);
        let residual = format!("{layer}/output.residual");
        self.graph
            .add_op("Add")
            .name(format!("{layer}/output/Add"))
            .inputs([reduced.as_str(), x])
            .output(residual.as_str())
            .finish();
        self.layer_norm(&format!("{layer}/output/LayerNorm"), &residual)
    }

    fn gelu(&mut self, prefix: &str, x: &str, form: GeluForm) -> String {
        let t = |s: &str| format!("{prefix}.{s}");
        let n = |s: &str| format!("{prefix}/{s}");
        let g = &mut self.graph;
        match form {
            GeluForm::Erf => {
                g.add_op("Div")
                    .name(n("Div"))
                    .inputs([x, "const_sqrt_two"])
                    .output(t("scaled"))
                    .finish();
                g.add_op("Erf").name(n("Erf")).input(t("scaled")).output(t("erf")).finish();
                g.add_op("Add")
                    .name(n("Add"))
                    .inputs([t("erf"), "const_one".into()])
                    .output(t("plus_one"))
                    .finish();
            }
            GeluForm::Tanh => {
                g.add_op("Pow")
                    .name(n("Pow"))
                    .inputs([x, "const_three"])
                    .output(t("cubed"))
                    .finish();
                g.add_op("Mul")
                    .name(n("Mul_cubic"))
                    .inputs([t("cubed"), "const_cubic".into()])
                    .output(t("cubic"))
                    .finish();
                g.add_op("Add")
                    .name(n("Add_cubic"))
                    .inputs([x.to_string(), t("cubic")])
                    .output(t("inner"))
                    .finish();
                g.add_op("Mul")
                    .name(n("Mul_scale"))
                    .inputs([t("inner"), "const_sqrt_two_over_pi".into()])
                    .output(t("scaled"))
                    .finish();
                g.add_op("Tanh").name(n("Tanh")).input(t("scaled")).output(t("tanh")).finish();
                g.add_op("Add")
                    .name(n("Add"))
                    .inputs([t("tanh"), "const_one".into()])
                    .output(t("plus_one"))
                    .finish();
            }
        }
        g.add_op("Mul")
            .name(n("Mul"))
            .inputs([x.to_string(), t("plus_one")])
            .output(t("product"))
            .finish();
        g.add_op("Mul")
            .name(n("Mul_1"))
            .inputs([t("product"), "const_half".into()])
            .output(t("output"))
            .finish();
        t("output")
    }

    /// `[0, 0, H]` then `[0, -1, H]`: a pair that collapses into one Reshape
    fn reshape_pair(&mut self, x: &str) -> String {
        let h = self.hidden;
        let first = self.shape("head.reshape_shape", &[0, 0, h]);
        let second = self.shape("head.reshape_shape_1", &[0, -1, h]);
        let g = &mut self.graph;
        g.add_op("Reshape")
            .name("head/Reshape")
            .inputs([x.to_string(), first])
            .output("head.reshaped")
            .finish();
        g.add_op("Reshape")
            .name("head/Reshape_1")
            .inputs(["head.reshaped".to_string(), second])
            .output("head.input")
            .finish();
        "head.input".to_string()
    }

    fn qa_head(&mut self, x: &str) {
        let h = self.hidden;
        let weight = self.weight("qa_outputs.weight", &[h, 2], 0.0, 0.2);
        let bias = self.weight("qa_outputs.bias", &[2], 0.0, 0.1);
        self.graph
            .add_op("MatMul")
            .name("qa_outputs/MatMul")
            .inputs([x.to_string(), weight])
            .output("qa_outputs.projected")
            .finish();
        self.graph
            .add_op("Add")
            .name("qa_outputs/Add")
            .inputs(["qa_outputs.projected".to_string(), bias])
            .output("qa_logits")
            .finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tensor::is_structure_only;

    #[test]
    fn test_default_encoder_shape() {
        let graph = BertGraphBuilder::new().build().unwrap();
        assert_eq!(graph.count_op("Softmax"), 2);
        assert_eq!(graph.count_op("Erf"), 2);
        assert_eq!(graph.count_op("Gather"), 3);
        assert_eq!(graph.graph_inputs().len(), 3);
        assert_eq!(graph.graph_outputs().len(), 2);
        assert_eq!(graph.metadata.onnx_opset(), Some(12));
        assert!(graph.topological_order().is_ok());
    }

    #[test]
    fn test_options_change_structure() {
        let graph = BertGraphBuilder::new()
            .layers(1)
            .mask(false)
            .gelu(GeluForm::Tanh)
            .redundant_reshape(true)
            .build()
            .unwrap();
        assert!(!graph.is_graph_input("attention_mask"));
        assert_eq!(graph.count_op("Tanh"), 1);
        assert_eq!(graph.count_op("Unsqueeze"), 0);
        // one merge per layer, three head splits, and the redundant pair
        assert_eq!(graph.count_op("Reshape"), 6);
    }

    #[test]
    fn test_structure_only_weights() {
        let graph = BertGraphBuilder::new().structure_only(true).build().unwrap();
        let word = graph.initializer("embeddings.word_embeddings.weight").unwrap();
        assert!(is_structure_only(word));
        assert!(!is_structure_only(graph.initializer("position_ids").unwrap()));
    }

    #[test]
    fn test_seeded_weights_are_reproducible() {
        let a = BertGraphBuilder::new().seed(7).build().unwrap();
        let b = BertGraphBuilder::new().seed(7).build().unwrap();
        let c = BertGraphBuilder::new().seed(8).build().unwrap();
        assert!(a.structurally_eq(&b));
        assert!(!a.structurally_eq(&c));
    }

    #[test]
    fn test_rejects_invalid_dimensions() {
        assert!(BertGraphBuilder::new().hidden(10).heads(4).build().is_err());
        assert!(BertGraphBuilder::new().vocab(4).seq_len(4).build().is_err());
        assert!(BertGraphBuilder::new().layers(2).irregular_layer(Some(2)).build().is_err());
    }
}
