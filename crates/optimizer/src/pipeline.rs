//! Optimization pipeline
//!
//! ```text
//! ONNX bytes
//!     ↓
//! 1. Load & validate → Graph
//!     ↓
//! 2. Per fusion kind: match → fuse → prune
//!     ↓
//! 3. Report → fused-operator counts vs. expected
//!     ↓
//! 4. Save → ONNX bytes
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bert_fusion_optimizer::{OptimizationOptions, Optimizer};
//!
//! let optimizer = Optimizer::new(OptimizationOptions {
//!     num_heads: Some(12),
//!     hidden_size: Some(768),
//!     ..Default::default()
//! });
//!
//! let outcome = optimizer.optimize_file("model.onnx", "model.opt.onnx")?;
//! println!("{}", outcome.report);
//! # Ok::<(), bert_fusion_optimizer::OptimizerError>(())
//! ```

use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::ModelType;
use crate::fusion::{FusionContext, FusionKind, FusionPass};
use crate::graph::{self, Graph};
use crate::passes::{OptimizationStats, PassStats};
use crate::pruner::prune;
use crate::report::{ExpectedCounts, FusionCounts, Report};
use crate::Result;

/// Options controlling one optimization run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizationOptions {
    pub model_type: ModelType,
    /// Declared head count, `None` to infer from reshape targets
    pub num_heads: Option<usize>,
    /// Declared hidden size, `None` to infer from weight shapes
    pub hidden_size: Option<usize>,
    /// Declared encoder depth, `None` to count Softmax nodes
    pub num_layers: Option<usize>,
    /// Fusion kinds to skip
    pub disabled: Vec<FusionKind>,
}

impl Default for OptimizationOptions {
    fn default() -> Self {
        Self {
            model_type: ModelType::Bert,
            num_heads: None,
            hidden_size: None,
            num_layers: None,
            disabled: Vec::new(),
        }
    }
}

impl OptimizationOptions {
    pub fn context(&self) -> FusionContext {
        FusionContext {
            num_heads: self.num_heads,
            hidden_size: self.hidden_size,
        }
    }

    /// Fusion kinds that will run, in pipeline order
    pub fn enabled(&self) -> impl Iterator<Item = FusionKind> + '_ {
        FusionKind::ALL.into_iter().filter(|k| !self.disabled.contains(k))
    }
}

/// Report and per-pass statistics of one run
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    pub report: Report,
    pub stats: OptimizationStats,
}

/// Fusion pipeline driver
pub struct Optimizer {
    options: OptimizationOptions,
    verbose: bool,
}

impl Optimizer {
    pub fn new(options: OptimizationOptions) -> Self {
        Self {
            options,
            verbose: false,
        }
    }

    /// Log every pass summary at info level instead of debug
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn options(&self) -> &OptimizationOptions {
        &self.options
    }

    /// Run every enabled fusion pass over `graph`, pruning after each.
    ///
    /// Recorded fusion failures do not stop the pipeline; a fatal failure
    /// only aborts the pass that raised it.
    pub fn optimize_graph(&self, graph: &mut Graph) -> Result<OptimizationOutcome> {
        let start = Instant::now();
        let initial = graph.statistics();

        // Leave only what the declared outputs need before counting layers
        let initial_prune = prune(graph);
        if initial_prune.total() > 0 {
            debug!("Initial prune removed {}", initial_prune);
        }

        let layers = self.options.num_layers.unwrap_or_else(|| graph.count_op("Softmax"));
        let expected = match self.options.model_type {
            ModelType::Bert => Some(ExpectedCounts::for_layers(layers)),
            ModelType::Generic => None,
        };
        info!(
            "Optimizing {} nodes ({} model, {} layers)",
            initial.total_nodes, self.options.model_type, layers
        );

        let context = self.options.context();
        let mut pass_stats = Vec::new();
        let mut failures = Vec::new();

        for kind in self.options.enabled() {
            let pass_start = Instant::now();
            let nodes_before = graph.node_count();

            let pass = FusionPass::new(kind.fusion(), context.clone());
            let outcome = pass.apply(graph);
            let pruned = prune(graph);

            if outcome.aborted {
                warn!("{} pass aborted after {} fusions", kind, outcome.applied);
            }
            let stats = PassStats {
                pass_name: kind.name().to_string(),
                changed: outcome.applied > 0 || pruned.total() > 0,
                fused: outcome.applied,
                pruned: pruned.total(),
                nodes_before,
                nodes_after: graph.node_count(),
                duration: pass_start.elapsed(),
            };
            if self.verbose {
                info!(
                    "  {}: fused {}, pruned {} ({} → {} nodes) in {:?}",
                    stats.pass_name, stats.fused, stats.pruned, stats.nodes_before, stats.nodes_after, stats.duration
                );
            } else {
                debug!(
                    "  {}: fused {}, pruned {} in {:?}",
                    stats.pass_name, stats.fused, stats.pruned, stats.duration
                );
            }
            pass_stats.push(stats);
            failures.extend(outcome.failures);
        }

        // The graph must still serialize in a valid order
        graph.topological_order()?;

        let report = Report::summarize(FusionCounts::from_graph(graph), expected, failures);
        let final_stats = graph.statistics();
        let stats = OptimizationStats {
            initial_nodes: initial.total_nodes,
            final_nodes: final_stats.total_nodes,
            initial_edges: initial.total_edges,
            final_edges: final_stats.total_edges,
            duration: start.elapsed(),
            pass_stats,
        };

        info!(
            "Optimization complete: {} → {} nodes in {:?} (fully optimized: {})",
            stats.initial_nodes, stats.final_nodes, stats.duration, report.fully_optimized
        );
        Ok(OptimizationOutcome { report, stats })
    }

    /// Optimize a serialized model, returning the new bytes
    pub fn optimize_bytes(&self, bytes: &[u8]) -> Result<(Vec<u8>, OptimizationOutcome)> {
        let mut graph = graph::load(bytes)?;
        let outcome = self.optimize_graph(&mut graph)?;
        Ok((graph::save(&graph)?, outcome))
    }

    /// Optimize `input_path` into `output_path`.
    ///
    /// The input is fully loaded and validated before anything is written,
    /// so a malformed model never produces an output file.
    pub fn optimize_file(
        &self,
        input_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> Result<OptimizationOutcome> {
        let load_start = Instant::now();
        let mut graph = graph::load_file(input_path.as_ref())?;
        info!(
            "Loaded {} ({} nodes) in {:?}",
            input_path.as_ref().display(),
            graph.node_count(),
            load_start.elapsed()
        );

        let outcome = self.optimize_graph(&mut graph)?;

        graph::save_file(&graph, output_path.as_ref())?;
        info!("Wrote {}", output_path.as_ref().display());
        Ok(outcome)
    }
}

/// Optimize a model file with default options.
///
/// `num_heads` and `hidden_size` of 0 mean "infer from the graph".
pub fn optimize(
    input_path: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    model_type: ModelType,
    num_heads: usize,
    hidden_size: usize,
) -> Result<Report> {
    let options = OptimizationOptions {
        model_type,
        num_heads: (num_heads > 0).then_some(num_heads),
        hidden_size: (hidden_size > 0).then_some(hidden_size),
        ..Default::default()
    };
    Ok(Optimizer::new(options).optimize_file(input_path, output_path)?.report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportKind;
    use crate::synthetic::BertGraphBuilder;

    #[test]
    fn test_small_encoder_fully_optimized() {
        let mut graph = BertGraphBuilder::new().layers(2).build().unwrap();
        let outcome = Optimizer::new(OptimizationOptions::default())
            .optimize_graph(&mut graph)
            .unwrap();

        let report = &outcome.report;
        assert!(report.fully_optimized, "{report}");
        assert_eq!(report.counts.attention, 2);
        assert_eq!(report.counts.embed_layer_norm, 1);
        assert_eq!(report.counts.gelu, 2);
        assert_eq!(report.counts.skip_layer_norm, 4);
        assert!(report.failures.is_empty());
        assert_eq!(outcome.stats.pass_stats.len(), FusionKind::ALL.len());
        assert!(outcome.stats.final_nodes < outcome.stats.initial_nodes);
    }

    #[test]
    fn test_disabled_fusion_leaves_deficit() {
        let mut graph = BertGraphBuilder::new().layers(2).build().unwrap();
        let options = OptimizationOptions {
            disabled: vec![FusionKind::Gelu],
            ..Default::default()
        };
        let outcome = Optimizer::new(options).optimize_graph(&mut graph).unwrap();

        assert!(!outcome.report.fully_optimized);
        assert_eq!(outcome.report.deficits.len(), 1);
        assert_eq!(outcome.report.deficits[0].kind, ReportKind::Gelu);
        assert_eq!(outcome.stats.pass_stats.len(), FusionKind::ALL.len() - 1);
    }

    #[test]
    fn test_generic_model_has_no_expectation() {
        let mut graph = BertGraphBuilder::new().layers(1).build().unwrap();
        let options = OptimizationOptions {
            model_type: ModelType::Generic,
            ..Default::default()
        };
        let outcome = Optimizer::new(options).optimize_graph(&mut graph).unwrap();
        assert!(outcome.report.expected.is_none());
        assert!(!outcome.report.fully_optimized);
        assert_eq!(outcome.report.counts.attention, 1);
    }

    #[test]
    fn test_declared_layers_override_softmax_count() {
        let mut graph = BertGraphBuilder::new().layers(2).build().unwrap();
        let options = OptimizationOptions {
            num_layers: Some(3),
            ..Default::default()
        };
        let outcome = Optimizer::new(options).optimize_graph(&mut graph).unwrap();
        assert!(!outcome.report.fully_optimized);
        assert_eq!(outcome.report.expected.map(|e| e.layers), Some(3));
    }

    #[test]
    fn test_dead_softmax_not_counted_as_layer() {
        let mut graph = BertGraphBuilder::new().layers(2).build().unwrap();
        graph.add_op("Softmax").input("input_ids").output("unused_probs").finish();

        let outcome = Optimizer::new(OptimizationOptions::default())
            .optimize_graph(&mut graph)
            .unwrap();
        assert_eq!(outcome.report.expected.map(|e| e.layers), Some(2));
        assert!(outcome.report.fully_optimized, "{}", outcome.report);
    }

    #[test]
    fn test_optimize_bytes_round_trip() {
        let graph = BertGraphBuilder::new().layers(1).build().unwrap();
        let bytes = graph::save(&graph).unwrap();
        let (optimized, outcome) = Optimizer::new(OptimizationOptions::default())
            .optimize_bytes(&bytes)
            .unwrap();
        assert!(outcome.report.fully_optimized);

        let reloaded = graph::load(&optimized).unwrap();
        assert_eq!(FusionCounts::from_graph(&reloaded), outcome.report.counts);
    }
}
