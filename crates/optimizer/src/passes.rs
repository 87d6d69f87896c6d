// Graph optimization passes
//
// A pass is one composable rewrite over the graph. Fusion passes and dead
// code elimination both implement the trait; the pipeline runs them in a
// fixed order and records per-pass statistics.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::graph::Graph;
use crate::Result;

/// Optimization pass trait
///
/// Each optimization pass implements this trait to provide a
/// composable transformation on the graph.
pub trait OptimizationPass {
    /// Get the name of this pass (for logging/debugging)
    fn name(&self) -> &str;

    /// Run the optimization pass on the graph
    ///
    /// Returns `true` if the graph was modified, `false` otherwise.
    fn run(&self, graph: &mut Graph) -> Result<bool>;
}

/// Statistics for a single pass execution
#[derive(Debug, Clone, Serialize)]
pub struct PassStats {
    pub pass_name: String,
    pub changed: bool,
    /// Fused nodes inserted by the pass
    pub fused: usize,
    /// Elements removed by the prune that followed the pass
    pub pruned: usize,
    pub nodes_before: usize,
    pub nodes_after: usize,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

/// Overall optimization statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizationStats {
    pub initial_nodes: usize,
    pub final_nodes: usize,
    pub initial_edges: usize,
    pub final_edges: usize,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub pass_stats: Vec<PassStats>,
}

impl OptimizationStats {
    pub fn nodes_removed(&self) -> usize {
        self.initial_nodes.saturating_sub(self.final_nodes)
    }
}

impl fmt::Display for OptimizationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Optimization Statistics:")?;
        writeln!(
            f,
            "  Nodes: {} → {} (removed {})",
            self.initial_nodes,
            self.final_nodes,
            self.nodes_removed()
        )?;
        writeln!(f, "  Edges: {} → {}", self.initial_edges, self.final_edges)?;
        writeln!(f, "  Total time: {:?}", self.duration)?;
        for pass in &self.pass_stats {
            writeln!(
                f,
                "    {:<26} fused {:>4}  pruned {:>5}  {:?}",
                pass.pass_name, pass.fused, pass.pruned, pass.duration
            )?;
        }
        Ok(())
    }
}

fn serialize_duration<S: serde::Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}
