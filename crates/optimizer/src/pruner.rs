// Dead element removal
//
// Walks backward from the declared graph outputs through registered
// producers. Nodes never reached are removed, then initializers, graph
// inputs and value infos nobody refers to. Repeats until a round removes
// nothing, so pruning twice is the same as pruning once.

use std::fmt;

use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::debug;

use crate::graph::{Graph, NodeId};
use crate::passes::OptimizationPass;
use crate::Result;

/// Elements removed by [`prune`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub nodes: usize,
    pub initializers: usize,
    pub inputs: usize,
    pub value_infos: usize,
}

impl PruneStats {
    pub fn total(&self) -> usize {
        self.nodes + self.initializers + self.inputs + self.value_infos
    }

    fn absorb(&mut self, other: PruneStats) {
        self.nodes += other.nodes;
        self.initializers += other.initializers;
        self.inputs += other.inputs;
        self.value_infos += other.value_infos;
    }
}

impl fmt::Display for PruneStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} nodes, {} initializers, {} inputs, {} value infos",
            self.nodes, self.initializers, self.inputs, self.value_infos
        )
    }
}

/// Remove everything that does not contribute to a graph output
pub fn prune(graph: &mut Graph) -> PruneStats {
    let mut stats = PruneStats::default();
    loop {
        let round = prune_once(graph);
        if round.total() == 0 {
            break;
        }
        stats.absorb(round);
    }
    if stats.total() > 0 {
        debug!("pruned {}", stats);
    }
    stats
}

fn prune_once(graph: &mut Graph) -> PruneStats {
    let live = live_nodes(graph);
    let dead: Vec<NodeId> = graph.node_ids().into_iter().filter(|id| !live.contains(id)).collect();

    let mut stats = PruneStats::default();
    for id in dead {
        if graph.remove_node(id).is_some() {
            stats.nodes += 1;
        }
    }

    let referenced: FxHashSet<String> = graph.referenced_tensors().into_iter().map(str::to_string).collect();

    let unused: Vec<String> = graph
        .initializers()
        .keys()
        .filter(|name| !referenced.contains(name.as_str()))
        .cloned()
        .collect();
    for name in &unused {
        graph.remove_initializer(name);
    }
    stats.initializers = unused.len();

    stats.inputs = graph.retain_inputs(|input| referenced.contains(&input.name));

    let produced: FxHashSet<String> = graph
        .nodes()
        .flat_map(|(_, node)| node.outputs.iter().cloned())
        .filter(|name| !name.is_empty())
        .collect();
    stats.value_infos = graph.retain_value_info(|info| produced.contains(&info.name) && referenced.contains(&info.name));

    stats
}

/// Nodes reachable backward from the graph outputs
fn live_nodes(graph: &Graph) -> FxHashSet<NodeId> {
    let mut live = FxHashSet::default();
    let mut stack: Vec<NodeId> = graph
        .graph_outputs()
        .iter()
        .filter_map(|output| graph.producer_node(&output.name))
        .collect();

    while let Some(id) = stack.pop() {
        if !live.insert(id) {
            continue;
        }
        let Some(node) = graph.node(id) else {
            continue;
        };
        stack.extend(
            node.inputs
                .iter()
                .filter(|name| !name.is_empty())
                .filter_map(|name| graph.producer_node(name))
                .filter(|producer| !live.contains(producer)),
        );
    }
    live
}

/// Dead Code Elimination pass
///
/// Removes nodes that are not reachable from any graph output, along with
/// the initializers, inputs and value infos they leave unreferenced.
pub struct DeadCodeElimination;

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &str {
        "DeadCodeElimination"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        Ok(prune(graph).total() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tensor::{float_tensor, value_info};
    use crate::proto::tensor_proto::DataType;

    // x -> Relu -> y (output); x -> Neg -> dead; unused weight and input
    fn graph_with_dead_branch() -> Graph {
        let mut g = Graph::new();
        g.add_input(value_info("x", DataType::Float, &[]));
        g.add_input(value_info("unused_input", DataType::Float, &[]));
        g.add_initializer(float_tensor("w", &[1], &[1.0]));
        g.add_initializer(float_tensor("orphan", &[1], &[2.0]));
        g.add_op("Relu").input("x").output("r").finish();
        g.add_op("Add").inputs(["r", "w"]).output("y").finish();
        g.add_op("Neg").input("x").output("dead").finish();
        g.add_op("Exp").input("dead").output("dead2").finish();
        g.add_value_info(value_info("dead", DataType::Float, &[]));
        g.add_value_info(value_info("r", DataType::Float, &[]));
        g.add_output(value_info("y", DataType::Float, &[]));
        g
    }

    #[test]
    fn test_prune_removes_dead_elements() {
        let mut g = graph_with_dead_branch();
        let stats = prune(&mut g);
        assert_eq!(
            stats,
            PruneStats {
                nodes: 2,
                initializers: 1,
                inputs: 1,
                value_infos: 1,
            }
        );
        assert_eq!(g.node_count(), 2);
        assert!(g.initializer("w").is_some());
        assert!(g.initializer("orphan").is_none());
        assert_eq!(g.graph_inputs().len(), 1);
        assert_eq!(g.value_info().len(), 1);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mut g = graph_with_dead_branch();
        prune(&mut g);
        let snapshot = g.clone();
        assert_eq!(prune(&mut g).total(), 0);
        assert!(g.structurally_eq(&snapshot));
    }

    #[test]
    fn test_dce_empty_graph() {
        let mut graph = Graph::new();
        let dce = DeadCodeElimination;
        let changed = dce.run(&mut graph).unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_taken_over_producer_is_dropped() {
        // A replacement node takes over "y"; the original producer goes away
        let mut g = Graph::new();
        g.add_input(value_info("x", DataType::Float, &[]));
        g.add_op("Neg").input("x").output("n").finish();
        g.add_op("Relu").input("n").output("y").finish();
        g.add_op("Abs").input("x").output("y").finish();
        g.add_output(value_info("y", DataType::Float, &[]));

        let stats = prune(&mut g);
        assert_eq!(stats.nodes, 2);
        assert_eq!(g.count_op("Abs"), 1);
        assert!(g.producer("y").is_some());
    }
}
