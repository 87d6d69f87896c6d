//! Parent-path pattern matching.
//!
//! A [`Pattern`] is an anchor op type plus a list of parent paths walked
//! upstream from the anchor (or from a node an earlier path matched). Each
//! step names the op type the producer must have and which input slot to
//! follow; a step with no slot tries every input in order and backtracks on
//! failure. Pass-through ops such as `Identity` between steps are skipped
//! and become part of the span.
//!
//! Matching only reads the graph. [`find`] resolves overlapping candidates
//! deterministically: longest span first, ties broken by earliest start.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::{Graph, NodeId};

/// Ops that may sit between two pattern steps without changing semantics
pub const DEFAULT_PASS_THROUGH: &[&str] = &["Identity"];

/// At most this many consecutive pass-through nodes are skipped per step
pub const MAX_CONSECUTIVE_SKIPS: usize = 2;

/// One upstream hop: the producer of the chosen input must be `op_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    pub op_type: &'static str,
    /// Input slot to follow; `None` tries every slot
    pub input: Option<usize>,
}

impl PathStep {
    pub const fn at(op_type: &'static str, input: usize) -> Self {
        Self {
            op_type,
            input: Some(input),
        }
    }

    pub const fn any(op_type: &'static str) -> Self {
        Self { op_type, input: None }
    }
}

/// Where a parent path starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOrigin {
    Anchor,
    /// The node matched by `step` of an earlier `path`
    Node { path: usize, step: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentPath {
    pub from: PathOrigin,
    pub steps: Vec<PathStep>,
}

/// A fusion motif
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub name: &'static str,
    pub anchor: &'static str,
    pub paths: Vec<ParentPath>,
    pub pass_through: &'static [&'static str],
}

impl Pattern {
    pub fn new(name: &'static str, anchor: &'static str) -> Self {
        Self {
            name,
            anchor,
            paths: Vec::new(),
            pass_through: DEFAULT_PASS_THROUGH,
        }
    }

    /// Add a path starting at the anchor
    pub fn path(mut self, steps: impl Into<Vec<PathStep>>) -> Self {
        self.paths.push(ParentPath {
            from: PathOrigin::Anchor,
            steps: steps.into(),
        });
        self
    }

    /// Add a path starting at a node matched by an earlier path
    pub fn path_from(mut self, path: usize, step: usize, steps: impl Into<Vec<PathStep>>) -> Self {
        debug_assert!(path < self.paths.len(), "path origin must refer to an earlier path");
        self.paths.push(ParentPath {
            from: PathOrigin::Node { path, step },
            steps: steps.into(),
        });
        self
    }
}

/// A successful match of one pattern at one anchor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub pattern: &'static str,
    pub anchor: NodeId,
    /// Nodes matched by each path, in step order
    pub paths: Vec<Vec<NodeId>>,
    /// Pass-through nodes skipped while walking
    pub skipped: Vec<NodeId>,
    /// Every matched and skipped node plus the anchor, by topological rank
    pub span: Vec<NodeId>,
    start_rank: usize,
    anchor_rank: usize,
}

impl Match {
    /// Node matched by `step` of `path`
    pub fn node(&self, path: usize, step: usize) -> NodeId {
        self.paths[path][step]
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.span.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.span.len()
    }

    pub fn is_empty(&self) -> bool {
        self.span.is_empty()
    }

    /// Rank of the earliest node in the span
    pub fn start_rank(&self) -> usize {
        self.start_rank
    }

    pub fn anchor_rank(&self) -> usize {
        self.anchor_rank
    }
}

/// Every anchor in topological order, first successful match per anchor
pub fn candidates(graph: &Graph, pattern: &Pattern) -> Vec<Match> {
    let order = graph.topological_order().unwrap_or_else(|_| graph.node_ids());
    let ranks: FxHashMap<NodeId, usize> = order.iter().enumerate().map(|(r, &id)| (id, r)).collect();

    order
        .iter()
        .filter(|&&id| graph.node(id).is_some_and(|n| n.op_type == pattern.anchor))
        .filter_map(|&anchor| match_at(graph, pattern, anchor, &ranks))
        .collect()
}

/// Non-overlapping matches of `pattern`, returned in node order
pub fn find(graph: &Graph, pattern: &Pattern) -> Vec<Match> {
    select_non_overlapping(candidates(graph, pattern))
}

/// Greedy resolution of overlapping candidates: longest span first, ties
/// broken by earliest start rank, then by anchor rank. The accepted set is
/// returned ordered by anchor rank.
pub fn select_non_overlapping(mut matches: Vec<Match>) -> Vec<Match> {
    matches.sort_by(|a, b| {
        b.len()
            .cmp(&a.len())
            .then(a.start_rank.cmp(&b.start_rank))
            .then(a.anchor_rank.cmp(&b.anchor_rank))
    });

    let mut claimed: FxHashSet<NodeId> = FxHashSet::default();
    let mut accepted = Vec::new();
    for m in matches {
        if m.span.iter().any(|id| claimed.contains(id)) {
            continue;
        }
        claimed.extend(m.span.iter().copied());
        accepted.push(m);
    }
    accepted.sort_by_key(|m| m.anchor_rank);
    accepted
}

/// Walk one parent path from `node`, returning the first solution as
/// (matched nodes, skipped nodes)
pub fn match_parent_path(
    graph: &Graph,
    node: NodeId,
    steps: &[PathStep],
    pass_through: &[&str],
) -> Option<(Vec<NodeId>, Vec<NodeId>)> {
    let mut solutions = Vec::new();
    walk(graph, node, steps, pass_through, &FxHashSet::default(), &mut Vec::new(), &mut Vec::new(), &mut solutions, true);
    solutions.into_iter().next()
}

fn match_at(graph: &Graph, pattern: &Pattern, anchor: NodeId, ranks: &FxHashMap<NodeId, usize>) -> Option<Match> {
    let mut used: FxHashSet<NodeId> = FxHashSet::default();
    used.insert(anchor);
    let mut paths = Vec::with_capacity(pattern.paths.len());
    let mut skipped = Vec::new();

    if !match_paths(graph, pattern, anchor, 0, &mut used, &mut paths, &mut skipped) {
        return None;
    }

    let mut span: Vec<NodeId> = used.into_iter().collect();
    span.sort_by_key(|id| ranks.get(id).copied().unwrap_or(usize::MAX));
    let start_rank = span.first().and_then(|id| ranks.get(id)).copied().unwrap_or(0);

    Some(Match {
        pattern: pattern.name,
        anchor,
        paths,
        skipped,
        span,
        start_rank,
        anchor_rank: ranks.get(&anchor).copied().unwrap_or(0),
    })
}

/// Depth-first over paths; later paths failing backtrack earlier choices
fn match_paths(
    graph: &Graph,
    pattern: &Pattern,
    anchor: NodeId,
    index: usize,
    used: &mut FxHashSet<NodeId>,
    paths: &mut Vec<Vec<NodeId>>,
    skipped: &mut Vec<NodeId>,
) -> bool {
    let Some(path) = pattern.paths.get(index) else {
        return true;
    };
    let start = match path.from {
        PathOrigin::Anchor => anchor,
        PathOrigin::Node { path, step } => match paths.get(path).and_then(|p| p.get(step)) {
            Some(&id) => id,
            None => return false,
        },
    };

    let mut solutions = Vec::new();
    walk(
        graph,
        start,
        &path.steps,
        pattern.pass_through,
        used,
        &mut Vec::new(),
        &mut Vec::new(),
        &mut solutions,
        false,
    );

    for (nodes, skips) in solutions {
        used.extend(nodes.iter().chain(&skips).copied());
        paths.push(nodes.clone());
        let skipped_before = skipped.len();
        skipped.extend(skips.iter().copied());

        if match_paths(graph, pattern, anchor, index + 1, used, paths, skipped) {
            return true;
        }

        skipped.truncate(skipped_before);
        paths.pop();
        for id in nodes.iter().chain(&skips) {
            used.remove(id);
        }
    }
    false
}

/// Enumerate solutions of `steps` from `current` in slot order
#[allow(clippy::too_many_arguments)]
fn walk(
    graph: &Graph,
    current: NodeId,
    steps: &[PathStep],
    pass_through: &[&str],
    used: &FxHashSet<NodeId>,
    nodes: &mut Vec<NodeId>,
    skips: &mut Vec<NodeId>,
    solutions: &mut Vec<(Vec<NodeId>, Vec<NodeId>)>,
    first_only: bool,
) {
    let Some((step, rest)) = steps.split_first() else {
        solutions.push((nodes.clone(), skips.clone()));
        return;
    };
    let Some(node) = graph.node(current) else {
        return;
    };

    let slots: Vec<usize> = match step.input {
        Some(slot) => vec![slot],
        None => (0..node.inputs.len()).collect(),
    };

    for slot in slots {
        if first_only && !solutions.is_empty() {
            return;
        }
        let Some(tensor) = node.input(slot) else {
            continue;
        };
        let Some((parent, passed)) = resolve_parent(graph, tensor, step.op_type, pass_through) else {
            continue;
        };
        if used.contains(&parent)
            || nodes.contains(&parent)
            || passed.iter().any(|id| used.contains(id) || skips.contains(id))
        {
            continue;
        }

        nodes.push(parent);
        let skips_before = skips.len();
        skips.extend(passed);
        walk(graph, parent, rest, pass_through, used, nodes, skips, solutions, first_only);
        skips.truncate(skips_before);
        nodes.pop();
    }
}

/// Producer of `tensor` with op type `op_type`, skipping at most
/// [`MAX_CONSECUTIVE_SKIPS`] pass-through nodes
fn resolve_parent(graph: &Graph, tensor: &str, op_type: &str, pass_through: &[&str]) -> Option<(NodeId, Vec<NodeId>)> {
    let mut passed = Vec::new();
    let mut tensor = tensor.to_string();
    loop {
        let id = graph.producer_node(&tensor)?;
        let node = graph.node(id)?;
        if node.op_type == op_type {
            return Some((id, passed));
        }
        if !pass_through.contains(&node.op_type.as_str()) || passed.len() == MAX_CONSECUTIVE_SKIPS {
            return None;
        }
        passed.push(id);
        tensor = node.input(0)?.to_string();
    }
}
