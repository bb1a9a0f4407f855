//! Deterministic topological ordering of a [`PlanGraph`].
//!
//! Kahn's algorithm over the nodes reachable from the target. Ready nodes
//! are taken smallest-first by `(host, class order, object id)`; the arena
//! index breaks any remaining tie so identical input always yields an
//! identical order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use fleet_core::ObjectId;

use crate::error::PlanError;
use crate::graph::{NodeIndex, PlanGraph};

type ReadyKey = Reverse<(Option<ObjectId>, u32, Option<ObjectId>, NodeIndex)>;

fn ready_key(graph: &PlanGraph, idx: NodeIndex) -> ReadyKey {
    let node = graph.node(idx);
    Reverse((node.host, node.class_order(), node.object, idx))
}

/// Starting nodes: the root for a full deployment, otherwise every node
/// built from `target`.
fn start_nodes(graph: &PlanGraph, target: Option<ObjectId>) -> Vec<NodeIndex> {
    match target {
        None => vec![graph.root()],
        Some(id) => graph
            .nodes()
            .filter(|(_, n)| n.object == Some(id))
            .map(|(idx, _)| idx)
            .collect(),
    }
}

/// Order every node reachable from `target` (or the root when `None`).
///
/// Returns [`PlanError::Internal`] when some reachable node never becomes
/// ready, which means the graph has a cycle the builder failed to reject.
pub fn order(graph: &PlanGraph, target: Option<ObjectId>) -> Result<Vec<NodeIndex>, PlanError> {
    let mut reachable = vec![false; graph.len()];
    let mut in_degree = vec![0usize; graph.len()];
    let mut stack = start_nodes(graph, target);
    for &idx in &stack {
        reachable[idx] = true;
    }
    while let Some(idx) = stack.pop() {
        for &next in &graph.node(idx).next {
            in_degree[next] += 1;
            if !reachable[next] {
                reachable[next] = true;
                stack.push(next);
            }
        }
    }

    let mut ready: BinaryHeap<ReadyKey> = (0..graph.len())
        .filter(|&idx| reachable[idx] && in_degree[idx] == 0)
        .map(|idx| ready_key(graph, idx))
        .collect();

    let total = reachable.iter().filter(|r| **r).count();
    let mut ordered = Vec::with_capacity(total);
    while let Some(Reverse((_, _, _, idx))) = ready.pop() {
        ordered.push(idx);
        for &next in &graph.node(idx).next {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(ready_key(graph, next));
            }
        }
    }

    if ordered.len() != total {
        let stuck: Vec<String> = (0..graph.len())
            .filter(|&idx| reachable[idx] && in_degree[idx] > 0)
            .map(|idx| graph.node(idx).key.to_string())
            .collect();
        tracing::error!("scheduler stuck on {} node(s)", stuck.len());
        return Err(PlanError::Internal { stuck });
    }

    tracing::debug!("scheduled {} node(s)", ordered.len());
    Ok(ordered)
}
