//! Ancestry checks inside the CD subtree of a workflow

use std::collections::{HashSet, VecDeque};

use super::workflow::{NodeId, PipelineKind, WorkflowGraph};

/// Returns true iff `ancestor` is reachable from `descendant` by walking
/// parent edges between CD nodes, and the two nodes differ.
///
/// Producer nodes never take part: an edge into or out of the root is not
/// followed. Callers handle a producer source separately.
pub fn is_proper_ancestor(graph: &WorkflowGraph, ancestor: NodeId, descendant: NodeId) -> bool {
    if ancestor == descendant {
        return false;
    }
    if graph.node_kind(ancestor) != PipelineKind::Cd
        || graph.node_kind(descendant) != PipelineKind::Cd
    {
        return false;
    }

    let mut seen = HashSet::from([descendant]);
    let mut queue = VecDeque::from([descendant]);
    while let Some(current) = queue.pop_front() {
        for &parent in graph.parents_of(current) {
            if graph.node_kind(parent) != PipelineKind::Cd {
                continue;
            }
            if parent == ancestor {
                return true;
            }
            if seen.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    false
}
