//! Provider patches are scored against the deterministic reference patch and
//! revised toward it when they fall short.

use super::{normalize_label, DiagramPatch, DiagramPatchAction, DiagramType};
use std::collections::HashSet;

/// Weighted score: diagram type 0.4, node coverage 0.35, edge coverage 0.25.
/// Coverage asks how much of the reference the candidate carries.
pub fn score_patch(candidate: &DiagramPatch, reference: &DiagramPatch) -> f64 {
    let type_match = if candidate.diagram_type == reference.diagram_type {
        1.0
    } else {
        0.0
    };

    let candidate_nodes: HashSet<String> = candidate
        .node_labels()
        .iter()
        .map(|l| normalize_label(l))
        .collect();
    let reference_nodes: Vec<String> = reference
        .node_labels()
        .iter()
        .map(|l| normalize_label(l))
        .collect();
    let node_coverage = if reference_nodes.is_empty() {
        1.0
    } else {
        reference_nodes
            .iter()
            .filter(|l| candidate_nodes.contains(*l))
            .count() as f64
            / reference_nodes.len() as f64
    };

    let candidate_edges: HashSet<(String, String)> = candidate
        .edge_endpoints()
        .iter()
        .map(|(f, t)| (normalize_label(f), normalize_label(t)))
        .collect();
    let reference_edges: Vec<(String, String)> = reference
        .edge_endpoints()
        .iter()
        .map(|(f, t)| (normalize_label(f), normalize_label(t)))
        .collect();
    let edge_coverage = if reference_edges.is_empty() {
        1.0
    } else {
        reference_edges
            .iter()
            .filter(|e| candidate_edges.contains(*e))
            .count() as f64
            / reference_edges.len() as f64
    };

    0.4 * type_match + 0.35 * node_coverage + 0.25 * edge_coverage
}

/// Copy reference actions the candidate is missing (by normalized label or
/// endpoint pair) into the candidate.
fn merge_missing(candidate: &mut DiagramPatch, reference: &DiagramPatch) {
    let have_nodes: HashSet<String> = candidate
        .node_labels()
        .iter()
        .map(|l| normalize_label(l))
        .collect();
    let have_edges: HashSet<(String, String)> = candidate
        .edge_endpoints()
        .iter()
        .map(|(f, t)| (normalize_label(f), normalize_label(t)))
        .collect();
    let has_title = candidate
        .actions
        .iter()
        .any(|a| matches!(a, DiagramPatchAction::SetTitle { .. }));
    let has_layout = candidate
        .actions
        .iter()
        .any(|a| matches!(a, DiagramPatchAction::LayoutHint { .. }));

    for action in &reference.actions {
        match action {
            DiagramPatchAction::UpsertNode { label, .. } => {
                if !have_nodes.contains(&normalize_label(label)) {
                    candidate.actions.push(action.clone());
                }
            }
            DiagramPatchAction::UpsertEdge { from, to, .. } => {
                let key = (normalize_label(from), normalize_label(to));
                if !have_edges.contains(&key) {
                    candidate.actions.push(action.clone());
                }
            }
            DiagramPatchAction::SetTitle { .. } if !has_title => {
                candidate.actions.push(action.clone());
            }
            DiagramPatchAction::LayoutHint { .. } if !has_layout => {
                candidate.actions.push(action.clone());
            }
            _ => {}
        }
    }
    candidate.clamp_limits();
}

/// Review a candidate against the reference, revising up to `max_revisions`
/// times: pass 0 merges missing reference actions in, later passes replace
/// the candidate with the reference wholesale. A candidate still below the
/// threshold when revisions run out keeps a conflict note saying so.
///
/// Override rule: when the reference says tree, the candidate disagrees, and
/// the transcript window itself mentions a tree, the candidate is discarded.
pub fn review_and_revise(
    candidate: DiagramPatch,
    reference: &DiagramPatch,
    transcript_window: &str,
    threshold: f64,
    max_revisions: u32,
) -> DiagramPatch {
    if reference.diagram_type == DiagramType::Tree
        && candidate.diagram_type != DiagramType::Tree
        && transcript_window.to_lowercase().contains("tree")
    {
        return reference.clone();
    }

    let mut current = candidate;
    let mut passes: u32 = 0;
    loop {
        let score = score_patch(&current, reference);
        if score >= threshold {
            current.confidence = (current.confidence + 0.1).clamp(0.1, 0.99);
            return current;
        }
        if passes >= max_revisions {
            current.conflicts.push(format!(
                "Review score {}% stayed below {}% after {} pass(es).",
                (score * 100.0).round() as i64,
                (threshold * 100.0).round() as i64,
                passes
            ));
            current.clamp_limits();
            return current;
        }
        if passes == 0 {
            merge_missing(&mut current, reference);
        } else {
            current = reference.clone();
        }
        passes += 1;
    }
}
