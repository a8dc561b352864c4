pub mod builders;
pub mod render;
pub mod review;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Most archived groups a room retains.
pub const MAX_ARCHIVED_GROUPS: usize = 24;
/// Hard cap on `upsertNode` actions in one patch.
pub const MAX_PATCH_NODES: usize = 500;
/// Topics whose token Jaccard similarity falls below this are a shift.
pub const TOPIC_SHIFT_JACCARD: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagramType {
    Flowchart,
    SystemBlocks,
    Tree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutHint {
    #[serde(rename = "tree")]
    Tree,
    #[serde(rename = "left-to-right")]
    LeftToRight,
    #[serde(rename = "top-down")]
    TopDown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramNode {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramEdge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramGroup {
    pub id: String,
    pub topic: String,
    pub diagram_type: DiagramType,
    pub nodes: HashMap<String, DiagramNode>,
    pub edges: HashMap<String, DiagramEdge>,
    pub bounds: FocusBox,
    pub title: String,
    pub notes: Vec<String>,
    pub highlight_order: Vec<String>,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiagramGroup {
    pub fn new(id: String, topic: String, diagram_type: DiagramType, now: DateTime<Utc>) -> Self {
        Self {
            id,
            topic,
            diagram_type,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            bounds: FocusBox::default(),
            title: String::new(),
            notes: Vec::new(),
            highlight_order: Vec::new(),
            pinned: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute `bounds` from node geometry.
    pub fn recompute_bounds(&mut self) {
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for node in self.nodes.values() {
            min_x = min_x.min(node.x);
            min_y = min_y.min(node.y);
            max_x = max_x.max(node.x + node.width);
            max_y = max_y.max(node.y + node.height);
        }
        self.bounds = if self.nodes.is_empty() {
            FocusBox::default()
        } else {
            FocusBox {
                x: min_x,
                y: min_y,
                w: max_x - min_x,
                h: max_y - min_y,
            }
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DiagramPatchAction {
    UpsertNode {
        id: String,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<f64>,
    },
    UpsertEdge {
        id: String,
        from: String,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    DeleteShape {
        id: String,
    },
    SetTitle {
        title: String,
    },
    SetNotes {
        notes: Vec<String>,
    },
    HighlightOrder {
        order: Vec<String>,
    },
    LayoutHint {
        hint: LayoutHint,
    },
}

/// A structural patch produced by the deterministic engine or coerced from a
/// provider response; rendered into board ops before display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramPatch {
    pub topic: String,
    pub diagram_type: DiagramType,
    pub confidence: f64,
    pub actions: Vec<DiagramPatchAction>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_group_id: Option<String>,
}

impl DiagramPatch {
    /// Enforce the patch limits: nodes ≤ 500, questions/conflicts ≤ 2,
    /// confidence within [0.1, 0.99].
    pub fn clamp_limits(&mut self) {
        self.confidence = self.confidence.clamp(0.1, 0.99);
        self.open_questions.truncate(2);
        self.conflicts.truncate(2);

        let mut node_count = 0usize;
        self.actions.retain(|action| {
            if matches!(action, DiagramPatchAction::UpsertNode { .. }) {
                node_count += 1;
                node_count <= MAX_PATCH_NODES
            } else {
                true
            }
        });
    }

    pub fn node_labels(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                DiagramPatchAction::UpsertNode { label, .. } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn edge_endpoints(&self) -> Vec<(&str, &str)> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                DiagramPatchAction::UpsertEdge { from, to, .. } => {
                    Some((from.as_str(), to.as_str()))
                }
                _ => None,
            })
            .collect()
    }

    /// Ids this patch writes (nodes and edges).
    pub fn upserted_ids(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                DiagramPatchAction::UpsertNode { id, .. }
                | DiagramPatchAction::UpsertEdge { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Lowercase, non-alphanumeric to space, collapse runs.
pub fn normalize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_space = true;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Apply a patch's actions to a group. Returns ids deleted so the renderer
/// can mirror removals onto the board.
pub fn apply_patch_to_group(
    group: &mut DiagramGroup,
    patch: &DiagramPatch,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut deleted = Vec::new();
    for action in &patch.actions {
        match action {
            DiagramPatchAction::UpsertNode {
                id,
                label,
                x,
                y,
                width,
                height,
            } => {
                let existing = group.nodes.get(id);
                let node = DiagramNode {
                    x: x.or(existing.map(|n| n.x)).unwrap_or(0.0),
                    y: y.or(existing.map(|n| n.y)).unwrap_or(0.0),
                    width: width.or(existing.map(|n| n.width)).unwrap_or(140.0),
                    height: height.or(existing.map(|n| n.height)).unwrap_or(64.0),
                    label: label.clone(),
                };
                group.nodes.insert(id.clone(), node);
            }
            DiagramPatchAction::UpsertEdge { id, from, to, label } => {
                group.edges.insert(
                    id.clone(),
                    DiagramEdge {
                        from: from.clone(),
                        to: to.clone(),
                        label: label.clone(),
                    },
                );
            }
            DiagramPatchAction::DeleteShape { id } => {
                let removed_node = group.nodes.remove(id).is_some();
                let removed_edge = group.edges.remove(id).is_some();
                if removed_node || removed_edge {
                    deleted.push(id.clone());
                }
            }
            DiagramPatchAction::SetTitle { title } => group.title = title.clone(),
            DiagramPatchAction::SetNotes { notes } => group.notes = notes.clone(),
            DiagramPatchAction::HighlightOrder { order } => {
                group.highlight_order = order.clone();
            }
            DiagramPatchAction::LayoutHint { .. } => {}
        }
    }
    group.topic = patch.topic.clone();
    group.diagram_type = patch.diagram_type;
    group.updated_at = now;
    group.recompute_bounds();
    deleted
}

/// `deleteShape` for every existing shape the incoming patch does not carry,
/// so the board stays current when the conversation moves on.
pub fn cleanup_actions(group: &DiagramGroup, patch: &DiagramPatch) -> Vec<DiagramPatchAction> {
    if group.pinned {
        return Vec::new();
    }
    let incoming: std::collections::HashSet<&str> = patch.upserted_ids().into_iter().collect();
    let mut stale: Vec<String> = group
        .nodes
        .keys()
        .chain(group.edges.keys())
        .filter(|id| !incoming.contains(id.as_str()))
        .cloned()
        .collect();
    stale.sort();
    stale
        .into_iter()
        .map(|id| DiagramPatchAction::DeleteShape { id })
        .collect()
}

/// Different diagram type, or topic similarity below the Jaccard floor.
pub fn is_topic_shift(group: &DiagramGroup, patch: &DiagramPatch) -> bool {
    if group.nodes.is_empty() {
        return false;
    }
    if group.diagram_type != patch.diagram_type {
        return true;
    }
    jaccard(&group.topic, &patch.topic) < TOPIC_SHIFT_JACCARD
}

fn jaccard(a: &str, b: &str) -> f64 {
    let na = normalize_label(a);
    let nb = normalize_label(b);
    let ta: std::collections::HashSet<&str> = na.split_whitespace().collect();
    let tb: std::collections::HashSet<&str> = nb.split_whitespace().collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let inter = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Clone of an archived group rewritten for restoration: fresh id, pinned,
/// `[Restored] ` title prefix, fresh timestamps. Bounds are recomputed.
pub fn restored_clone(source: &DiagramGroup, new_id: String, now: DateTime<Utc>) -> DiagramGroup {
    let mut restored = source.clone();
    restored.id = new_id;
    restored.pinned = true;
    restored.title = format!("[Restored] {}", source.title);
    restored.created_at = now;
    restored.updated_at = now;
    restored.recompute_bounds();
    restored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch_with(actions: Vec<DiagramPatchAction>) -> DiagramPatch {
        DiagramPatch {
            topic: "orders".into(),
            diagram_type: DiagramType::SystemBlocks,
            confidence: 0.5,
            actions,
            open_questions: Vec::new(),
            conflicts: Vec::new(),
            target_group_id: None,
        }
    }

    fn node(id: &str, label: &str) -> DiagramPatchAction {
        DiagramPatchAction::UpsertNode {
            id: id.into(),
            label: label.into(),
            x: Some(0.0),
            y: Some(0.0),
            width: Some(100.0),
            height: Some(50.0),
        }
    }

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize_label("API-Gateway (v2)"), "api gateway v2");
        assert_eq!(normalize_label("  lots   of  spaces "), "lots of spaces");
    }

    #[test]
    fn clamp_limits_enforces_caps() {
        let mut actions: Vec<DiagramPatchAction> = (0..MAX_PATCH_NODES + 40)
            .map(|i| node(&format!("n{i}"), "x"))
            .collect();
        actions.push(DiagramPatchAction::SetTitle {
            title: "kept".into(),
        });
        let mut patch = patch_with(actions);
        patch.confidence = 7.0;
        patch.open_questions = vec!["a".into(), "b".into(), "c".into()];
        patch.clamp_limits();

        assert!((patch.confidence - 0.99).abs() < f64::EPSILON);
        assert_eq!(patch.open_questions.len(), 2);
        assert_eq!(patch.node_labels().len(), MAX_PATCH_NODES);
        // Non-node actions survive the cap.
        assert!(patch
            .actions
            .iter()
            .any(|a| matches!(a, DiagramPatchAction::SetTitle { .. })));
    }

    #[test]
    fn apply_patch_upserts_and_deletes() {
        let now = Utc::now();
        let mut group = DiagramGroup::new("g1".into(), "orders".into(), DiagramType::SystemBlocks, now);
        apply_patch_to_group(&mut group, &patch_with(vec![node("a", "Client")]), now);
        assert_eq!(group.nodes.len(), 1);

        let deleted = apply_patch_to_group(
            &mut group,
            &patch_with(vec![DiagramPatchAction::DeleteShape { id: "a".into() }]),
            now,
        );
        assert_eq!(deleted, vec!["a"]);
        assert!(group.nodes.is_empty());
    }

    #[test]
    fn upsert_node_keeps_existing_geometry_when_unspecified() {
        let now = Utc::now();
        let mut group = DiagramGroup::new("g1".into(), "t".into(), DiagramType::Tree, now);
        apply_patch_to_group(&mut group, &patch_with(vec![node("a", "Root")]), now);
        apply_patch_to_group(
            &mut group,
            &patch_with(vec![DiagramPatchAction::UpsertNode {
                id: "a".into(),
                label: "Root 2".into(),
                x: None,
                y: None,
                width: None,
                height: None,
            }]),
            now,
        );
        let n = &group.nodes["a"];
        assert_eq!(n.label, "Root 2");
        assert_eq!(n.width, 100.0);
    }

    #[test]
    fn cleanup_deletes_absent_shapes_but_respects_pin() {
        let now = Utc::now();
        let mut group = DiagramGroup::new("g1".into(), "t".into(), DiagramType::SystemBlocks, now);
        apply_patch_to_group(&mut group, &patch_with(vec![node("a", "A"), node("b", "B")]), now);

        let incoming = patch_with(vec![node("a", "A")]);
        let cleanup = cleanup_actions(&group, &incoming);
        assert_eq!(
            cleanup,
            vec![DiagramPatchAction::DeleteShape { id: "b".into() }]
        );

        group.pinned = true;
        assert!(cleanup_actions(&group, &incoming).is_empty());
    }

    #[test]
    fn topic_shift_on_type_change_or_low_jaccard() {
        let now = Utc::now();
        let mut group = DiagramGroup::new("g".into(), "order checkout flow".into(), DiagramType::SystemBlocks, now);
        apply_patch_to_group(&mut group, &patch_with(vec![node("a", "A")]), now);

        let mut patch = patch_with(vec![node("z", "Z")]);
        patch.topic = "order checkout flow".into();
        assert!(!is_topic_shift(&group, &patch));

        patch.diagram_type = DiagramType::Tree;
        assert!(is_topic_shift(&group, &patch));

        patch.diagram_type = DiagramType::SystemBlocks;
        patch.topic = "garden irrigation".into();
        assert!(is_topic_shift(&group, &patch));
    }

    #[test]
    fn restored_clone_rewrites_identity_fields() {
        let now = Utc::now();
        let mut group = DiagramGroup::new("g".into(), "t".into(), DiagramType::Tree, now);
        group.title = "Sprint".into();
        apply_patch_to_group(&mut group, &patch_with(vec![node("a", "A")]), now);

        let later = now + chrono::Duration::seconds(5);
        let restored = restored_clone(&group, "g2".into(), later);
        assert_eq!(restored.id, "g2");
        assert!(restored.pinned);
        assert_eq!(restored.title, "[Restored] Sprint");
        assert_eq!(restored.nodes, group.nodes);
        assert_eq!(restored.created_at, later);
    }

    #[test]
    fn patch_action_wire_format() {
        let action = DiagramPatchAction::LayoutHint {
            hint: LayoutHint::LeftToRight,
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"layoutHint\""));
        assert!(json.contains("left-to-right"));
    }
}
