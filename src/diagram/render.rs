//! Translate a diagram group into board ops. Element ids are namespaced by
//! group so diagram renders never collide with free-form board content.

use super::DiagramGroup;
use crate::board::{BoardElement, BoardOp, ElementKind, ElementStyle};
use chrono::{DateTime, Utc};

fn node_element_id(group_id: &str, shape_id: &str) -> String {
    format!("dg_{group_id}_{shape_id}")
}

fn edge_label_id(group_id: &str, shape_id: &str) -> String {
    format!("dg_{group_id}_{shape_id}_label")
}

fn boxy(
    id: String,
    kind: ElementKind,
    x: f64,
    y: f64,
    w: f64,
    h: f64,
    text: Option<String>,
    now: DateTime<Utc>,
) -> BoardElement {
    BoardElement {
        id,
        kind,
        x: Some(x),
        y: Some(y),
        w: Some(w),
        h: Some(h),
        text,
        title: None,
        points: None,
        style: None,
        created_at: now,
        created_by: "ai".into(),
    }
}

/// Regenerate the full set of board ops for a group, plus deletes mirroring
/// shapes a patch removed. Re-upserting by stable id keeps the render
/// idempotent across patches.
pub fn render_group(
    group: &DiagramGroup,
    deleted_shape_ids: &[String],
    now: DateTime<Utc>,
) -> Vec<BoardOp> {
    let mut ops = Vec::new();

    for shape_id in deleted_shape_ids {
        ops.push(BoardOp::DeleteElement {
            id: node_element_id(&group.id, shape_id),
        });
        ops.push(BoardOp::DeleteElement {
            id: edge_label_id(&group.id, shape_id),
        });
    }

    if !group.title.is_empty() {
        let mut title = boxy(
            node_element_id(&group.id, "title"),
            ElementKind::Text,
            group.bounds.x,
            group.bounds.y - 48.0,
            0.0,
            0.0,
            Some(group.title.clone()),
            now,
        );
        title.w = None;
        title.h = None;
        title.style = Some(ElementStyle {
            font_size: Some(28.0),
            ..Default::default()
        });
        ops.push(BoardOp::UpsertElement { element: title });
    }

    // Highlight position, when present, becomes a numeric label prefix.
    let highlight_rank = |shape_id: &str| -> Option<usize> {
        group
            .highlight_order
            .iter()
            .position(|other| other == shape_id)
    };

    let mut node_ids: Vec<&String> = group.nodes.keys().collect();
    node_ids.sort();
    for shape_id in node_ids {
        let node = &group.nodes[shape_id];
        let label = match highlight_rank(shape_id) {
            Some(rank) => format!("{}. {}", rank + 1, node.label),
            None => node.label.clone(),
        };
        ops.push(BoardOp::UpsertElement {
            element: boxy(
                node_element_id(&group.id, shape_id),
                ElementKind::Rect,
                node.x,
                node.y,
                node.width,
                node.height,
                Some(label),
                now,
            ),
        });
    }

    let mut edge_ids: Vec<&String> = group.edges.keys().collect();
    edge_ids.sort();
    for shape_id in edge_ids {
        let edge = &group.edges[shape_id];
        let (Some(from), Some(to)) = (group.nodes.get(&edge.from), group.nodes.get(&edge.to))
        else {
            continue;
        };
        let from_center = [from.x + from.width / 2.0, from.y + from.height / 2.0];
        let to_center = [to.x + to.width / 2.0, to.y + to.height / 2.0];
        ops.push(BoardOp::UpsertElement {
            element: BoardElement {
                id: node_element_id(&group.id, shape_id),
                kind: ElementKind::Arrow,
                x: None,
                y: None,
                w: None,
                h: None,
                text: None,
                title: None,
                points: Some(vec![from_center, to_center]),
                style: None,
                created_at: now,
                created_by: "ai".into(),
            },
        });
        if let Some(label) = &edge.label {
            let mut text = boxy(
                edge_label_id(&group.id, shape_id),
                ElementKind::Text,
                (from_center[0] + to_center[0]) / 2.0,
                (from_center[1] + to_center[1]) / 2.0 - 24.0,
                0.0,
                0.0,
                Some(label.clone()),
                now,
            );
            text.w = None;
            text.h = None;
            ops.push(BoardOp::UpsertElement { element: text });
        }
    }

    if !group.notes.is_empty() {
        let mut notes = boxy(
            node_element_id(&group.id, "notes"),
            ElementKind::Text,
            group.bounds.x,
            group.bounds.y + group.bounds.h + 32.0,
            0.0,
            0.0,
            Some(group.notes.join("\n")),
            now,
        );
        notes.w = None;
        notes.h = None;
        ops.push(BoardOp::UpsertElement { element: notes });
    }

    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{apply_ops, BoardState};
    use crate::diagram::{apply_patch_to_group, builders, DiagramType};

    #[test]
    fn render_produces_applyable_ops() {
        let now = Utc::now();
        let mut group =
            DiagramGroup::new("g1".into(), "flow".into(), DiagramType::SystemBlocks, now);
        let patch = builders::build_system_blocks_patch("client -> api -> postgres");
        apply_patch_to_group(&mut group, &patch, now);

        let ops = render_group(&group, &[], now);
        let mut board = BoardState::new(now);
        apply_ops(&mut board, &ops, now);

        // Three rects, two arrows, two edge labels, one title.
        assert_eq!(board.elements.len(), 8);
        assert!(board.is_consistent());
    }

    #[test]
    fn deleted_shapes_are_mirrored_as_deletes() {
        let now = Utc::now();
        let group = DiagramGroup::new("g1".into(), "t".into(), DiagramType::Tree, now);
        let ops = render_group(&group, &["node_a".into()], now);
        assert!(ops.iter().any(|op| matches!(
            op,
            BoardOp::DeleteElement { id } if id == "dg_g1_node_a"
        )));
    }

    #[test]
    fn highlight_order_prefixes_labels() {
        let now = Utc::now();
        let mut group = DiagramGroup::new("g1".into(), "t".into(), DiagramType::Tree, now);
        let patch = builders::build_tree_patch("root A. A has B and C. preorder traversal please");
        apply_patch_to_group(&mut group, &patch, now);

        let ops = render_group(&group, &[], now);
        let labels: Vec<String> = ops
            .iter()
            .filter_map(|op| match op {
                BoardOp::UpsertElement { element } if element.kind == ElementKind::Rect => {
                    element.text.clone()
                }
                _ => None,
            })
            .collect();
        assert!(labels.iter().any(|l| l.starts_with("1. ")));
        assert!(labels.iter().any(|l| l.starts_with("3. ")));
    }

    #[test]
    fn edges_with_missing_endpoints_are_skipped() {
        let now = Utc::now();
        let mut group = DiagramGroup::new("g1".into(), "t".into(), DiagramType::Tree, now);
        group.edges.insert(
            "dangling".into(),
            crate::diagram::DiagramEdge {
                from: "ghost".into(),
                to: "nowhere".into(),
                label: None,
            },
        );
        let ops = render_group(&group, &[], now);
        assert!(ops.is_empty());
    }
}
