//! AI generations never overwrite prior AI output: existing AI-owned
//! elements shift down one layer, elements past the lower boundary fall off,
//! and incoming op ids are namespaced so layers cannot collide.

use crate::board::{apply_ops, clamp_board_to_canvas_bounds_in_place, BoardOp, BoardState};
use chrono::{DateTime, Utc};
use rand::Rng;

pub const AI_LAYER_SHIFT_Y: f64 = 520.0;
pub const AI_LAYER_BOUNDARY_Y: f64 = 5600.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct StackOutcome {
    pub revision_changed: bool,
    pub renderable: bool,
    pub dropped: usize,
    pub clamped: usize,
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Fresh namespace prefix for one generation's element ids.
pub fn fresh_layer_prefix(now: DateTime<Utc>) -> String {
    let millis = now.timestamp_millis().max(0) as u64;
    let suffix: u32 = rand::thread_rng().gen_range(0..36u32.pow(4));
    format!("layer_{}_{}", base36(millis), base36(u64::from(suffix)))
}

/// Shift every AI-created element down one layer; drop the ones whose
/// shifted geometry sits entirely below the boundary. Returns dropped count.
pub fn shift_ai_layers(board: &mut BoardState) -> usize {
    let ai_ids: Vec<String> = board
        .order
        .iter()
        .filter(|id| {
            board
                .elements
                .get(*id)
                .is_some_and(|el| el.created_by == "ai")
        })
        .cloned()
        .collect();

    let mut dropped = 0;
    for id in ai_ids {
        let Some(el) = board.elements.get_mut(&id) else {
            continue;
        };
        el.translate(0.0, AI_LAYER_SHIFT_Y);
        let past_boundary = el
            .bbox()
            .is_some_and(|(_, min_y, _, _)| min_y > AI_LAYER_BOUNDARY_Y);
        if past_boundary {
            board.elements.remove(&id);
            board.order.retain(|other| other != &id);
            dropped += 1;
        }
    }
    dropped
}

/// Prefix every element id an op touches so a new generation cannot collide
/// with prior layers. AI-issued `clearBoard` is dropped outright; batches
/// are rewritten recursively.
pub fn namespace_ops(ops: &[BoardOp], prefix: &str) -> Vec<BoardOp> {
    let rewrite = |id: &str| format!("{prefix}_{id}");
    ops.iter()
        .filter_map(|op| {
            Some(match op {
                BoardOp::ClearBoard => return None,
                BoardOp::UpsertElement { element } => {
                    let mut element = element.clone();
                    element.id = rewrite(&element.id);
                    BoardOp::UpsertElement { element }
                }
                BoardOp::AppendStrokePoints { id, points } => BoardOp::AppendStrokePoints {
                    id: rewrite(id),
                    points: points.clone(),
                },
                BoardOp::DeleteElement { id } => BoardOp::DeleteElement { id: rewrite(id) },
                BoardOp::OffsetElement { id, dx, dy } => BoardOp::OffsetElement {
                    id: rewrite(id),
                    dx: *dx,
                    dy: *dy,
                },
                BoardOp::SetElementGeometry {
                    id,
                    x,
                    y,
                    w,
                    h,
                    points,
                } => BoardOp::SetElementGeometry {
                    id: rewrite(id),
                    x: *x,
                    y: *y,
                    w: *w,
                    h: *h,
                    points: points.clone(),
                },
                BoardOp::SetElementStyle { id, style } => BoardOp::SetElementStyle {
                    id: rewrite(id),
                    style: style.clone(),
                },
                BoardOp::SetElementText { id, text } => BoardOp::SetElementText {
                    id: rewrite(id),
                    text: text.clone(),
                },
                BoardOp::DuplicateElement { id, new_id, dx, dy } => BoardOp::DuplicateElement {
                    id: rewrite(id),
                    new_id: rewrite(new_id),
                    dx: *dx,
                    dy: *dy,
                },
                BoardOp::SetElementZIndex { id, z_index } => BoardOp::SetElementZIndex {
                    id: rewrite(id),
                    z_index: *z_index,
                },
                BoardOp::AlignElements { ids, axis } => BoardOp::AlignElements {
                    ids: ids.iter().map(|id| rewrite(id)).collect(),
                    axis: *axis,
                },
                BoardOp::DistributeElements { ids, axis, gap } => BoardOp::DistributeElements {
                    ids: ids.iter().map(|id| rewrite(id)).collect(),
                    axis: *axis,
                    gap: *gap,
                },
                BoardOp::SetViewport { viewport } => BoardOp::SetViewport {
                    viewport: *viewport,
                },
                BoardOp::Batch { ops } => BoardOp::Batch {
                    ops: namespace_ops(ops, prefix),
                },
            })
        })
        .collect()
}

/// The full stacking discipline: shift, namespace, apply, clamp.
pub fn stack_ai_ops(board: &mut BoardState, ops: &[BoardOp], now: DateTime<Utc>) -> StackOutcome {
    if ops.is_empty() {
        return StackOutcome::default();
    }

    let dropped = shift_ai_layers(board);
    let prefix = fresh_layer_prefix(now);
    let rewritten = namespace_ops(ops, &prefix);
    let renderable = rewritten.iter().any(BoardOp::is_renderable);

    let revision_before = board.revision;
    apply_ops(board, &rewritten, now);
    let clamped = clamp_board_to_canvas_bounds_in_place(board);

    StackOutcome {
        revision_changed: board.revision != revision_before,
        renderable,
        dropped,
        clamped,
    }
}
