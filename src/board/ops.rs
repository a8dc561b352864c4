use super::{
    BoardElement, BoardState, ElementStyle, Point, Viewport, CANVAS_MAX_X, CANVAS_MAX_Y,
    CANVAS_MIN_X, CANVAS_MIN_Y,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignAxis {
    Left,
    Center,
    Right,
    X,
    Top,
    Middle,
    Bottom,
    Y,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributeAxis {
    Horizontal,
    Vertical,
    X,
    Y,
}

impl DistributeAxis {
    fn is_horizontal(self) -> bool {
        matches!(self, Self::Horizontal | Self::X)
    }
}

/// The only write vocabulary for the board. Applied through [`apply_ops`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BoardOp {
    ClearBoard,
    UpsertElement {
        element: BoardElement,
    },
    AppendStrokePoints {
        id: String,
        points: Vec<Point>,
    },
    DeleteElement {
        id: String,
    },
    OffsetElement {
        id: String,
        dx: f64,
        dy: f64,
    },
    SetElementGeometry {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        w: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        h: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        points: Option<Vec<Point>>,
    },
    SetElementStyle {
        id: String,
        style: ElementStyle,
    },
    SetElementText {
        id: String,
        text: String,
    },
    DuplicateElement {
        id: String,
        new_id: String,
        dx: f64,
        dy: f64,
    },
    SetElementZIndex {
        id: String,
        z_index: usize,
    },
    AlignElements {
        ids: Vec<String>,
        axis: AlignAxis,
    },
    DistributeElements {
        ids: Vec<String>,
        axis: DistributeAxis,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gap: Option<f64>,
    },
    SetViewport {
        viewport: Viewport,
    },
    Batch {
        ops: Vec<BoardOp>,
    },
}

impl BoardOp {
    /// Anything other than a viewport move counts as renderable output.
    pub fn is_renderable(&self) -> bool {
        match self {
            Self::SetViewport { .. } => false,
            Self::Batch { ops } => ops.iter().any(BoardOp::is_renderable),
            _ => true,
        }
    }
}

/// Apply a sequence of ops. Each top-level op that actually lands bumps
/// `revision` by one; a `batch` counts as a single op no matter how many
/// nested mutations it carries. Returns the number of revision bumps.
pub fn apply_ops(board: &mut BoardState, ops: &[BoardOp], now: DateTime<Utc>) -> u64 {
    let mut bumps = 0;
    for op in ops {
        if apply_one(board, op) {
            board.revision += 1;
            board.last_updated_at = now;
            bumps += 1;
        }
    }
    bumps
}

fn apply_one(board: &mut BoardState, op: &BoardOp) -> bool {
    match op {
        BoardOp::ClearBoard => {
            let had_any = !board.elements.is_empty();
            board.elements.clear();
            board.order.clear();
            had_any
        }
        BoardOp::UpsertElement { element } => {
            if !element.is_valid() {
                return false;
            }
            if !board.elements.contains_key(&element.id) {
                board.order.push(element.id.clone());
            }
            board.elements.insert(element.id.clone(), element.clone());
            true
        }
        BoardOp::AppendStrokePoints { id, points } => {
            let Some(el) = board.elements.get_mut(id) else {
                return false;
            };
            if !el.kind.is_linear() {
                return false;
            }
            let filtered: Vec<Point> = points
                .iter()
                .copied()
                .filter(|p| p[0].is_finite() && p[1].is_finite())
                .collect();
            if filtered.is_empty() {
                return false;
            }
            el.points.get_or_insert_with(Vec::new).extend(filtered);
            true
        }
        BoardOp::DeleteElement { id } => {
            if board.elements.remove(id).is_none() {
                return false;
            }
            board.order.retain(|other| other != id);
            true
        }
        BoardOp::OffsetElement { id, dx, dy } => {
            if *dx == 0.0 && *dy == 0.0 {
                return false;
            }
            if !dx.is_finite() || !dy.is_finite() {
                return false;
            }
            let Some(el) = board.elements.get_mut(id) else {
                return false;
            };
            el.translate(*dx, *dy);
            true
        }
        BoardOp::SetElementGeometry {
            id,
            x,
            y,
            w,
            h,
            points,
        } => {
            let Some(el) = board.elements.get_mut(id) else {
                return false;
            };
            let mut touched = false;
            if el.kind.is_linear() {
                if let Some(points) = points {
                    el.points = Some(
                        points
                            .iter()
                            .copied()
                            .filter(|p| p[0].is_finite() && p[1].is_finite())
                            .collect(),
                    );
                    touched = true;
                }
            }
            if let Some(x) = x.filter(|v| v.is_finite()) {
                el.x = Some(x);
                touched = true;
            }
            if let Some(y) = y.filter(|v| v.is_finite()) {
                el.y = Some(y);
                touched = true;
            }
            if let Some(w) = w.filter(|v| v.is_finite()) {
                el.w = Some(w);
                touched = true;
            }
            if let Some(h) = h.filter(|v| v.is_finite()) {
                el.h = Some(h);
                touched = true;
            }
            touched
        }
        BoardOp::SetElementStyle { id, style } => {
            let Some(el) = board.elements.get_mut(id) else {
                return false;
            };
            el.style.get_or_insert_with(ElementStyle::default).merge(style);
            true
        }
        BoardOp::SetElementText { id, text } => {
            let Some(el) = board.elements.get_mut(id) else {
                return false;
            };
            match el.kind {
                super::ElementKind::Text | super::ElementKind::Sticky => {
                    el.text = Some(text.clone());
                    true
                }
                super::ElementKind::Frame => {
                    el.title = Some(text.clone());
                    true
                }
                _ => false,
            }
        }
        BoardOp::DuplicateElement { id, new_id, dx, dy } => {
            if new_id.is_empty() || board.elements.contains_key(new_id) {
                return false;
            }
            let Some(source) = board.elements.get(id) else {
                return false;
            };
            let mut clone = source.clone();
            clone.id = new_id.clone();
            clone.translate(*dx, *dy);
            board.order.push(new_id.clone());
            board.elements.insert(new_id.clone(), clone);
            true
        }
        BoardOp::SetElementZIndex { id, z_index } => {
            let Some(current) = board.order.iter().position(|other| other == id) else {
                return false;
            };
            let target = (*z_index).min(board.order.len() - 1);
            if current == target {
                return false;
            }
            let id = board.order.remove(current);
            board.order.insert(target, id);
            true
        }
        BoardOp::AlignElements { ids, axis } => align_elements(board, ids, *axis),
        BoardOp::DistributeElements { ids, axis, gap } => {
            distribute_elements(board, ids, *axis, *gap)
        }
        BoardOp::SetViewport { viewport } => {
            board.viewport = Some(*viewport);
            true
        }
        BoardOp::Batch { ops } => {
            let mut any = false;
            for op in ops {
                any |= apply_one(board, op);
            }
            any
        }
    }
}

/// Bounding boxes of the named ids, tie-broken by lexicographic id order.
fn collect_boxes(board: &BoardState, ids: &[String]) -> Vec<(String, (f64, f64, f64, f64))> {
    let mut boxes: Vec<(String, (f64, f64, f64, f64))> = ids
        .iter()
        .filter_map(|id| {
            board
                .elements
                .get(id)
                .and_then(BoardElement::bbox)
                .map(|bb| (id.clone(), bb))
        })
        .collect();
    boxes.sort_by(|a, b| a.0.cmp(&b.0));
    boxes.dedup_by(|a, b| a.0 == b.0);
    boxes
}

fn align_elements(board: &mut BoardState, ids: &[String], axis: AlignAxis) -> bool {
    let boxes = collect_boxes(board, ids);
    if boxes.len() < 2 {
        return false;
    }

    let min_x = boxes.iter().map(|(_, b)| b.0).fold(f64::INFINITY, f64::min);
    let max_x = boxes.iter().map(|(_, b)| b.2).fold(f64::NEG_INFINITY, f64::max);
    let min_y = boxes.iter().map(|(_, b)| b.1).fold(f64::INFINITY, f64::min);
    let max_y = boxes.iter().map(|(_, b)| b.3).fold(f64::NEG_INFINITY, f64::max);

    let mut moved = false;
    for (id, bb) in &boxes {
        let (dx, dy) = match axis {
            AlignAxis::Left => (min_x - bb.0, 0.0),
            AlignAxis::Right => (max_x - bb.2, 0.0),
            AlignAxis::Center | AlignAxis::X => {
                let reference = (min_x + max_x) / 2.0;
                (reference - (bb.0 + bb.2) / 2.0, 0.0)
            }
            AlignAxis::Top => (0.0, min_y - bb.1),
            AlignAxis::Bottom => (0.0, max_y - bb.3),
            AlignAxis::Middle | AlignAxis::Y => {
                let reference = (min_y + max_y) / 2.0;
                (0.0, reference - (bb.1 + bb.3) / 2.0)
            }
        };
        if dx != 0.0 || dy != 0.0 {
            if let Some(el) = board.elements.get_mut(id) {
                el.translate(dx, dy);
                moved = true;
            }
        }
    }
    moved
}

fn distribute_elements(
    board: &mut BoardState,
    ids: &[String],
    axis: DistributeAxis,
    gap: Option<f64>,
) -> bool {
    let mut boxes = collect_boxes(board, ids);
    if boxes.len() < 3 {
        return false;
    }

    let horizontal = axis.is_horizontal();
    // Sort by axis position; id order breaks positional ties.
    boxes.sort_by(|a, b| {
        let ka = if horizontal { a.1 .0 } else { a.1 .1 };
        let kb = if horizontal { b.1 .0 } else { b.1 .1 };
        ka.partial_cmp(&kb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let size = |bb: &(f64, f64, f64, f64)| {
        if horizontal {
            bb.2 - bb.0
        } else {
            bb.3 - bb.1
        }
    };

    let spacing = match gap.filter(|g| g.is_finite()) {
        Some(gap) => gap,
        None => {
            let first = &boxes[0].1;
            let last = &boxes[boxes.len() - 1].1;
            let span = if horizontal {
                last.2 - first.0
            } else {
                last.3 - first.1
            };
            let total: f64 = boxes.iter().map(|(_, bb)| size(bb)).sum();
            (span - total) / (boxes.len() as f64 - 1.0)
        }
    };

    let mut cursor = if horizontal { boxes[0].1 .0 } else { boxes[0].1 .1 };
    let mut moved = false;
    for (id, bb) in &boxes {
        let current = if horizontal { bb.0 } else { bb.1 };
        let delta = cursor - current;
        if delta != 0.0 {
            if let Some(el) = board.elements.get_mut(id) {
                if horizontal {
                    el.translate(delta, 0.0);
                } else {
                    el.translate(0.0, delta);
                }
                moved = true;
            }
        }
        cursor += size(bb) + spacing;
    }
    moved
}

/// Clamp every element lying fully outside the canvas rectangle back to its
/// nearest boundary. Returns how many elements were adjusted.
pub fn clamp_board_to_canvas_bounds_in_place(board: &mut BoardState) -> usize {
    let mut adjusted = 0;
    let ids: Vec<String> = board.order.clone();
    for id in ids {
        let Some(el) = board.elements.get(&id) else {
            continue;
        };
        let Some(bb) = el.bbox() else {
            continue;
        };
        let fully_outside = bb.2 < CANVAS_MIN_X
            || bb.0 > CANVAS_MAX_X
            || bb.3 < CANVAS_MIN_Y
            || bb.1 > CANVAS_MAX_Y;
        if !fully_outside {
            continue;
        }
        let dx = if bb.2 < CANVAS_MIN_X {
            CANVAS_MIN_X - bb.0
        } else if bb.0 > CANVAS_MAX_X {
            CANVAS_MAX_X - bb.2
        } else {
            0.0
        };
        let dy = if bb.3 < CANVAS_MIN_Y {
            CANVAS_MIN_Y - bb.1
        } else if bb.1 > CANVAS_MAX_Y {
            CANVAS_MAX_Y - bb.3
        } else {
            0.0
        };
        if let Some(el) = board.elements.get_mut(&id) {
            el.translate(dx, dy);
            adjusted += 1;
        }
    }
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::ElementKind;

    fn rect(id: &str, x: f64, y: f64, w: f64, h: f64) -> BoardElement {
        BoardElement {
            id: id.into(),
            kind: ElementKind::Rect,
            x: Some(x),
            y: Some(y),
            w: Some(w),
            h: Some(h),
            text: None,
            title: None,
            points: None,
            style: None,
            created_at: Utc::now(),
            created_by: "ai".into(),
        }
    }

    fn upsert(el: BoardElement) -> BoardOp {
        BoardOp::UpsertElement { element: el }
    }

    fn board_with(elements: Vec<BoardElement>) -> BoardState {
        let mut board = BoardState::new(Utc::now());
        let ops: Vec<BoardOp> = elements.into_iter().map(upsert).collect();
        apply_ops(&mut board, &ops, Utc::now());
        board
    }

    #[test]
    fn upsert_appends_then_replaces_in_place() {
        let mut board = BoardState::new(Utc::now());
        apply_ops(
            &mut board,
            &[
                upsert(rect("a", 0.0, 0.0, 10.0, 10.0)),
                upsert(rect("b", 0.0, 0.0, 10.0, 10.0)),
            ],
            Utc::now(),
        );
        assert_eq!(board.order, vec!["a", "b"]);

        apply_ops(&mut board, &[upsert(rect("a", 99.0, 0.0, 10.0, 10.0))], Utc::now());
        assert_eq!(board.order, vec!["a", "b"]);
        assert_eq!(board.elements["a"].x, Some(99.0));
        assert!(board.is_consistent());
    }

    #[test]
    fn invalid_elements_are_skipped_without_bump() {
        let mut board = BoardState::new(Utc::now());
        let mut bad = rect("a", 0.0, 0.0, 10.0, 10.0);
        bad.w = None;
        let bumps = apply_ops(&mut board, &[upsert(bad)], Utc::now());
        assert_eq!(bumps, 0);
        assert_eq!(board.revision, 0);
        assert!(board.elements.is_empty());
    }

    #[test]
    fn reapplying_identical_ops_is_shape_idempotent_but_bumps_revision() {
        let mut board = BoardState::new(Utc::now());
        let ops = vec![upsert(rect("a", 1.0, 2.0, 10.0, 10.0))];
        apply_ops(&mut board, &ops, Utc::now());
        let snapshot = (board.elements.clone(), board.order.clone());
        let rev = board.revision;

        apply_ops(&mut board, &ops, Utc::now());
        assert_eq!((board.elements.clone(), board.order.clone()), snapshot);
        assert_eq!(board.revision, rev + 1);
    }

    #[test]
    fn batch_bumps_revision_once() {
        let mut board = BoardState::new(Utc::now());
        let bumps = apply_ops(
            &mut board,
            &[BoardOp::Batch {
                ops: vec![
                    upsert(rect("a", 0.0, 0.0, 10.0, 10.0)),
                    upsert(rect("b", 0.0, 0.0, 10.0, 10.0)),
                    BoardOp::DeleteElement { id: "a".into() },
                ],
            }],
            Utc::now(),
        );
        assert_eq!(bumps, 1);
        assert_eq!(board.revision, 1);
        assert_eq!(board.order, vec!["b"]);
    }

    #[test]
    fn delete_removes_from_both_maps() {
        let mut board = board_with(vec![rect("a", 0.0, 0.0, 10.0, 10.0)]);
        apply_ops(&mut board, &[BoardOp::DeleteElement { id: "a".into() }], Utc::now());
        assert!(board.elements.is_empty());
        assert!(board.order.is_empty());
        assert!(board.is_consistent());
    }

    #[test]
    fn append_stroke_points_rejects_boxy_and_filters_nan() {
        let mut board = board_with(vec![rect("r", 0.0, 0.0, 10.0, 10.0)]);
        let stroke = BoardElement {
            id: "s".into(),
            kind: ElementKind::Stroke,
            x: None,
            y: None,
            w: None,
            h: None,
            text: None,
            title: None,
            points: Some(vec![[0.0, 0.0], [1.0, 1.0]]),
            style: None,
            created_at: Utc::now(),
            created_by: "m".into(),
        };
        apply_ops(&mut board, &[upsert(stroke)], Utc::now());

        let bumps = apply_ops(
            &mut board,
            &[
                BoardOp::AppendStrokePoints {
                    id: "r".into(),
                    points: vec![[5.0, 5.0]],
                },
                BoardOp::AppendStrokePoints {
                    id: "s".into(),
                    points: vec![[f64::NAN, 1.0], [2.0, 2.0]],
                },
            ],
            Utc::now(),
        );
        assert_eq!(bumps, 1);
        assert_eq!(board.elements["s"].points.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn offset_zero_is_a_noop() {
        let mut board = board_with(vec![rect("a", 1.0, 1.0, 10.0, 10.0)]);
        let rev = board.revision;
        let bumps = apply_ops(
            &mut board,
            &[BoardOp::OffsetElement {
                id: "a".into(),
                dx: 0.0,
                dy: 0.0,
            }],
            Utc::now(),
        );
        assert_eq!(bumps, 0);
        assert_eq!(board.revision, rev);
    }

    #[test]
    fn set_text_routes_frame_to_title() {
        let frame = BoardElement {
            id: "f".into(),
            kind: ElementKind::Frame,
            x: Some(0.0),
            y: Some(0.0),
            w: Some(100.0),
            h: Some(100.0),
            text: None,
            title: None,
            points: None,
            style: None,
            created_at: Utc::now(),
            created_by: "m".into(),
        };
        let mut board = board_with(vec![frame]);
        apply_ops(
            &mut board,
            &[BoardOp::SetElementText {
                id: "f".into(),
                text: "Sprint plan".into(),
            }],
            Utc::now(),
        );
        assert_eq!(board.elements["f"].title.as_deref(), Some("Sprint plan"));
        assert_eq!(board.elements["f"].text, None);
    }

    #[test]
    fn duplicate_offsets_and_appends() {
        let mut board = board_with(vec![rect("a", 10.0, 10.0, 10.0, 10.0)]);
        apply_ops(
            &mut board,
            &[BoardOp::DuplicateElement {
                id: "a".into(),
                new_id: "a2".into(),
                dx: 20.0,
                dy: 0.0,
            }],
            Utc::now(),
        );
        assert_eq!(board.order, vec!["a", "a2"]);
        assert_eq!(board.elements["a2"].x, Some(30.0));
    }

    #[test]
    fn z_index_moves_to_absolute_rank() {
        let mut board = board_with(vec![
            rect("a", 0.0, 0.0, 1.0, 1.0),
            rect("b", 0.0, 0.0, 1.0, 1.0),
            rect("c", 0.0, 0.0, 1.0, 1.0),
        ]);
        apply_ops(
            &mut board,
            &[BoardOp::SetElementZIndex {
                id: "c".into(),
                z_index: 0,
            }],
            Utc::now(),
        );
        assert_eq!(board.order, vec!["c", "a", "b"]);

        // Rank beyond the end clamps to the top.
        apply_ops(
            &mut board,
            &[BoardOp::SetElementZIndex {
                id: "c".into(),
                z_index: 99,
            }],
            Utc::now(),
        );
        assert_eq!(board.order, vec!["a", "b", "c"]);
    }

    #[test]
    fn align_left_snaps_to_min_edge() {
        let mut board = board_with(vec![
            rect("a", 10.0, 0.0, 10.0, 10.0),
            rect("b", 50.0, 20.0, 10.0, 10.0),
        ]);
        apply_ops(
            &mut board,
            &[BoardOp::AlignElements {
                ids: vec!["a".into(), "b".into()],
                axis: AlignAxis::Left,
            }],
            Utc::now(),
        );
        assert_eq!(board.elements["a"].x, Some(10.0));
        assert_eq!(board.elements["b"].x, Some(10.0));
        // y untouched
        assert_eq!(board.elements["b"].y, Some(20.0));
    }

    #[test]
    fn distribute_requires_three() {
        let mut board = board_with(vec![
            rect("a", 0.0, 0.0, 10.0, 10.0),
            rect("b", 100.0, 0.0, 10.0, 10.0),
        ]);
        let bumps = apply_ops(
            &mut board,
            &[BoardOp::DistributeElements {
                ids: vec!["a".into(), "b".into()],
                axis: DistributeAxis::Horizontal,
                gap: None,
            }],
            Utc::now(),
        );
        assert_eq!(bumps, 0);
    }

    #[test]
    fn distribute_equalizes_gaps() {
        let mut board = board_with(vec![
            rect("a", 0.0, 0.0, 10.0, 10.0),
            rect("b", 15.0, 0.0, 10.0, 10.0),
            rect("c", 90.0, 0.0, 10.0, 10.0),
        ]);
        apply_ops(
            &mut board,
            &[BoardOp::DistributeElements {
                ids: vec!["a".into(), "b".into(), "c".into()],
                axis: DistributeAxis::Horizontal,
                gap: None,
            }],
            Utc::now(),
        );
        // span 0..100, sizes 30 total, two gaps of 35 each
        assert_eq!(board.elements["a"].x, Some(0.0));
        assert_eq!(board.elements["b"].x, Some(45.0));
        assert_eq!(board.elements["c"].x, Some(90.0));
    }

    #[test]
    fn distribute_with_explicit_gap_packs_from_first() {
        let mut board = board_with(vec![
            rect("a", 0.0, 0.0, 10.0, 10.0),
            rect("b", 500.0, 0.0, 10.0, 10.0),
            rect("c", 30.0, 0.0, 10.0, 10.0),
        ]);
        apply_ops(
            &mut board,
            &[BoardOp::DistributeElements {
                ids: vec!["a".into(), "b".into(), "c".into()],
                axis: DistributeAxis::Horizontal,
                gap: Some(5.0),
            }],
            Utc::now(),
        );
        assert_eq!(board.elements["a"].x, Some(0.0));
        assert_eq!(board.elements["c"].x, Some(15.0));
        assert_eq!(board.elements["b"].x, Some(30.0));
    }

    #[test]
    fn clamp_pulls_far_elements_to_boundary() {
        let mut board = board_with(vec![
            rect("in", 100.0, 100.0, 10.0, 10.0),
            rect("out", CANVAS_MAX_X + 500.0, 0.0, 10.0, 10.0),
        ]);
        let adjusted = clamp_board_to_canvas_bounds_in_place(&mut board);
        assert_eq!(adjusted, 1);
        let bb = board.elements["out"].bbox().unwrap();
        assert!(bb.2 <= CANVAS_MAX_X);
        assert_eq!(board.elements["in"].x, Some(100.0));
    }

    #[test]
    fn viewport_is_not_renderable() {
        assert!(!BoardOp::SetViewport {
            viewport: Viewport::default()
        }
        .is_renderable());
        assert!(BoardOp::ClearBoard.is_renderable());
        assert!(!BoardOp::Batch {
            ops: vec![BoardOp::SetViewport {
                viewport: Viewport::default()
            }]
        }
        .is_renderable());
    }

    #[test]
    fn op_wire_format_is_camel_case() {
        let op = BoardOp::UpsertElement {
            element: rect("a", 0.0, 0.0, 10.0, 10.0),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"upsertElement\""));

        let op = BoardOp::SetElementZIndex {
            id: "a".into(),
            z_index: 2,
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"zIndex\":2"));
    }
}
