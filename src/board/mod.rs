pub mod ops;

pub use ops::{apply_ops, clamp_board_to_canvas_bounds_in_place, BoardOp};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canvas rectangle elements are clamped into after AI patches.
pub const CANVAS_MIN_X: f64 = -2000.0;
pub const CANVAS_MAX_X: f64 = 14000.0;
pub const CANVAS_MIN_Y: f64 = -2000.0;
pub const CANVAS_MAX_Y: f64 = 20000.0;

pub type Point = [f64; 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Text,
    Rect,
    Ellipse,
    Diamond,
    Triangle,
    Sticky,
    Frame,
    Stroke,
    Line,
    Arrow,
}

impl ElementKind {
    /// Geometry is a point list rather than an x/y/w/h box.
    pub fn is_linear(self) -> bool {
        matches!(self, Self::Stroke | Self::Line | Self::Arrow)
    }

    pub fn is_boxy(self) -> bool {
        matches!(
            self,
            Self::Rect | Self::Ellipse | Self::Diamond | Self::Triangle | Self::Sticky | Self::Frame
        )
    }

    /// Shapes that read as a visual anchor for auto-labeling.
    pub fn is_filled_shape(self) -> bool {
        self.is_boxy()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementStyle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roughness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
}

impl ElementStyle {
    /// Shallow-merge a patch into this style. Numeric fields only land when
    /// finite; color strings are taken as-is.
    pub fn merge(&mut self, patch: &ElementStyle) {
        if let Some(stroke) = &patch.stroke {
            self.stroke = Some(stroke.clone());
        }
        if let Some(fill) = &patch.fill {
            self.fill = Some(fill.clone());
        }
        if let Some(width) = patch.width.filter(|v| v.is_finite()) {
            self.width = Some(width);
        }
        if let Some(roughness) = patch.roughness.filter(|v| v.is_finite()) {
            self.roughness = Some(roughness);
        }
        if let Some(font_size) = patch.font_size.filter(|v| v.is_finite()) {
            self.font_size = Some(font_size);
        }
    }
}

/// One drawable on the whiteboard. Geometry fields are optional because
/// AI-coerced payloads arrive partially specified; the reducer validates
/// per-kind requirements before admitting an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardElement {
    pub id: String,
    pub kind: ElementKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<ElementStyle>,
    pub created_at: DateTime<Utc>,
    /// `"ai"` or a member id.
    pub created_by: String,
}

impl BoardElement {
    /// Required fields present for this element's kind.
    pub fn is_valid(&self) -> bool {
        if self.id.is_empty() {
            return false;
        }
        match self.kind {
            ElementKind::Text => {
                self.x.is_some_and(f64::is_finite)
                    && self.y.is_some_and(f64::is_finite)
                    && self.text.is_some()
            }
            k if k.is_boxy() => {
                self.x.is_some_and(f64::is_finite)
                    && self.y.is_some_and(f64::is_finite)
                    && self.w.is_some_and(|v| v.is_finite() && v > 0.0)
                    && self.h.is_some_and(|v| v.is_finite() && v > 0.0)
            }
            _ => self
                .points
                .as_ref()
                .is_some_and(|pts| pts.len() >= 2 && pts.iter().all(|p| p[0].is_finite() && p[1].is_finite())),
        }
    }

    /// Axis-aligned bounding box, `(min_x, min_y, max_x, max_y)`.
    pub fn bbox(&self) -> Option<(f64, f64, f64, f64)> {
        if self.kind.is_linear() {
            let pts = self.points.as_ref()?;
            let mut iter = pts.iter().filter(|p| p[0].is_finite() && p[1].is_finite());
            let first = iter.next()?;
            let mut bb = (first[0], first[1], first[0], first[1]);
            for p in iter {
                bb.0 = bb.0.min(p[0]);
                bb.1 = bb.1.min(p[1]);
                bb.2 = bb.2.max(p[0]);
                bb.3 = bb.3.max(p[1]);
            }
            Some(bb)
        } else {
            let x = self.x?;
            let y = self.y?;
            let w = self.w.unwrap_or(0.0).max(0.0);
            let h = self.h.unwrap_or(0.0).max(0.0);
            Some((x, y, x + w, y + h))
        }
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        if self.kind.is_linear() {
            if let Some(points) = &mut self.points {
                for p in points {
                    p[0] += dx;
                    p[1] += dy;
                }
            }
        } else {
            if let Some(x) = &mut self.x {
                *x += dx;
            }
            if let Some(y) = &mut self.y {
                *y += dy;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
}

/// The whiteboard. `order` is paint order (earlier = back) and contains
/// each element id exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardState {
    pub elements: HashMap<String, BoardElement>,
    pub order: Vec<String>,
    pub revision: u64,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

impl BoardState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            elements: HashMap::new(),
            order: Vec::new(),
            revision: 0,
            last_updated_at: now,
            viewport: None,
        }
    }

    /// `order` and `elements` agree: same ids, no duplicates.
    pub fn is_consistent(&self) -> bool {
        if self.order.len() != self.elements.len() {
            return false;
        }
        let mut seen = std::collections::HashSet::new();
        self.order
            .iter()
            .all(|id| self.elements.contains_key(id) && seen.insert(id))
    }

    /// Ids of elements in paint order.
    pub fn ordered_ids(&self) -> &[String] {
        &self.order
    }
}
