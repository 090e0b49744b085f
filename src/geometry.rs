use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in top-down pixel space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A user selection on the canvas of the current page.
pub type SelectionRect = Rect;

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle spanned by two arbitrary corners.
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x: x0.min(x1),
            y: y0.min(y1),
            width: (x1 - x0).abs(),
            height: (y1 - y0).abs(),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

/// Area shared by two rectangles; 0 for disjoint or degenerate inputs.
pub fn overlap_area(a: &Rect, b: &Rect) -> f32 {
    let dx = (a.right().min(b.right()) - a.x.max(b.x)).max(0.0);
    let dy = (a.bottom().min(b.bottom()) - a.y.max(b.y)).max(0.0);
    dx * dy
}

/// Fraction of `run` lying inside `selection`. `None` when the run has no area.
pub fn coverage_ratio(selection: &Rect, run: &Rect) -> Option<f32> {
    if run.is_degenerate() {
        return None;
    }

    Some(overlap_area(selection, run) / (run.width * run.height))
}
