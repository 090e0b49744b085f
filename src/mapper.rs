//! Text-run to canvas coordinate mapping.
//!
//! Runs arrive with baseline-anchored, bottom-up transforms. Selections live in
//! top-down canvas pixels at the current zoom, so every run is pushed through
//! the viewport transform before it can be compared with a selection.

use crate::geometry::Rect;
use crate::models::{TextRun, Viewport};

/// Height assumed for runs that report no metrics, in page units.
pub const DEFAULT_RUN_HEIGHT: f32 = 12.0;

/// Affine product `m1 * m2` for `[a, b, c, d, e, f]` matrices.
pub fn multiply(m1: &[f32; 6], m2: &[f32; 6]) -> [f32; 6] {
    [
        m1[0] * m2[0] + m1[2] * m2[1],
        m1[1] * m2[0] + m1[3] * m2[1],
        m1[0] * m2[2] + m1[2] * m2[3],
        m1[1] * m2[2] + m1[3] * m2[3],
        m1[0] * m2[4] + m1[2] * m2[5] + m1[4],
        m1[1] * m2[4] + m1[3] * m2[5] + m1[5],
    ]
}

/// Top-left box of `run` in canvas pixels.
pub fn run_box(run: &TextRun, viewport: &Viewport, fallback_height: f32) -> Rect {
    let combined = multiply(&viewport.transform, &run.transform);
    let metric = if run.height.is_finite() && run.height > 0.0 {
        run.height
    } else {
        fallback_height
    };
    let height = metric * viewport.scale;

    Rect {
        x: combined[4],
        y: combined[5] - height,
        width: run.width * viewport.scale,
        height,
    }
}

/// Font size of a run in page units, read from its own transform.
pub fn font_size(run: &TextRun) -> f32 {
    let size = run.transform[0].hypot(run.transform[1]);
    if size > 0.0 {
        size
    } else {
        run.height.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(x: f32, baseline: f32, size: f32, width: f32) -> TextRun {
        TextRun {
            text: "word".to_string(),
            transform: [size, 0.0, 0.0, size, x, baseline],
            width,
            height: size,
        }
    }

    #[test]
    fn baseline_runs_map_to_top_down_boxes() {
        let viewport = Viewport::for_page(600.0, 800.0, 1.0);
        let mapped = run_box(&run(50.0, 700.0, 10.0, 40.0), &viewport, DEFAULT_RUN_HEIGHT);
        assert_eq!(mapped, Rect::new(50.0, 90.0, 40.0, 10.0));
    }

    #[test]
    fn zoom_scales_every_dimension() {
        let viewport = Viewport::for_page(600.0, 800.0, 2.0);
        let mapped = run_box(&run(50.0, 700.0, 10.0, 40.0), &viewport, DEFAULT_RUN_HEIGHT);
        assert_eq!(mapped, Rect::new(100.0, 180.0, 80.0, 20.0));
    }

    #[test]
    fn missing_height_uses_fallback() {
        let viewport = Viewport::for_page(600.0, 800.0, 1.0);
        let mut item = run(0.0, 780.0, 10.0, 25.0);
        item.height = 0.0;
        let mapped = run_box(&item, &viewport, DEFAULT_RUN_HEIGHT);
        assert_eq!(mapped.height, DEFAULT_RUN_HEIGHT);
        assert_eq!(mapped.y, 20.0 - DEFAULT_RUN_HEIGHT);
    }

    #[test]
    fn font_size_follows_transform_scale() {
        let mut item = run(0.0, 0.0, 14.0, 10.0);
        assert_eq!(font_size(&item), 14.0);
        item.transform = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(font_size(&item), 14.0);
    }
}
