//! Rectangle selection over a page's text runs.

use std::cmp::Ordering;

use crate::config::SelectionTuning;
use crate::geometry::{coverage_ratio, Rect, SelectionRect};
use crate::mapper::{font_size, run_box};
use crate::models::PageText;

/// Drag lifecycle of a selection rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum SelectionState {
    #[default]
    Idle,
    Dragging {
        origin: (f32, f32),
        rect: SelectionRect,
    },
    Finalized(SelectionRect),
    Cleared,
}

impl SelectionState {
    /// Starts a new drag, discarding whatever came before.
    pub fn pointer_down(&mut self, x: f32, y: f32) {
        *self = SelectionState::Dragging {
            origin: (x, y),
            rect: Rect::new(x, y, 0.0, 0.0),
        };
    }

    pub fn pointer_move(&mut self, x: f32, y: f32) {
        if let SelectionState::Dragging { origin, rect } = self {
            *rect = Rect::from_corners(origin.0, origin.1, x, y);
        }
    }

    /// Ends the drag. Returns the finished rectangle, or `None` when no drag
    /// was in progress.
    pub fn pointer_up(&mut self, x: f32, y: f32) -> Option<SelectionRect> {
        let SelectionState::Dragging { origin, .. } = *self else {
            return None;
        };

        let rect = Rect::from_corners(origin.0, origin.1, x, y);
        *self = SelectionState::Finalized(rect);
        Some(rect)
    }

    pub fn clear(&mut self) {
        *self = SelectionState::Cleared;
    }

    /// Rectangle to draw: the live one while dragging, or the final one.
    pub fn rect(&self) -> Option<SelectionRect> {
        match self {
            SelectionState::Dragging { rect, .. } | SelectionState::Finalized(rect) => Some(*rect),
            SelectionState::Idle | SelectionState::Cleared => None,
        }
    }
}

struct ScoredTextItem<'a> {
    text: &'a str,
    font_size: f32,
    top: f32,
}

/// Text covered by `selection` on `page`, ordered top to bottom.
///
/// An uncached page or a selection that covers nothing yields an empty string.
pub fn extract_selection_text(
    selection: &SelectionRect,
    page: Option<&PageText>,
    tuning: &SelectionTuning,
) -> String {
    let Some(page) = page else {
        return String::new();
    };
    if selection.is_degenerate() {
        return String::new();
    }

    let mut items: Vec<ScoredTextItem> = page
        .runs
        .iter()
        .filter_map(|run| {
            let bounds = run_box(run, &page.viewport, tuning.fallback_run_height);
            let coverage = coverage_ratio(selection, &bounds)?;
            (coverage >= tuning.coverage_threshold).then(|| ScoredTextItem {
                text: run.text.as_str(),
                font_size: font_size(run),
                top: bounds.y,
            })
        })
        .collect();

    if items.is_empty() {
        return String::new();
    }

    // sort_by is stable, so equal rows keep encounter order.
    items.sort_by(|a, b| a.top.partial_cmp(&b.top).unwrap_or(Ordering::Equal));

    let total = items.len();
    let avg_font_size = items.iter().map(|item| item.font_size).sum::<f32>() / total as f32;
    let heading_cutoff = tuning.heading_size_factor * avg_font_size;
    let heading_count = items
        .iter()
        .filter(|item| item.font_size > heading_cutoff)
        .count();
    let heading_ratio = heading_count as f32 / total as f32;
    let keep_headings =
        heading_ratio > tuning.heading_keep_ratio || total <= tuning.small_selection_max_runs;

    items
        .iter()
        .filter(|item| keep_headings || item.font_size <= heading_cutoff)
        .map(|item| item.text)
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}
