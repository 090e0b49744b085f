//! One loaded document and the transient state around it.
//!
//! Everything here belongs to a document generation. Loading a new document
//! bumps the generation and replaces the caches wholesale, and every
//! background task checks the generation before it publishes a result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SelectionTuning;
use crate::embedder::Embedder;
use crate::index::{BuildOutcome, SemanticIndex};
use crate::models::PageText;
use crate::render::{PageRenderer, RenderSlot, RenderedPage};
use crate::selection::{extract_selection_text, SelectionState};

/// Text layers of rendered pages, keyed by 1-based page number.
///
/// Entries are written once, on the first render of a page.
#[derive(Clone, Default)]
pub struct PageTextCache {
    pages: Arc<RwLock<HashMap<u32, Arc<PageText>>>>,
}

impl PageTextCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `text` unless the page is already cached.
    pub fn insert_if_absent(&self, page: u32, text: PageText) {
        let mut pages = self.pages.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        pages.entry(page).or_insert_with(|| Arc::new(text));
    }

    pub fn get(&self, page: u32) -> Option<Arc<PageText>> {
        self.pages
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&page)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.pages
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct DocumentSession<R: PageRenderer> {
    renderer: Option<Arc<R>>,
    generation: Arc<AtomicU64>,
    pages: PageTextCache,
    index: SemanticIndex,
    renders: RenderSlot,
    frames: Arc<watch::Sender<Option<Arc<RenderedPage>>>>,
    selection: SelectionState,
    current_page: u32,
    scale: f32,
    excerpt: String,
    tuning: SelectionTuning,
}

impl<R: PageRenderer> DocumentSession<R> {
    pub fn new(tuning: SelectionTuning) -> Self {
        let (frames, _) = watch::channel(None);
        Self {
            renderer: None,
            generation: Arc::new(AtomicU64::new(0)),
            pages: PageTextCache::new(),
            index: SemanticIndex::new(),
            renders: RenderSlot::new(),
            frames: Arc::new(frames),
            selection: SelectionState::default(),
            current_page: 1,
            scale: 1.0,
            excerpt: String::new(),
            tuning,
        }
    }

    /// Replaces the open document and every cache derived from it.
    pub fn load_document(&mut self, renderer: R) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.renders.cancel();
        self.renderer = Some(Arc::new(renderer));
        self.pages = PageTextCache::new();
        self.index.reset(generation);
        self.selection.clear();
        self.excerpt.clear();
        self.current_page = 1;
        self.frames.send_replace(None);

        tracing::info!(generation, pages = self.page_count(), "document loaded");
        generation
    }

    /// Starts rendering `page` at `scale`, cancelling any render in flight.
    ///
    /// Moving to another page or zoom clears the selection. Returns the render
    /// ticket, or `None` when no document is open or the page does not exist.
    pub fn show_page(&mut self, page: u32, scale: f32) -> Option<u64> {
        let renderer = Arc::clone(self.renderer.as_ref()?);
        if page == 0 || page as usize > renderer.page_count() || scale.is_nan() || scale <= 0.0 {
            tracing::warn!(page, scale, "ignoring request for an unrenderable page");
            return None;
        }

        if page != self.current_page || scale != self.scale {
            self.clear_selection();
        }
        self.current_page = page;
        self.scale = scale;

        let pages = self.pages.clone();
        let frames = Arc::clone(&self.frames);
        let generation = Arc::clone(&self.generation);
        let document = generation.load(Ordering::SeqCst);
        let latest = self.renders.latest();

        Some(self.renders.cancel_and_replace(move |ticket| async move {
            let rendered = match renderer.render(page, scale).await {
                Ok(rendered) => rendered,
                Err(err) => {
                    tracing::warn!(page, "render failed: {err:#}");
                    return;
                }
            };

            if generation.load(Ordering::SeqCst) != document {
                tracing::warn!(page, "discarding render of a closed document");
                return;
            }
            pages.insert_if_absent(page, rendered.text.clone());

            if latest.load(Ordering::SeqCst) != ticket {
                tracing::warn!(page, ticket, "discarding superseded render");
                return;
            }
            frames.send_replace(Some(Arc::new(rendered)));
        }))
    }

    /// Waits for the in-flight render and returns the frame on screen.
    pub async fn rendered(&mut self) -> Option<Arc<RenderedPage>> {
        self.renders.wait().await;
        self.frames.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<RenderedPage>>> {
        self.frames.subscribe()
    }

    pub fn pointer_down(&mut self, x: f32, y: f32) {
        self.excerpt.clear();
        self.selection.pointer_down(x, y);
    }

    pub fn pointer_move(&mut self, x: f32, y: f32) {
        self.selection.pointer_move(x, y);
    }

    /// Finalizes the drag and extracts the excerpt under it.
    ///
    /// A page whose text is not cached yet yields an empty excerpt.
    pub fn pointer_up(&mut self, x: f32, y: f32) -> &str {
        let Some(rect) = self.selection.pointer_up(x, y) else {
            return &self.excerpt;
        };

        let page = self
            .pages
            .get(self.current_page)
            .map(|text| PageText {
                runs: text.runs.clone(),
                viewport: text.viewport.at_scale(self.scale),
            });
        self.excerpt = extract_selection_text(&rect, page.as_ref(), &self.tuning);
        tracing::debug!(
            page = self.current_page,
            chars = self.excerpt.chars().count(),
            "selection extracted"
        );
        &self.excerpt
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
        self.excerpt.clear();
    }

    /// Builds the semantic index for the open document in the background.
    ///
    /// Returns `None` when no document is open.
    pub fn spawn_index_build<E>(
        &self,
        embedder: Option<E>,
        target_chars: usize,
    ) -> Option<JoinHandle<BuildOutcome>>
    where
        E: Embedder + 'static,
    {
        let renderer = Arc::clone(self.renderer.as_ref()?);
        let index = self.index.clone();
        let generation = self.generation.load(Ordering::SeqCst);

        Some(tokio::spawn(async move {
            let text = match renderer.document_text().await {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!("document text unavailable, semantic index left empty: {err:#}");
                    return BuildOutcome::Unavailable;
                }
            };
            index
                .build(generation, &text, target_chars, embedder.as_ref())
                .await
        }))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn page_count(&self) -> usize {
        self.renderer.as_ref().map_or(0, |r| r.page_count())
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub fn excerpt(&self) -> &str {
        &self.excerpt
    }

    pub fn index(&self) -> &SemanticIndex {
        &self.index
    }

    pub fn page_text(&self, page: u32) -> Option<Arc<PageText>> {
        self.pages.get(page)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;

    use super::*;
    use crate::models::{TextRun, Viewport};

    /// Page `n` holds one word, "page{n}", at the top left of a 200x200 page.
    struct FakeRenderer {
        pages: usize,
        delay: Duration,
    }

    impl PageRenderer for FakeRenderer {
        fn page_count(&self) -> usize {
            self.pages
        }

        async fn render(&self, page: u32, scale: f32) -> Result<RenderedPage> {
            tokio::time::sleep(self.delay).await;
            Ok(RenderedPage {
                page,
                scale,
                bitmap: vec![],
                text: PageText {
                    runs: vec![TextRun {
                        text: format!("page{page}"),
                        transform: [10.0, 0.0, 0.0, 10.0, 10.0, 180.0],
                        width: 50.0,
                        height: 10.0,
                    }],
                    viewport: Viewport::for_page(200.0, 200.0, scale),
                },
            })
        }

        async fn document_text(&self) -> Result<String> {
            Ok((1..=self.pages).map(|p| format!("page{p}")).collect::<Vec<_>>().join(" "))
        }
    }

    fn renderer(pages: usize, delay_ms: u64) -> FakeRenderer {
        FakeRenderer {
            pages,
            delay: Duration::from_millis(delay_ms),
        }
    }

    fn drag(
        session: &mut DocumentSession<FakeRenderer>,
        from: (f32, f32),
        to: (f32, f32),
    ) -> String {
        session.pointer_down(from.0, from.1);
        session.pointer_move((from.0 + to.0) / 2.0, (from.1 + to.1) / 2.0);
        session.pointer_up(to.0, to.1).to_string()
    }

    #[tokio::test]
    async fn selection_on_rendered_page_extracts_text() {
        let mut session = DocumentSession::new(SelectionTuning::default());
        session.load_document(renderer(2, 0));
        session.show_page(1, 1.0).expect("render");
        let frame = session.rendered().await.expect("frame");
        assert_eq!(frame.page, 1);

        assert_eq!(drag(&mut session, (0.0, 0.0), (100.0, 40.0)), "page1");
        assert_eq!(session.excerpt(), "page1");
    }

    #[tokio::test]
    async fn selection_before_render_is_empty() {
        let mut session = DocumentSession::new(SelectionTuning::default());
        session.load_document(renderer(1, 50));
        session.show_page(1, 1.0);
        assert_eq!(drag(&mut session, (0.0, 0.0), (100.0, 40.0)), "");
    }

    #[tokio::test]
    async fn cached_text_follows_zoom() {
        let mut session = DocumentSession::new(SelectionTuning::default());
        session.load_document(renderer(1, 0));
        session.show_page(1, 1.0);
        session.rendered().await;

        session.show_page(1, 2.0);
        session.rendered().await;
        // At 2x the word spans x 20..120, y 20..40.
        assert_eq!(drag(&mut session, (15.0, 15.0), (125.0, 45.0)), "page1");
        assert_eq!(drag(&mut session, (0.0, 0.0), (15.0, 15.0)), "");
    }

    #[tokio::test]
    async fn page_change_clears_selection_and_cancels_render() {
        let mut session = DocumentSession::new(SelectionTuning::default());
        session.load_document(renderer(3, 0));
        session.show_page(1, 1.0);
        session.rendered().await;
        drag(&mut session, (0.0, 0.0), (100.0, 40.0));
        assert!(session.selection().rect().is_some());

        session.load_document(renderer(3, 30));
        session.show_page(2, 1.0);
        session.show_page(3, 1.0);
        let frame = session.rendered().await.expect("frame");

        assert_eq!(frame.page, 3);
        assert!(session.selection().rect().is_none());
        assert!(session.page_text(2).is_none());
        assert!(session.page_text(3).is_some());
    }

    #[tokio::test]
    async fn new_document_discards_old_caches() {
        let mut session = DocumentSession::new(SelectionTuning::default());
        let first = session.load_document(renderer(1, 0));
        session.show_page(1, 1.0);
        session.rendered().await;
        assert!(session.page_text(1).is_some());

        let second = session.load_document(renderer(1, 0));
        assert!(second > first);
        assert!(session.page_text(1).is_none());
        assert_eq!(session.index().generation(), second);
        assert_eq!(session.excerpt(), "");
    }

    #[tokio::test]
    async fn out_of_range_page_is_ignored() {
        let mut session: DocumentSession<FakeRenderer> =
            DocumentSession::new(SelectionTuning::default());
        assert!(session.show_page(1, 1.0).is_none());
        session.load_document(renderer(2, 0));
        assert!(session.show_page(0, 1.0).is_none());
        assert!(session.show_page(3, 1.0).is_none());
        assert!(session.show_page(1, 0.0).is_none());
    }
}
