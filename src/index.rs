//! In-memory semantic index over one loaded document.
//!
//! The index belongs to a document generation. Chunks are appended in
//! document order as they are embedded, so readers may observe a partial
//! index while a build is running. A reset for a newer generation makes any
//! build still working on the old generation stop and throw its work away.
//! Only the most recently started build may write; an earlier one still
//! running for the same generation is superseded.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::chunker::chunk_text;
use crate::embedder::Embedder;
use crate::models::Chunk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built { chunks: usize },
    /// No embedder, or the embedder failed; the index is left empty.
    Unavailable,
    /// A newer document replaced this one before the build finished.
    Superseded,
}

#[derive(Default)]
struct IndexState {
    generation: u64,
    build: u64,
    chunks: Vec<Chunk>,
}

impl IndexState {
    fn owned_by(&self, generation: u64, build: u64) -> bool {
        self.generation == generation && self.build == build
    }
}

#[derive(Clone, Default)]
pub struct SemanticIndex {
    state: Arc<RwLock<IndexState>>,
}

impl SemanticIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empties the index and binds it to `generation`.
    pub fn reset(&self, generation: u64) {
        let mut state = self.write();
        state.generation = generation;
        state.chunks.clear();
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Copy of the chunks indexed so far, in document order.
    pub fn snapshot(&self) -> Vec<Chunk> {
        self.read().chunks.clone()
    }

    pub fn len(&self) -> usize {
        self.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunks `full_text` and embeds every chunk sequentially.
    ///
    /// Starting a build empties the index, so a rebuild never appends to the
    /// chunks of an earlier one.
    pub async fn build<E: Embedder>(
        &self,
        generation: u64,
        full_text: &str,
        target_chars: usize,
        embedder: Option<&E>,
    ) -> BuildOutcome {
        let build = {
            let mut state = self.write();
            if state.generation != generation {
                return BuildOutcome::Superseded;
            }
            state.build += 1;
            state.chunks.clear();
            state.build
        };

        let Some(embedder) = embedder else {
            tracing::warn!("embedding model unavailable; semantic index left empty");
            return BuildOutcome::Unavailable;
        };

        let texts = chunk_text(full_text, target_chars);
        tracing::info!(generation, chunks = texts.len(), "building semantic index");

        for text in texts {
            if !self.read().owned_by(generation, build) {
                return BuildOutcome::Superseded;
            }

            let embedding = match embedder.embed(&text).await {
                Ok(embedding) => embedding,
                Err(err) => {
                    tracing::warn!("embedding failed, discarding semantic index: {err:#}");
                    let mut state = self.write();
                    if state.owned_by(generation, build) {
                        state.chunks.clear();
                    }
                    return BuildOutcome::Unavailable;
                }
            };

            let mut state = self.write();
            if !state.owned_by(generation, build) {
                return BuildOutcome::Superseded;
            }
            state.chunks.push(Chunk { text, embedding });
        }

        let chunks = {
            let state = self.read();
            if !state.owned_by(generation, build) {
                return BuildOutcome::Superseded;
            }
            state.chunks.len()
        };
        tracing::info!(generation, chunks, "semantic index ready");
        BuildOutcome::Built { chunks }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;

    use super::*;

    struct LengthEmbedder;

    impl Embedder for LengthEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    struct FailingEmbedder {
        calls: AtomicUsize,
    }

    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![1.0, 0.0])
            } else {
                anyhow::bail!("model not loaded")
            }
        }
    }

    /// Hands control back to the runtime before every embedding.
    struct YieldingEmbedder;

    impl Embedder for YieldingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            tokio::task::yield_now().await;
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn long_text() -> String {
        (0..200).map(|n| format!("token{n}")).collect::<Vec<_>>().join(" ")
    }

    #[tokio::test]
    async fn builds_chunks_in_document_order() {
        let index = SemanticIndex::new();
        index.reset(1);
        let outcome = index.build(1, &long_text(), 100, Some(&LengthEmbedder)).await;

        let chunks = index.snapshot();
        assert_eq!(outcome, BuildOutcome::Built { chunks: chunks.len() });
        assert!(chunks.len() > 1);
        assert!(chunks[0].text.starts_with("token0 "));
        assert!(chunks.iter().all(|c| c.embedding.len() == 2));
    }

    #[tokio::test]
    async fn missing_embedder_leaves_index_empty() {
        let index = SemanticIndex::new();
        let outcome = index
            .build::<LengthEmbedder>(0, &long_text(), 100, None)
            .await;
        assert_eq!(outcome, BuildOutcome::Unavailable);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_discards_partial_index() {
        let index = SemanticIndex::new();
        let embedder = FailingEmbedder {
            calls: AtomicUsize::new(0),
        };
        let outcome = index.build(0, &long_text(), 100, Some(&embedder)).await;
        assert_eq!(outcome, BuildOutcome::Unavailable);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn stale_generation_is_superseded() {
        let index = SemanticIndex::new();
        index.reset(2);
        let outcome = index.build(1, &long_text(), 100, Some(&LengthEmbedder)).await;
        assert_eq!(outcome, BuildOutcome::Superseded);
        assert!(index.is_empty());
        assert_eq!(index.generation(), 2);
    }

    #[tokio::test]
    async fn rebuild_replaces_previous_chunks() {
        let index = SemanticIndex::new();
        let first = index.build(0, &long_text(), 100, Some(&LengthEmbedder)).await;
        let second = index.build(0, &long_text(), 100, Some(&LengthEmbedder)).await;

        assert_eq!(first, second);
        assert_eq!(second, BuildOutcome::Built { chunks: index.len() });
    }

    #[tokio::test]
    async fn overlapping_builds_keep_only_the_latest() {
        let index = SemanticIndex::new();
        let text = long_text();
        let (earlier, later) = tokio::join!(
            index.build(0, &text, 100, Some(&YieldingEmbedder)),
            index.build(0, &text, 100, Some(&YieldingEmbedder)),
        );

        assert_eq!(earlier, BuildOutcome::Superseded);
        assert_eq!(later, BuildOutcome::Built { chunks: index.len() });

        let texts: Vec<String> = index.snapshot().into_iter().map(|c| c.text).collect();
        assert_eq!(texts, chunk_text(&text, 100));
    }
}
