use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::config::RetrievalTuning;
use crate::embedder::Embedder;
use crate::index::SemanticIndex;
use crate::models::{Chunk, ScoredChunk};

/// Cosine of the angle between `a` and `b`; 0 when either has no magnitude
/// or the dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }

    dot / denominator
}

/// Excerpt text with its embedding.
pub struct ExcerptSignal<'a> {
    pub text: &'a str,
    pub embedding: &'a [f32],
}

/// Merges question and excerpt similarity into one ranking.
///
/// Every chunk starts with its question score. With an excerpt, the score
/// becomes `max(question, excerpt * selection_boost)`. Results are sorted
/// descending with ties in document order; the chunk equal to the excerpt is
/// skipped and at most `top_k` distinct texts are returned.
pub fn rank_supplementary(
    chunks: &[Chunk],
    question: &[f32],
    excerpt: Option<&ExcerptSignal<'_>>,
    tuning: &RetrievalTuning,
) -> Vec<ScoredChunk> {
    let mut best: HashMap<&str, f32> = HashMap::with_capacity(chunks.len());
    for chunk in chunks {
        let score = cosine_similarity(question, &chunk.embedding);
        best.entry(chunk.text.as_str())
            .and_modify(|current| *current = current.max(score))
            .or_insert(score);
    }

    if let Some(excerpt) = excerpt {
        for chunk in chunks {
            let boosted =
                cosine_similarity(excerpt.embedding, &chunk.embedding) * tuning.selection_boost;
            if let Some(current) = best.get_mut(chunk.text.as_str()) {
                *current = current.max(boosted);
            }
        }
    }

    let mut ranked: Vec<(&str, f32)> = chunks
        .iter()
        .map(|chunk| (chunk.text.as_str(), best.get(chunk.text.as_str()).copied().unwrap_or(0.0)))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let excerpt_text = excerpt.map(|e| e.text);
    let mut seen = HashSet::new();
    ranked
        .into_iter()
        .filter(|(text, _)| Some(*text) != excerpt_text)
        .filter(|(text, _)| seen.insert(*text))
        .take(tuning.top_k)
        .map(|(text, score)| ScoredChunk {
            text: text.to_string(),
            score,
        })
        .collect()
}

/// Looks up supplementary context for a question against the current index.
#[derive(Clone)]
pub struct Retriever<E> {
    embedder: Option<E>,
    tuning: RetrievalTuning,
}

impl<E: Embedder> Retriever<E> {
    /// `embedder` is `None` while the embedding model is not initialized.
    pub fn new(embedder: Option<E>, tuning: RetrievalTuning) -> Self {
        Self { embedder, tuning }
    }

    pub fn tuning(&self) -> &RetrievalTuning {
        &self.tuning
    }

    /// Ranks whatever the index holds right now. Missing embeddings or an
    /// empty index mean "no supplementary context", never an error.
    pub async fn retrieve(
        &self,
        question: &str,
        excerpt: &str,
        index: &SemanticIndex,
    ) -> Vec<ScoredChunk> {
        let chunks = index.snapshot();
        if chunks.is_empty() {
            return vec![];
        }
        let Some(embedder) = &self.embedder else {
            return vec![];
        };

        let question_vec = match embedder.embed(question).await {
            Ok(vector) => vector,
            Err(err) => {
                tracing::warn!(
                    "question embedding failed, skipping supplementary context: {err:#}"
                );
                return vec![];
            }
        };

        let excerpt = excerpt.trim();
        let excerpt_vec = if excerpt.is_empty() {
            None
        } else {
            match embedder.embed(excerpt).await {
                Ok(vector) => Some(vector),
                Err(err) => {
                    tracing::warn!("excerpt embedding failed, ranking by question only: {err:#}");
                    None
                }
            }
        };

        let signal = excerpt_vec.as_deref().map(|embedding| ExcerptSignal {
            text: excerpt,
            embedding,
        });
        let ranked = rank_supplementary(&chunks, &question_vec, signal.as_ref(), &self.tuning);
        tracing::debug!(
            candidates = chunks.len(),
            returned = ranked.len(),
            "ranked supplementary context"
        );
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, embedding: &[f32]) -> Chunk {
        Chunk {
            text: text.to_string(),
            embedding: embedding.to_vec(),
        }
    }

    #[test]
    fn self_similarity_is_one() {
        let v: [f32; 4] = [0.3, -1.2, 4.0, 0.01];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_similarity_is_zero() {
        let score = cosine_similarity(&[1.0, 2.0], &[0.0, 0.0]);
        assert_eq!(score, 0.0);
        assert!(!score.is_nan());
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn question_only_ranking_keeps_document_order_on_ties() {
        let chunks = vec![
            chunk("a", &[1.0, 0.0]),
            chunk("b", &[0.0, 1.0]),
            chunk("c", &[1.0, 0.0]),
            chunk("d", &[0.7, 0.7]),
        ];
        let ranked = rank_supplementary(&chunks, &[1.0, 0.0], None, &RetrievalTuning::default());
        let texts: Vec<&str> = ranked.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "c", "d"]);
    }

    #[test]
    fn excerpt_similarity_gets_priority() {
        let chunks = vec![
            chunk("about the question", &[1.0, 0.0]),
            chunk("about the excerpt", &[0.0, 1.0]),
        ];
        let excerpt = ExcerptSignal {
            text: "highlighted",
            embedding: &[0.0, 1.0],
        };
        let tuning = RetrievalTuning::default();
        let ranked = rank_supplementary(&chunks, &[1.0, 0.0], Some(&excerpt), &tuning);
        assert_eq!(ranked[0].text, "about the excerpt");
        assert!((ranked[0].score - 1.1).abs() < 1e-6);
        assert!((ranked[1].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn excerpt_chunk_is_never_returned() {
        let chunks = vec![
            chunk("the excerpt itself", &[0.0, 1.0]),
            chunk("neighbour", &[0.2, 0.9]),
            chunk("far away", &[1.0, 0.0]),
        ];
        let excerpt = ExcerptSignal {
            text: "the excerpt itself",
            embedding: &[0.0, 1.0],
        };
        let ranked = rank_supplementary(
            &chunks,
            &[0.0, 1.0],
            Some(&excerpt),
            &RetrievalTuning::default(),
        );
        assert!(ranked.iter().all(|c| c.text != "the excerpt itself"));
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn duplicate_texts_are_returned_once() {
        let chunks = vec![
            chunk("repeated", &[1.0, 0.0]),
            chunk("repeated", &[1.0, 0.0]),
            chunk("other", &[0.5, 0.5]),
        ];
        let ranked = rank_supplementary(&chunks, &[1.0, 0.0], None, &RetrievalTuning::default());
        let texts: Vec<&str> = ranked.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["repeated", "other"]);
    }

    struct AxisEmbedder;

    impl Embedder for AxisEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(if text.contains("cat") {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            })
        }
    }

    #[tokio::test]
    async fn empty_index_skips_embedding() {
        let retriever = Retriever::new(Some(AxisEmbedder), RetrievalTuning::default());
        let found = retriever.retrieve("cat?", "", &SemanticIndex::new()).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn retrieves_best_chunk_for_question() {
        let index = SemanticIndex::new();
        index
            .build(0, "cats purr dogs bark", 5, Some(&AxisEmbedder))
            .await;
        let retriever = Retriever::new(Some(AxisEmbedder), RetrievalTuning::default());
        let found = retriever.retrieve("what about cats", "", &index).await;
        assert_eq!(found[0].text, "cats purr");
        assert_eq!(found.len(), 2);
    }
}
