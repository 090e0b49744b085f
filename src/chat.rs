use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{RwLock, Semaphore};

use crate::cache::TtlCache;
use crate::config::AnswerConfig;
use crate::embedder::Embedder;
use crate::error::AskError;
use crate::index::SemanticIndex;
use crate::models::{AskResponse, ChatAnswer, ChatReply, ScoredChunk};
use crate::prompt::{
    assemble_prompt, grounding_context, validate_context, validate_question, MAX_CONTEXT_CHARS,
};
use crate::providers::{local_answer, AnswerClient, AnswerProvider};
use crate::retrieval::Retriever;

type AnswerKey = (String, String);

/// Answers questions about the current excerpt of a loaded document.
#[derive(Clone)]
pub struct ChatService<E> {
    retriever: Retriever<E>,
    answers: AnswerClient,
    provider: Arc<RwLock<AnswerProvider>>,
    cache: Arc<TtlCache<AnswerKey, ChatAnswer>>,
    generation_limit: Arc<Semaphore>,
    submissions: Arc<AtomicU64>,
    fallback_delay: Duration,
}

impl<E: Embedder> ChatService<E> {
    pub fn new(
        retriever: Retriever<E>,
        answers: AnswerClient,
        provider: AnswerProvider,
        config: &AnswerConfig,
    ) -> Self {
        Self {
            retriever,
            answers,
            provider: Arc::new(RwLock::new(provider)),
            cache: Arc::new(TtlCache::new(
                config.cache_capacity,
                chrono::Duration::seconds(config.cache_ttl_secs),
            )),
            generation_limit: Arc::new(Semaphore::new(1)),
            submissions: Arc::new(AtomicU64::new(0)),
            fallback_delay: Duration::from_millis(config.fallback_delay_ms),
        }
    }

    /// Like [`ChatService::ask`], but a selection is mandatory.
    pub async fn ask_about_selection(
        &self,
        excerpt: &str,
        question: &str,
        index: &SemanticIndex,
    ) -> Result<ChatReply, AskError> {
        if excerpt.trim().is_empty() {
            return Err(AskError::Validation(
                "select a region of the page before asking".to_string(),
            ));
        }
        self.ask(excerpt, question, index).await
    }

    /// Answers `question` grounded in `excerpt` and whatever the index holds.
    ///
    /// Each call is tagged with a submission number; callers compare it with
    /// [`ChatService::is_latest`] to drop replies that were overtaken.
    pub async fn ask(
        &self,
        excerpt: &str,
        question: &str,
        index: &SemanticIndex,
    ) -> Result<ChatReply, AskError> {
        let question = validate_question(question)?;
        let excerpt = excerpt.trim();
        validate_context(excerpt)?;

        let submission = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        let key = (excerpt.to_string(), question.to_string());

        if let Some(answer) = self.cache.get(&key) {
            tracing::debug!(submission, "answer served from cache");
            return Ok(ChatReply {
                submission,
                answer,
                cached: true,
                notice: None,
            });
        }

        let started = Instant::now();
        let mut supplementary = self.retriever.retrieve(question, excerpt, index).await;
        let context = fit_context(excerpt, &mut supplementary)?;
        let prompt = assemble_prompt(&context, question);

        let _permit = self
            .generation_limit
            .acquire()
            .await
            .map_err(|_| AskError::Upstream("answer generation is shut down".to_string()))?;

        let provider = self.provider.read().await.clone();
        let answered = self.answers.answer(&provider, &context, question, None).await;
        let (response, notice) = match answered {
            Ok(response) => (response, None),
            Err(err) if provider.is_remote() && err.is_transient() => {
                tracing::warn!(
                    provider = provider.name(),
                    "answer failed, switching to the local responder: {err}"
                );
                tokio::time::sleep(self.fallback_delay).await;
                self.downgrade(&provider).await;
                let response = AskResponse {
                    answer: local_answer(&context, question),
                    source: AnswerProvider::Local.name().to_string(),
                };
                let notice = format!("{err}. Switched to the local preview responder.");
                (response, Some(notice))
            }
            Err(err) => return Err(err),
        };

        let answer = ChatAnswer {
            answer: response.answer,
            source: response.source,
            supplementary,
            prompt,
            answered_at: Utc::now(),
        };

        if notice.is_none() {
            self.cache.insert(key, answer.clone());
        }

        tracing::info!(
            submission,
            source = %answer.source,
            supplementary = answer.supplementary.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "answered question"
        );

        Ok(ChatReply {
            submission,
            answer,
            cached: false,
            notice,
        })
    }

    /// True when no submission was made after `submission`.
    pub fn is_latest(&self, submission: u64) -> bool {
        self.submissions.load(Ordering::SeqCst) == submission
    }

    pub async fn provider_name(&self) -> &'static str {
        self.provider.read().await.name()
    }

    pub async fn set_provider(&self, provider: AnswerProvider) {
        *self.provider.write().await = provider;
    }

    /// Switches to the local responder unless someone already replaced `failed`.
    async fn downgrade(&self, failed: &AnswerProvider) {
        let mut provider = self.provider.write().await;
        if *provider == *failed {
            *provider = AnswerProvider::Local;
        }
    }
}

/// Grounding context that fits the context limit, dropping the weakest
/// supplementary chunks first.
///
/// Fails when the excerpt section alone is over the limit.
fn fit_context(excerpt: &str, supplementary: &mut Vec<ScoredChunk>) -> Result<String, AskError> {
    loop {
        let texts: Vec<String> = supplementary.iter().map(|c| c.text.clone()).collect();
        let context = grounding_context(excerpt, &texts);
        if context.chars().count() <= MAX_CONTEXT_CHARS {
            return Ok(context);
        }
        if supplementary.pop().is_none() {
            validate_context(&context)?;
            return Ok(context);
        }
    }
}
