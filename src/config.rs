use std::env;
use std::str::FromStr;

use crate::mapper::DEFAULT_RUN_HEIGHT;

/// Selection heuristics. Defaults are the tuned design constants.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionTuning {
    /// Minimum fraction of a run that must lie inside the selection.
    pub coverage_threshold: f32,
    /// Runs larger than `heading_size_factor * average` are heading candidates.
    pub heading_size_factor: f32,
    /// Heading candidates are kept when they make up more than this share.
    pub heading_keep_ratio: f32,
    /// Selections with at most this many runs are never filtered.
    pub small_selection_max_runs: usize,
    pub fallback_run_height: f32,
}

impl Default for SelectionTuning {
    fn default() -> Self {
        Self {
            coverage_threshold: 0.30,
            heading_size_factor: 1.5,
            heading_keep_ratio: 0.5,
            small_selection_max_runs: 3,
            fallback_run_height: DEFAULT_RUN_HEIGHT,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalTuning {
    pub chunk_target_chars: usize,
    pub top_k: usize,
    /// Multiplier applied to excerpt similarity before it competes with
    /// question similarity.
    pub selection_boost: f32,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            chunk_target_chars: 400,
            top_k: 3,
            selection_boost: 1.1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnswerConfig {
    /// Explicit provider name; `None` picks the first configured credential.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub relay_url: Option<String>,
    pub cache_ttl_secs: i64,
    pub cache_capacity: usize,
    pub fallback_delay_ms: u64,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            openai_api_key: None,
            anthropic_api_key: None,
            relay_url: None,
            cache_ttl_secs: 24 * 60 * 60,
            cache_capacity: 256,
            fallback_delay_ms: 1_500,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub ollama_base_url: String,
    pub embedding_model: String,
    pub answer: AnswerConfig,
    pub selection: SelectionTuning,
    pub retrieval: RetrievalTuning,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            answer: AnswerConfig::default(),
            selection: SelectionTuning::default(),
            retrieval: RetrievalTuning::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let selection = defaults.selection;
        let retrieval = defaults.retrieval;
        let answer = defaults.answer;

        Self {
            bind_addr: env::var("REGIONQA_BIND").unwrap_or(defaults.bind_addr),
            ollama_base_url: env::var("OLLAMA_BASE_URL").unwrap_or(defaults.ollama_base_url),
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            answer: AnswerConfig {
                provider: non_empty_var("ANSWER_PROVIDER").map(|p| p.to_ascii_lowercase()),
                model: non_empty_var("ANSWER_MODEL"),
                openai_api_key: non_empty_var("OPENAI_API_KEY"),
                anthropic_api_key: non_empty_var("ANTHROPIC_API_KEY"),
                relay_url: non_empty_var("RELAY_URL"),
                cache_ttl_secs: parsed_var("ANSWER_CACHE_TTL_SECS")
                    .unwrap_or(answer.cache_ttl_secs),
                cache_capacity: parsed_var("ANSWER_CACHE_CAPACITY")
                    .unwrap_or(answer.cache_capacity),
                fallback_delay_ms: parsed_var("FALLBACK_DELAY_MS")
                    .unwrap_or(answer.fallback_delay_ms),
            },
            selection: SelectionTuning {
                coverage_threshold: parsed_var("SELECTION_COVERAGE_THRESHOLD")
                    .unwrap_or(selection.coverage_threshold),
                heading_size_factor: parsed_var("HEADING_SIZE_FACTOR")
                    .unwrap_or(selection.heading_size_factor),
                heading_keep_ratio: parsed_var("HEADING_KEEP_RATIO")
                    .unwrap_or(selection.heading_keep_ratio),
                small_selection_max_runs: parsed_var("SMALL_SELECTION_MAX_RUNS")
                    .unwrap_or(selection.small_selection_max_runs),
                fallback_run_height: parsed_var("FALLBACK_RUN_HEIGHT")
                    .unwrap_or(selection.fallback_run_height),
            },
            retrieval: RetrievalTuning {
                chunk_target_chars: parsed_var("CHUNK_TARGET_CHARS")
                    .unwrap_or(retrieval.chunk_target_chars),
                top_k: parsed_var("SUPPLEMENTARY_TOP_K").unwrap_or(retrieval.top_k),
                selection_boost: parsed_var("SELECTION_BOOST")
                    .unwrap_or(retrieval.selection_boost),
            },
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
