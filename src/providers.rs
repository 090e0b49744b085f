//! Answering backends.
//!
//! Every backend is a variant of [`AnswerProvider`] and [`AnswerClient::answer`]
//! is the single dispatch point mapping a variant to its request and response
//! shapes. New backends are new variants.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{AnswerConfig, AppConfig};
use crate::error::AskError;
use crate::models::{AskRequest, AskResponse, ProviderStatus};
use crate::ollama::OllamaClient;
use crate::prompt::{assemble_prompt, EXCERPT_HEADING, REFUSAL_SENTENCE, SUPPLEMENTARY_HEADING};

pub const LOCAL_LABEL: &str = "[Local preview: no answering provider is configured]";
const PREVIEW_CHARS: usize = 280;
const MAX_KEYWORDS: usize = 6;

const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-latest";

#[derive(Debug, Clone, PartialEq)]
pub enum AnswerProvider {
    Local,
    Ollama { base_url: String, model: String },
    OpenAi { api_key: String, model: String },
    Anthropic { api_key: String, model: String },
    /// Another regionqa server reached through `POST /api/ask`.
    Relay { base_url: String, model: Option<String> },
}

impl AnswerProvider {
    /// Provider named by `ANSWER_PROVIDER`, or the first one with a credential.
    pub fn from_config(config: &AppConfig) -> Self {
        let answer = &config.answer;
        let choice = answer.provider.as_deref().or_else(|| {
            if answer.openai_api_key.is_some() {
                Some("openai")
            } else if answer.anthropic_api_key.is_some() {
                Some("anthropic")
            } else if answer.relay_url.is_some() {
                Some("relay")
            } else {
                None
            }
        });

        let provider = match choice {
            Some("ollama") => Some(AnswerProvider::Ollama {
                base_url: config.ollama_base_url.clone(),
                model: model_or(answer, DEFAULT_OLLAMA_MODEL),
            }),
            Some("openai") => answer.openai_api_key.clone().map(|api_key| AnswerProvider::OpenAi {
                api_key,
                model: model_or(answer, DEFAULT_OPENAI_MODEL),
            }),
            Some("anthropic") => {
                answer
                    .anthropic_api_key
                    .clone()
                    .map(|api_key| AnswerProvider::Anthropic {
                        api_key,
                        model: model_or(answer, DEFAULT_ANTHROPIC_MODEL),
                    })
            }
            Some("relay") => answer.relay_url.clone().map(|base_url| AnswerProvider::Relay {
                base_url: base_url.trim_end_matches('/').to_string(),
                model: answer.model.clone(),
            }),
            Some("local") | None => Some(AnswerProvider::Local),
            Some(other) => {
                tracing::warn!("unknown answer provider `{other}`");
                None
            }
        };

        provider.unwrap_or_else(|| {
            tracing::warn!(
                "answer provider {:?} is not fully configured; using the local responder",
                choice
            );
            AnswerProvider::Local
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AnswerProvider::Local => "local",
            AnswerProvider::Ollama { .. } => "ollama",
            AnswerProvider::OpenAi { .. } => "openai",
            AnswerProvider::Anthropic { .. } => "anthropic",
            AnswerProvider::Relay { .. } => "relay",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, AnswerProvider::Local)
    }
}

fn model_or(answer: &AnswerConfig, default: &str) -> String {
    answer.model.clone().unwrap_or_else(|| default.to_string())
}

/// Which backends have what they need to be used.
pub fn configured_providers(config: &AppConfig) -> Vec<ProviderStatus> {
    let answer = &config.answer;
    [
        ("local", true),
        ("ollama", !config.ollama_base_url.trim().is_empty()),
        ("openai", answer.openai_api_key.is_some()),
        ("anthropic", answer.anthropic_api_key.is_some()),
        ("relay", answer.relay_url.is_some()),
    ]
    .into_iter()
    .map(|(name, configured)| ProviderStatus {
        name: name.to_string(),
        configured,
    })
    .collect()
}

#[derive(Clone)]
pub struct AnswerClient {
    client: Client,
}

impl AnswerClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build answering HTTP client")?;
        Ok(Self { client })
    }

    /// Answers `question` from `context` with `provider`.
    ///
    /// `model` overrides the provider's configured model for this call.
    pub async fn answer(
        &self,
        provider: &AnswerProvider,
        context: &str,
        question: &str,
        model: Option<&str>,
    ) -> Result<AskResponse, AskError> {
        let answer = match provider {
            AnswerProvider::Local => local_answer(context, question),
            AnswerProvider::Ollama {
                base_url,
                model: default_model,
            } => {
                OllamaClient::with_client(self.client.clone(), base_url.clone())
                    .generate_text(
                        model.unwrap_or(default_model),
                        &assemble_prompt(context, question),
                        0.1,
                    )
                    .await?
            }
            AnswerProvider::OpenAi {
                api_key,
                model: default_model,
            } => {
                let prompt = assemble_prompt(context, question);
                self.openai(api_key, model.unwrap_or(default_model), &prompt).await?
            }
            AnswerProvider::Anthropic {
                api_key,
                model: default_model,
            } => {
                let prompt = assemble_prompt(context, question);
                self.anthropic(api_key, model.unwrap_or(default_model), &prompt).await?
            }
            AnswerProvider::Relay {
                base_url,
                model: default_model,
            } => {
                let request = AskRequest {
                    context: Some(context.to_string()),
                    question: Some(question.to_string()),
                    model: model.map(str::to_string).or_else(|| default_model.clone()),
                };
                return self.relay(base_url, &request).await;
            }
        };

        if answer.trim().is_empty() {
            return Err(AskError::Upstream(format!(
                "{} returned an empty answer",
                provider.name()
            )));
        }

        Ok(AskResponse {
            answer,
            source: provider.name().to_string(),
        })
    }

    async fn openai(&self, api_key: &str, model: &str, prompt: &str) -> Result<String, AskError> {
        #[derive(Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            temperature: f32,
            messages: Vec<ChatMessage<'a>>,
        }

        #[derive(Serialize)]
        struct ChatMessage<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<ChatChoice>,
        }

        #[derive(Deserialize)]
        struct ChatChoice {
            message: AssistantMessage,
        }

        #[derive(Deserialize)]
        struct AssistantMessage {
            #[serde(default)]
            content: Option<String>,
        }

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| {
                AskError::Unauthorized("OpenAI API key is not a valid header".to_string())
            })?;
        headers.insert(AUTHORIZATION, auth);

        let body = ChatRequest {
            model,
            temperature: 0.1,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|err| AskError::transport("openai", err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AskError::from_status("openai", status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| AskError::Upstream(format!("undecodable OpenAI response: {err}")))?;

        Ok(parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    async fn anthropic(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<String, AskError> {
        #[derive(Serialize)]
        struct MessagesRequest<'a> {
            model: &'a str,
            max_tokens: usize,
            temperature: f32,
            messages: Vec<Message<'a>>,
        }

        #[derive(Serialize)]
        struct Message<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Deserialize)]
        struct MessagesResponse {
            content: Vec<ContentBlock>,
        }

        #[derive(Deserialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        enum ContentBlock {
            Text {
                text: String,
            },
            #[serde(other)]
            Other,
        }

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key.trim())
            .map_err(|_| {
                AskError::Unauthorized("Anthropic API key is not a valid header".to_string())
            })?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));

        let body = MessagesRequest {
            model,
            max_tokens: 1024,
            temperature: 0.1,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|err| AskError::transport("anthropic", err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AskError::from_status("anthropic", status, &text));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|err| AskError::Upstream(format!("undecodable Anthropic response: {err}")))?;

        Ok(parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string())
    }

    async fn relay(&self, base_url: &str, request: &AskRequest) -> Result<AskResponse, AskError> {
        let response = self
            .client
            .post(format!("{base_url}/api/ask"))
            .json(request)
            .send()
            .await
            .map_err(|err| AskError::transport("relay", err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AskError::from_status("relay", status, &text));
        }

        response
            .json::<AskResponse>()
            .await
            .map_err(|err| AskError::Upstream(format!("undecodable relay response: {err}")))
    }
}

/// Deterministic stand-in used when no answering provider is configured.
///
/// It does not answer; it echoes what would have grounded an answer.
pub fn local_answer(context: &str, question: &str) -> String {
    let grounding = context
        .lines()
        .filter(|line| {
            let line = line.trim();
            line != EXCERPT_HEADING && line != SUPPLEMENTARY_HEADING
        })
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ");

    if grounding.is_empty() {
        return REFUSAL_SENTENCE.to_string();
    }

    let keywords = question_keywords(question);
    let keywords = if keywords.is_empty() {
        "none".to_string()
    } else {
        keywords.join(", ")
    };

    let preview = if grounding.chars().count() > PREVIEW_CHARS {
        let cut: String = grounding.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", cut.trim_end())
    } else {
        grounding
    };

    format!("{LOCAL_LABEL}\nQuestion keywords: {keywords}\nGrounding preview: \"{preview}\"")
}

fn question_keywords(question: &str) -> Vec<String> {
    let Ok(word_re) = Regex::new(r"[\p{L}\p{N}']+") else {
        return vec![];
    };
    let stopwords = stopwords();
    let mut seen = HashSet::new();

    word_re
        .find_iter(question)
        .map(|m| m.as_str().to_lowercase())
        .filter(|word| word.chars().count() >= 3 && !stopwords.contains(word.as_str()))
        .filter(|word| seen.insert(word.clone()))
        .take(MAX_KEYWORDS)
        .collect()
}

fn stopwords() -> HashSet<&'static str> {
    [
        "the", "and", "are", "was", "were", "what", "which", "who", "whom", "whose", "why",
        "how", "when", "where", "this", "that", "these", "those", "does", "did", "has", "have",
        "had", "for", "from", "with", "about", "into", "can", "could", "would", "should", "will",
        "its", "it's", "there", "their", "they", "them", "you", "your", "not", "but", "than",
        "then", "mean", "means", "explain", "tell",
    ]
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(answer: AnswerConfig) -> AppConfig {
        AppConfig {
            answer,
            ..AppConfig::default()
        }
    }

    #[test]
    fn local_answer_refuses_without_grounding() {
        assert_eq!(local_answer("", "What is this?"), REFUSAL_SENTENCE);
        assert_eq!(
            local_answer(&format!("{EXCERPT_HEADING}\n  "), "What is this?"),
            REFUSAL_SENTENCE
        );
    }

    #[test]
    fn local_answer_is_labeled_preview() {
        let context =
            format!("{EXCERPT_HEADING}\nPhotosynthesis converts light into chemical energy.");
        let answer = local_answer(&context, "How does photosynthesis store energy?");
        assert!(answer.starts_with(LOCAL_LABEL));
        assert!(answer.contains("Question keywords: photosynthesis, store, energy"));
        assert!(answer.contains("\"Photosynthesis converts light into chemical energy.\""));
        assert!(!answer.contains(EXCERPT_HEADING));
        assert_eq!(answer, local_answer(&context, "How does photosynthesis store energy?"));
    }

    #[test]
    fn local_answer_truncates_long_grounding() {
        let context = "word ".repeat(200);
        let answer = local_answer(&context, "Why?");
        assert!(answer.contains("Question keywords: none"));
        assert!(answer.ends_with("...\""));
        assert!(answer.len() < context.len());
    }

    #[test]
    fn first_credential_selects_provider() {
        let provider = AnswerProvider::from_config(&config_with(AnswerConfig {
            anthropic_api_key: Some("key".to_string()),
            ..AnswerConfig::default()
        }));
        assert_eq!(provider.name(), "anthropic");
        assert!(provider.is_remote());

        let provider = AnswerProvider::from_config(&config_with(AnswerConfig::default()));
        assert_eq!(provider, AnswerProvider::Local);
    }

    #[test]
    fn unconfigured_choice_falls_back_to_local() {
        let provider = AnswerProvider::from_config(&config_with(AnswerConfig {
            provider: Some("openai".to_string()),
            ..AnswerConfig::default()
        }));
        assert_eq!(provider, AnswerProvider::Local);

        let provider = AnswerProvider::from_config(&config_with(AnswerConfig {
            provider: Some("ollama".to_string()),
            model: Some("qwen2.5".to_string()),
            ..AnswerConfig::default()
        }));
        assert!(matches!(provider, AnswerProvider::Ollama { ref model, .. } if model == "qwen2.5"));
    }

    #[test]
    fn health_lists_every_provider() {
        let statuses = configured_providers(&config_with(AnswerConfig {
            relay_url: Some("http://relay".to_string()),
            ..AnswerConfig::default()
        }));
        let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["local", "ollama", "openai", "anthropic", "relay"]);
        assert!(statuses.iter().find(|s| s.name == "relay").is_some_and(|s| s.configured));
        assert!(statuses.iter().find(|s| s.name == "openai").is_some_and(|s| !s.configured));
    }

    #[tokio::test]
    async fn local_dispatch_needs_no_network() {
        let client = AnswerClient::new().expect("client");
        let response = client
            .answer(&AnswerProvider::Local, "", "What is this?", None)
            .await
            .expect("local answer");
        assert_eq!(response.answer, REFUSAL_SENTENCE);
        assert_eq!(response.source, "local");
    }
}
