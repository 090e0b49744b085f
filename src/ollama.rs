use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{normalize_err_body, AskError};

/// Word limits tried, largest first, when a text overflows the embedding
/// model's context window.
const EMBED_WORD_LIMITS: [usize; 6] = [1000, 600, 400, 240, 160, 100];

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        let err = match self.embed_any_endpoint(model, input).await {
            Ok(vector) => return Ok(vector),
            Err(err) if is_context_length_error(&err) => err,
            Err(err) => return Err(err),
        };

        let word_count = input.split_whitespace().count();
        let mut last_err = err;
        for max_words in EMBED_WORD_LIMITS.into_iter().filter(|limit| *limit < word_count) {
            let truncated = input
                .split_whitespace()
                .take(max_words)
                .collect::<Vec<_>>()
                .join(" ");
            match self.embed_any_endpoint(model, &truncated).await {
                Ok(vector) => return Ok(vector),
                Err(err) if is_context_length_error(&err) => last_err = err,
                Err(err) => return Err(err),
            }
        }

        Err(last_err.context(format!(
            "embedding input of {word_count} words exceeds the model context"
        )))
    }

    /// `/api/embed` on current Ollama releases, `/api/embeddings` on older ones.
    async fn embed_any_endpoint(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbedReq<'a> {
            model: &'a str,
            input: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            embeddings: Vec<Vec<f32>>,
        }

        #[derive(Serialize)]
        struct LegacyReq<'a> {
            model: &'a str,
            prompt: &'a str,
        }

        #[derive(Deserialize)]
        struct LegacyResp {
            embedding: Vec<f32>,
        }

        let modern = self
            .post_json::<_, EmbedResp>("/api/embed", &EmbedReq { model, input: text })
            .await
            .and_then(|resp| {
                resp.embeddings
                    .into_iter()
                    .next()
                    .context("ollama /api/embed returned an empty embeddings array")
            });

        let modern_err = match modern {
            Ok(vector) => return Ok(vector),
            Err(err) => err,
        };

        self.post_json::<_, LegacyResp>(
            "/api/embeddings",
            &LegacyReq {
                model,
                prompt: text,
            },
        )
        .await
        .map(|resp| resp.embedding)
        .map_err(|legacy_err| {
            anyhow::anyhow!(
                "ollama embedding failed via /api/embed ({modern_err}) and /api/embeddings \
                 ({legacy_err}); make sure `{model}` is pulled"
            )
        })
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to call ollama {path}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ollama {path} returned {status}: {}", normalize_err_body(&body));
        }

        response
            .json::<Resp>()
            .await
            .with_context(|| format!("failed to decode ollama {path} response"))
    }

    pub async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        temperature: f32,
    ) -> Result<String, AskError> {
        #[derive(Serialize)]
        struct GenerateReq<'a> {
            model: &'a str,
            prompt: &'a str,
            stream: bool,
            options: GenerateOptions,
        }

        #[derive(Serialize)]
        struct GenerateOptions {
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct GenerateResp {
            response: String,
        }

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&GenerateReq {
                model,
                prompt,
                stream: false,
                options: GenerateOptions { temperature },
            })
            .send()
            .await
            .map_err(|err| AskError::transport("ollama", err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AskError::from_status("ollama", status, &body));
        }

        let parsed = response
            .json::<GenerateResp>()
            .await
            .map_err(|err| AskError::Upstream(format!("undecodable ollama response: {err}")))?;

        Ok(parsed.response.trim().to_string())
    }
}

fn is_context_length_error(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_ascii_lowercase();
    msg.contains("input length exceeds the context length")
        || (msg.contains("context length") && msg.contains("input length"))
}
