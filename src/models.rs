use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One positioned fragment of text as reported by the renderer.
///
/// `transform` is the run's native affine matrix `[a, b, c, d, e, f]`, with the
/// origin at the baseline in bottom-up page space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub transform: [f32; 6],
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Viewport {
    pub scale: f32,
    pub width: f32,
    pub height: f32,
    pub transform: [f32; 6],
}

impl Viewport {
    /// Top-down viewport for an unrotated page measured in page units.
    pub fn for_page(page_width: f32, page_height: f32, scale: f32) -> Self {
        Self {
            scale,
            width: page_width * scale,
            height: page_height * scale,
            transform: [scale, 0.0, 0.0, -scale, 0.0, page_height * scale],
        }
    }

    /// The same viewport at another zoom level.
    pub fn at_scale(&self, scale: f32) -> Self {
        if self.scale == scale || self.scale <= 0.0 {
            return *self;
        }

        let factor = scale / self.scale;
        let t = self.transform;
        Self {
            scale,
            width: self.width * factor,
            height: self.height * factor,
            transform: [
                t[0] * factor,
                t[1] * factor,
                t[2] * factor,
                t[3] * factor,
                t[4] * factor,
                t[5] * factor,
            ],
        }
    }
}

/// Cached text layer of one rendered page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageText {
    pub runs: Vec<TextRun>,
    pub viewport: Viewport,
}

impl PageText {
    /// Page text in run order, single-space separated.
    pub fn plain_text(&self) -> String {
        self.runs
            .iter()
            .map(|run| run.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    pub text: String,
    pub score: f32,
}

/// Body of `POST /api/ask`. Fields are optional so that a missing field is
/// reported as a validation error instead of a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AskResponse {
    pub answer: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub configured: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_provider: String,
    pub providers: Vec<ProviderStatus>,
}

/// A grounded answer as produced by the chat service. This is the cached unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatAnswer {
    pub answer: String,
    pub source: String,
    pub supplementary: Vec<ScoredChunk>,
    pub prompt: String,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    /// Sequence number of the submission that produced this reply.
    pub submission: u64,
    pub answer: ChatAnswer,
    pub cached: bool,
    /// Set when a remote provider failed and the local responder stood in.
    pub notice: Option<String>,
}
