use serde::{Deserialize, Serialize};

// -- Outbound completion request --------------------------------------------

/// Sampling knobs forwarded to the completion backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub alpha_presence: f32,
    pub alpha_frequency: f32,
    pub alpha_decay: f32,
    pub chunk_size: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        SamplingParams {
            temperature: 1.0,
            top_k: 50,
            top_p: 0.85,
            alpha_presence: 0.3,
            alpha_frequency: 0.3,
            alpha_decay: 0.996,
            chunk_size: 128,
        }
    }
}

/// The streamed-completion request body. Immutable once submitted.
///
/// `contents` carries one prompt (the backend fans it out across all stream
/// indices) or one prompt per index for a continuation run.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub contents: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub pad_zero: bool,
    pub alpha_presence: f32,
    pub alpha_frequency: f32,
    pub alpha_decay: f32,
    pub chunk_size: u32,
    pub stream: bool,
    pub password: String,
}

impl CompletionRequest {
    pub fn new(
        contents: Vec<String>,
        max_tokens: u32,
        sampling: &SamplingParams,
        password: &str,
    ) -> Self {
        CompletionRequest {
            contents,
            max_tokens,
            temperature: sampling.temperature,
            top_k: sampling.top_k,
            top_p: sampling.top_p,
            pad_zero: true,
            alpha_presence: sampling.alpha_presence,
            alpha_frequency: sampling.alpha_frequency,
            alpha_decay: sampling.alpha_decay,
            chunk_size: sampling.chunk_size,
            stream: true,
            password: password.to_string(),
        }
    }
}

// -- Inbound SSE delta frames ------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeltaContent {
    #[serde(default)]
    pub content: Option<String>,
}

/// One per-index delta inside a frame. The index is kept signed so a bogus
/// negative value from the backend drops that choice, not the whole frame.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaChoice {
    pub index: i64,
    #[serde(default)]
    pub delta: DeltaContent,
}

/// One decoded SSE frame: zero or more `(index, delta)` pairs.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaFrame {
    #[allow(dead_code)]
    pub object: Option<String>,
    #[serde(default)]
    pub choices: Vec<DeltaChoice>,
}

// -- Prompt shaping -----------------------------------------------------------

/// Prompt sent for a fresh generation: the user's text, as typed.
pub fn initial_prompt(user_prompt: &str) -> String {
    user_prompt.to_string()
}

/// Prompt sent for one stream of a continuation run: the accumulated content
/// with trailing whitespace trimmed, so the model picks up mid-text.
pub fn continuation_prompt(accumulated: &str) -> String {
    accumulated.trim_end().to_string()
}

/// Seed installed into a stream buffer before a continuation run, so the
/// persisted result reads `context + "\n\n" + <new deltas>`.
pub fn continuation_seed(accumulated: &str) -> String {
    format!("{}\n\n", accumulated.trim_end())
}
