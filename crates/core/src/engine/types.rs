//! Types exchanged with the external generation engine.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{ChatMessage, ToolDefinition};

/// One row of audio codebook tokens: one value per codebook for a single step.
///
/// A row whose first value is [`AUDIO_SEGMENT_SENTINEL`] marks the end of an
/// audio segment rather than carrying audio.
pub type AudioRow = Vec<i64>;

/// First value of the end-of-audio-segment sentinel row.
pub const AUDIO_SEGMENT_SENTINEL: i64 = -1;

// ─── Per-step outputs ─────────────────────────────────────────────────────

/// Why the engine stopped generating a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
    Abort,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Abort => "abort",
        }
    }
}

/// Log probability of one sampled token plus its top alternatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f32,
    #[serde(default)]
    pub top_logprobs: Vec<TopLogprob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopLogprob {
    pub token: String,
    pub logprob: f32,
}

/// Incremental output of one choice for one generation step.
///
/// `text`, `token_ids` and `mm_token_ids` are deltas relative to the previous
/// step of the same choice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOutput {
    pub index: usize,
    pub text: String,
    pub token_ids: Vec<u32>,
    /// Audio rows produced this step, or `None` when the step carried no audio.
    pub mm_token_ids: Option<Vec<AudioRow>>,
    pub finish_reason: Option<FinishReason>,
    /// Stop string or stop token that ended the choice.
    pub stop_reason: Option<serde_json::Value>,
    pub logprobs: Option<Vec<TokenLogprob>>,
}

/// One step of the generation stream for a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOutput {
    pub request_id: String,
    pub prompt_token_ids: Vec<u32>,
    pub encoder_prompt_token_ids: Option<Vec<u32>>,
    pub num_cached_tokens: Option<usize>,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
}

impl RequestOutput {
    /// Prompt length including encoder-side tokens.
    pub fn num_prompt_tokens(&self) -> usize {
        self.prompt_token_ids.len()
            + self
                .encoder_prompt_token_ids
                .as_ref()
                .map_or(0, |ids| ids.len())
    }
}

// ─── Engine errors ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The consumer went away while a step was pending.
    #[error("request was cancelled")]
    Cancelled,
    #[error("engine has shut down")]
    Shutdown,
    #[error("generation failed: {0}")]
    Generation(String),
}

// ─── Requests ─────────────────────────────────────────────────────────────

/// A request handed to the engine. Prompt templating and tokenization are
/// the engine's responsibility.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub request_id: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub add_generation_prompt: bool,
    /// Number of parallel choices.
    pub n: usize,
    pub max_tokens: Option<usize>,
    /// Number of top logprobs per token, when logprobs are requested.
    pub logprobs: Option<usize>,
    /// Whether the caller wants structured output for this request.
    pub structured_output: bool,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            add_generation_prompt: true,
            n: 1,
            max_tokens: None,
            logprobs: None,
            structured_output: false,
        }
    }
}

/// Ordered per-step outputs for one request.
pub type GenerationStream =
    Pin<Box<dyn Stream<Item = Result<RequestOutput, EngineError>> + Send + 'static>>;

/// Commands sent to an engine task over an [`super::EngineHandle`].
pub enum EngineCommand {
    Generate {
        request: GenerationRequest,
        output_tx: mpsc::Sender<Result<RequestOutput, EngineError>>,
    },
    Abort {
        request_id: String,
    },
}
