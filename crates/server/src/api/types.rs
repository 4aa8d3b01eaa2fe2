//! OpenAI-compatible wire shapes for chat completions.
//!
//! Requests are deserialized straight into [`higgs_core::protocol::ChatRequest`];
//! this module only covers what goes back over the wire.

use std::sync::Arc;

use base64::Engine as _;
use serde::Serialize;

use higgs_core::aggregate::{FullChoice, FullResponse, ResponseAudio, ResponseMessage};
use higgs_core::audio::encode::pcm16_bytes;
use higgs_core::audio::AudioChunk;
use higgs_core::engine::TokenLogprob;
use higgs_core::extract::{DeltaMessage, DeltaToolCall};
use higgs_core::protocol::{ToolCall, UsageInfo};
use higgs_core::stream::{ChoiceFinishReason, DeltaFrame};

// ─── Logprobs ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ChatLogProbs {
    pub content: Vec<ChatLogProbToken>,
}

#[derive(Debug, Serialize)]
pub struct ChatLogProbToken {
    pub token: String,
    pub logprob: f32,
    pub bytes: Vec<u8>,
    pub top_logprobs: Vec<ChatTopLogProb>,
}

#[derive(Debug, Serialize)]
pub struct ChatTopLogProb {
    pub token: String,
    pub logprob: f32,
    pub bytes: Vec<u8>,
}

impl ChatLogProbs {
    pub fn from_tokens(tokens: &[TokenLogprob]) -> Self {
        Self {
            content: tokens
                .iter()
                .map(|t| ChatLogProbToken {
                    token: t.token.clone(),
                    logprob: t.logprob,
                    bytes: t.token.as_bytes().to_vec(),
                    top_logprobs: t
                        .top_logprobs
                        .iter()
                        .map(|top| ChatTopLogProb {
                            token: top.token.clone(),
                            logprob: top.logprob,
                            bytes: top.token.as_bytes().to_vec(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

// ─── Streaming chunks ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: Arc<str>,
    pub object: &'static str,
    pub created: u64,
    pub model: Arc<str>,
    pub choices: Vec<ChatCompletionChunkChoice>,
    /// Running usage with continuous stats, or the final usage-only chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunkChoice {
    pub index: usize,
    pub delta: ChatDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<ChatLogProbs>,
    pub finish_reason: Option<ChoiceFinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<serde_json::Value>,
}

#[derive(Debug, Default, Serialize)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCallDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<ChatAudioDelta>,
}

#[derive(Debug, Serialize)]
pub struct ChatToolCallDelta {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub call_type: Option<&'static str>,
    pub function: ChatFunctionDelta,
}

#[derive(Debug, Serialize)]
pub struct ChatFunctionDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Streamed audio: base64 16-bit little-endian PCM.
#[derive(Debug, Serialize)]
pub struct ChatAudioDelta {
    pub data: String,
    pub sample_rate: u32,
}

impl From<DeltaToolCall> for ChatToolCallDelta {
    fn from(call: DeltaToolCall) -> Self {
        Self {
            index: call.index,
            call_type: call.id.as_ref().map(|_| "function"),
            id: call.id,
            function: ChatFunctionDelta {
                name: call.name,
                arguments: call.arguments,
            },
        }
    }
}

impl From<AudioChunk> for ChatAudioDelta {
    fn from(chunk: AudioChunk) -> Self {
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(pcm16_bytes(&chunk.samples)),
            sample_rate: chunk.sample_rate,
        }
    }
}

impl From<DeltaMessage> for ChatDelta {
    fn from(delta: DeltaMessage) -> Self {
        Self {
            role: delta.role,
            content: delta.content,
            reasoning_content: delta.reasoning_content,
            tool_calls: delta.tool_calls.into_iter().map(Into::into).collect(),
            audio: delta.audio.map(Into::into),
        }
    }
}

impl From<DeltaFrame> for ChatCompletionChunkChoice {
    fn from(frame: DeltaFrame) -> Self {
        Self {
            index: frame.choice_index,
            delta: frame.delta.into(),
            logprobs: frame.logprobs.as_deref().map(ChatLogProbs::from_tokens),
            finish_reason: frame.finish_reason,
            stop_reason: frame.stop_reason,
        }
    }
}

impl ChatCompletionChunk {
    pub fn frame(id: &Arc<str>, model: &Arc<str>, mut frame: DeltaFrame) -> Self {
        let usage = frame.usage.take();
        Self {
            id: Arc::clone(id),
            object: "chat.completion.chunk",
            created: timestamp_now(),
            model: Arc::clone(model),
            choices: vec![frame.into()],
            usage,
        }
    }

    pub fn usage(id: &Arc<str>, model: &Arc<str>, usage: UsageInfo) -> Self {
        Self {
            id: Arc::clone(id),
            object: "chat.completion.chunk",
            created: timestamp_now(),
            model: Arc::clone(model),
            choices: Vec::new(),
            usage: Some(usage),
        }
    }
}

// ─── Full responses ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: UsageInfo,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChoice {
    pub index: usize,
    pub message: ChatMessageResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<ChatLogProbs>,
    pub finish_reason: ChoiceFinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ChatMessageResponse {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<ResponseAudio>,
}

impl From<ResponseMessage> for ChatMessageResponse {
    fn from(message: ResponseMessage) -> Self {
        Self {
            role: message.role,
            content: message.content,
            reasoning_content: message.reasoning_content,
            tool_calls: message.tool_calls,
            audio: message.audio,
        }
    }
}

impl From<FullChoice> for ChatCompletionChoice {
    fn from(choice: FullChoice) -> Self {
        Self {
            index: choice.index,
            logprobs: choice.logprobs.as_deref().map(ChatLogProbs::from_tokens),
            message: choice.message.into(),
            finish_reason: choice.finish_reason,
            stop_reason: choice.stop_reason,
        }
    }
}

impl ChatCompletionResponse {
    pub fn new(model: String, response: FullResponse) -> Self {
        Self {
            id: response.request_id,
            object: "chat.completion",
            created: timestamp_now(),
            model,
            choices: response.choices.into_iter().map(Into::into).collect(),
            usage: response.usage,
        }
    }
}

pub fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
