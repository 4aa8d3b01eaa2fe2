//! Incremental extraction of reasoning, tool calls and content from
//! generated text.
//!
//! Extractors are capabilities bound once per choice: the serving layer asks
//! a factory for a fresh instance for every choice of every request, so
//! extractor state never leaks between choices or requests.
//!
//! Every streaming call receives a [`StepInput`] with the text and token ids
//! seen before this step, including this step, and the step's own delta.
//! Returning `None` means "nothing to emit for this step".

mod hermes;
pub mod json;
mod pipeline;
mod reasoning;
mod required;

use std::sync::Arc;

use crate::audio::AudioChunk;
use crate::protocol::{ChatRequest, ToolCall};

pub use hermes::HermesToolExtractor;
pub use pipeline::{ChoicePipeline, PipelineKind};
pub use reasoning::ThinkReasoningExtractor;
pub use required::{parse_required_tool_calls, RequiredToolStreamer};

// ─── Deltas ───────────────────────────────────────────────────────────────

/// One tool-call fragment inside a streamed delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaToolCall {
    pub index: usize,
    /// Sent with the first fragment of each tool call only.
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

impl DeltaToolCall {
    pub fn arguments(index: usize, arguments: impl Into<String>) -> Self {
        Self {
            index,
            arguments: Some(arguments.into()),
            ..Default::default()
        }
    }
}

/// Incremental payload for one choice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaMessage {
    pub role: Option<String>,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<DeltaToolCall>,
    pub audio: Option<AudioChunk>,
}

impl DeltaMessage {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning_content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<DeltaToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Default::default()
        }
    }

    /// True when nothing in the delta would be visible to the client.
    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.content.as_deref().map_or(true, str::is_empty)
            && self.reasoning_content.as_deref().map_or(true, str::is_empty)
            && self.tool_calls.is_empty()
            && self.audio.is_none()
    }

    /// Fold `other` into `self`, concatenating text fields.
    pub fn merge(&mut self, other: DeltaMessage) {
        fn join(slot: &mut Option<String>, more: Option<String>) {
            if let Some(more) = more {
                slot.get_or_insert_with(String::new).push_str(&more);
            }
        }
        if other.role.is_some() {
            self.role = other.role;
        }
        join(&mut self.content, other.content);
        join(&mut self.reasoning_content, other.reasoning_content);
        self.tool_calls.extend(other.tool_calls);
        if other.audio.is_some() {
            self.audio = other.audio;
        }
    }
}

/// Text and token views for one streaming step of one choice.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub previous_text: &'a str,
    pub current_text: &'a str,
    pub delta_text: &'a str,
    pub previous_token_ids: &'a [u32],
    pub current_token_ids: &'a [u32],
    pub delta_token_ids: &'a [u32],
}

// ─── Capabilities ─────────────────────────────────────────────────────────

/// Reasoning split of a complete output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReasoningOutput {
    pub reasoning: Option<String>,
    pub content: Option<String>,
}

pub trait ReasoningExtractor: Send {
    /// Split a complete output into reasoning and content.
    fn extract_reasoning(&self, output: &str) -> ReasoningOutput;

    /// Split one streaming step. May fill reasoning, content, or both.
    fn extract_reasoning_streaming(&mut self, step: &StepInput<'_>) -> Option<DeltaMessage>;

    /// Whether `token_ids` contain the end of the reasoning segment.
    fn is_reasoning_end(&self, token_ids: &[u32]) -> bool;

    /// Token ids that belong to content rather than reasoning.
    fn extract_content_ids(&self, token_ids: &[u32]) -> Vec<u32>;
}

/// Last-known-good view of one tool call during streaming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedToolCall {
    pub name: String,
    /// Best complete JSON for the arguments seen so far.
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedToolCalls {
    pub tools_called: bool,
    pub tool_calls: Vec<ToolCall>,
    pub content: Option<String>,
}

pub trait ToolCallExtractor: Send {
    /// Extract every tool call from a complete output.
    fn extract_tool_calls(&self, output: &str) -> ExtractedToolCalls;

    fn extract_tool_calls_streaming(&mut self, step: &StepInput<'_>) -> Option<DeltaMessage>;

    /// Authoritative per-tool state, indexed like the streamed tool calls.
    fn prev_tool_calls(&self) -> &[ParsedToolCall];

    /// Argument text actually streamed so far, per tool.
    fn streamed_args(&self) -> &[String];
}

/// Builds one reasoning extractor per choice.
pub trait ReasoningExtractorFactory: Send + Sync {
    fn create(&self, request: &ChatRequest) -> anyhow::Result<Box<dyn ReasoningExtractor>>;
}

impl<F> ReasoningExtractorFactory for F
where
    F: Fn(&ChatRequest) -> anyhow::Result<Box<dyn ReasoningExtractor>> + Send + Sync,
{
    fn create(&self, request: &ChatRequest) -> anyhow::Result<Box<dyn ReasoningExtractor>> {
        self(request)
    }
}

/// Builds one tool-call extractor per choice.
pub trait ToolExtractorFactory: Send + Sync {
    fn create(&self, request: &ChatRequest) -> anyhow::Result<Box<dyn ToolCallExtractor>>;
}

impl<F> ToolExtractorFactory for F
where
    F: Fn(&ChatRequest) -> anyhow::Result<Box<dyn ToolCallExtractor>> + Send + Sync,
{
    fn create(&self, request: &ChatRequest) -> anyhow::Result<Box<dyn ToolCallExtractor>> {
        self(request)
    }
}

/// Look up a reasoning extractor factory by its configured name.
pub fn reasoning_factory_by_name(
    name: &str,
    start_token_id: u32,
    end_token_id: u32,
) -> Option<Arc<dyn ReasoningExtractorFactory>> {
    match name {
        "think" | "deepseek_r1" | "qwen3" => Some(Arc::new(
            move |_: &ChatRequest| -> anyhow::Result<Box<dyn ReasoningExtractor>> {
                Ok(Box::new(ThinkReasoningExtractor::new(
                    start_token_id,
                    end_token_id,
                )))
            },
        )),
        _ => None,
    }
}

/// Look up a tool-call extractor factory by its configured name.
pub fn tool_factory_by_name(name: &str) -> Option<Arc<dyn ToolExtractorFactory>> {
    match name {
        "hermes" => Some(Arc::new(
            |_: &ChatRequest| -> anyhow::Result<Box<dyn ToolCallExtractor>> {
                Ok(Box::new(HermesToolExtractor::new()))
            },
        )),
        _ => None,
    }
}
