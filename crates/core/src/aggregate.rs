//! Non-incremental response assembly.
//!
//! [`FullAggregator`] drains the engine stream, then runs reasoning, tool
//! and audio extraction once over each choice's complete output.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;

use crate::audio::{decode_full, encode::encode_base64, AudioCodec, AudioFormat};
use crate::config::AudioStreamIds;
use crate::engine::{AudioRow, FinishReason, GenerationStream, TokenLogprob};
use crate::error::ServeError;
use crate::extract::{
    parse_required_tool_calls, PipelineKind, ReasoningExtractor, ToolCallExtractor,
};
use crate::protocol::{ToolCall, UsageInfo};
use crate::stream::ChoiceFinishReason;

/// Audio attached to a complete response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseAudio {
    pub id: String,
    /// Base64 of the encoded waveform.
    pub data: String,
    pub expires_at: u64,
    pub transcript: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub audio: Option<ResponseAudio>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullChoice {
    pub index: usize,
    pub message: ResponseMessage,
    pub logprobs: Option<Vec<TokenLogprob>>,
    pub finish_reason: ChoiceFinishReason,
    pub stop_reason: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullResponse {
    pub request_id: String,
    pub choices: Vec<FullChoice>,
    pub usage: UsageInfo,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    pub role: String,
    /// Prepended to every choice's content.
    pub echo: Option<String>,
    pub require_logprobs: bool,
    pub enable_prompt_tokens_details: bool,
    pub audio_format: AudioFormat,
    pub audio_stream: AudioStreamIds,
}

/// Everything the engine produced for one choice.
#[derive(Debug, Default)]
struct ChoiceOutput {
    text: String,
    num_tokens: usize,
    audio_rows: Vec<AudioRow>,
    logprobs: Vec<TokenLogprob>,
    missing_logprobs: bool,
    finish_reason: Option<FinishReason>,
    stop_reason: Option<serde_json::Value>,
}

pub struct FullAggregator {
    options: AggregateOptions,
    kind: PipelineKind,
    reasoning: Option<Box<dyn ReasoningExtractor>>,
    tools: Option<Box<dyn ToolCallExtractor>>,
    codec: Option<Arc<dyn AudioCodec>>,
}

impl FullAggregator {
    pub fn new(
        options: AggregateOptions,
        kind: PipelineKind,
        reasoning: Option<Box<dyn ReasoningExtractor>>,
        tools: Option<Box<dyn ToolCallExtractor>>,
        codec: Option<Arc<dyn AudioCodec>>,
    ) -> Self {
        Self {
            options,
            kind,
            reasoning,
            tools,
            codec,
        }
    }

    /// Wait for the whole generation, then build the response.
    pub async fn collect(self, mut source: GenerationStream) -> Result<FullResponse, ServeError> {
        let mut outputs: Vec<ChoiceOutput> = Vec::new();
        let mut num_prompt_tokens = 0;
        let mut num_cached_tokens = None;
        let mut request_id = String::new();
        let mut first_step = true;

        while let Some(next) = source.next().await {
            let step = next?;
            // Prompt accounting comes from the first step.
            if first_step {
                first_step = false;
                request_id = step.request_id.clone();
                num_prompt_tokens = step.num_prompt_tokens();
                num_cached_tokens = step.num_cached_tokens;
            }
            for out in step.outputs {
                if outputs.len() <= out.index {
                    outputs.resize_with(out.index + 1, ChoiceOutput::default);
                }
                let choice = &mut outputs[out.index];
                choice.text.push_str(&out.text);
                choice.num_tokens += out.token_ids.len();
                choice.audio_rows.extend(out.mm_token_ids.into_iter().flatten());
                match out.logprobs {
                    Some(lp) => choice.logprobs.extend(lp),
                    None if !out.token_ids.is_empty() => choice.missing_logprobs = true,
                    None => {}
                }
                if out.finish_reason.is_some() {
                    choice.finish_reason = out.finish_reason;
                    choice.stop_reason = out.stop_reason;
                }
            }
        }

        let completion_tokens = outputs.iter().map(|c| c.num_tokens).sum();
        let choices = outputs
            .into_iter()
            .enumerate()
            .map(|(index, output)| self.build_choice(index, output))
            .collect::<Result<Vec<_>, _>>()?;

        let cached = num_cached_tokens.filter(|&n| self.options.enable_prompt_tokens_details && n > 0);
        Ok(FullResponse {
            request_id,
            choices,
            usage: UsageInfo::new(num_prompt_tokens, completion_tokens).with_cached_tokens(cached),
        })
    }

    fn build_choice(&self, index: usize, output: ChoiceOutput) -> Result<FullChoice, ServeError> {
        if self.options.require_logprobs && output.missing_logprobs {
            return Err(ServeError::validation("Did not output logprobs"));
        }

        let (reasoning_content, mut content) = match self.reasoning.as_deref() {
            Some(reasoning) if self.kind.uses_reasoning() => {
                let split = reasoning.extract_reasoning(&output.text);
                (split.reasoning, split.content)
            }
            _ => (None, Some(output.text.clone())),
        };

        let mut tool_calls = Vec::new();
        let mut auto_tools_called = false;
        match &self.kind {
            PipelineKind::NamedTool { name, .. } => {
                tool_calls.push(ToolCall::function(
                    name.clone(),
                    content.take().unwrap_or_default(),
                ));
                content = Some(String::new());
            }
            PipelineKind::RequiredTool { .. } => {
                let text = content.take().unwrap_or_default();
                tool_calls = parse_required_tool_calls(&text).map_err(|e| {
                    ServeError::validation(format!("model output is not a tool call list: {e}"))
                })?;
                content = Some(String::new());
            }
            PipelineKind::ToolOnly | PipelineKind::ReasoningThenTool => {
                if let Some(tools) = self.tools.as_deref() {
                    let extracted = tools.extract_tool_calls(content.as_deref().unwrap_or(""));
                    if extracted.tools_called {
                        auto_tools_called = !extracted.tool_calls.is_empty();
                        tool_calls = extracted.tool_calls;
                        content = extracted.content;
                    }
                }
            }
            PipelineKind::Plain | PipelineKind::ReasoningOnly => {}
        }

        if let Some(echo) = &self.options.echo {
            content = Some(format!("{echo}{}", content.unwrap_or_default()));
        }

        let audio = match &self.codec {
            Some(codec) if !output.audio_rows.is_empty() => {
                let samples = decode_full(&output.audio_rows, codec.as_ref(), self.options.audio_stream)?;
                tracing::debug!(index, samples = samples.len(), "decoded response audio");
                Some(ResponseAudio {
                    id: format!("audio-{}", uuid::Uuid::new_v4().simple()),
                    data: encode_base64(&samples, codec.sample_rate(), self.options.audio_format)?,
                    expires_at: 0,
                    transcript: String::new(),
                })
            }
            _ => None,
        };

        let finish_reason = if auto_tools_called {
            ChoiceFinishReason::ToolCalls
        } else {
            output
                .finish_reason
                .map_or(ChoiceFinishReason::Stop, ChoiceFinishReason::from)
        };

        Ok(FullChoice {
            index,
            message: ResponseMessage {
                role: self.options.role.clone(),
                content,
                reasoning_content,
                tool_calls,
                audio,
            },
            logprobs: self.options.require_logprobs.then_some(output.logprobs),
            finish_reason,
            stop_reason: output.stop_reason,
        })
    }
}
