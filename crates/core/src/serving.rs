//! Per-request binding of configuration and capabilities.
//!
//! [`ChatServing`] validates a [`ChatRequest`], picks the extraction
//! variant once, instantiates fresh extractors and audio chunkers for every
//! choice, and hands the engine stream to the assembler or the aggregator.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;

use crate::aggregate::{AggregateOptions, FullAggregator, FullResponse};
use crate::audio::{
    AudioChunker, AudioCodec, AudioFormat, ChunkSynthesizer, ChunkerConfig, CodecSynthesizer,
};
use crate::config::ServingConfig;
use crate::engine::{EngineClient, GenerationRequest};
use crate::error::ServeError;
use crate::extract::{
    ChoicePipeline, PipelineKind, ReasoningExtractorFactory, ToolExtractorFactory,
};
use crate::protocol::{ChatRequest, ToolChoiceMode};
use crate::stream::{AssemblerOptions, ChoiceStreamState, StreamAssembler, StreamItem};

/// Output of [`ChatServing::stream`]. Always ends with [`StreamItem::Done`].
pub type ChatStream = Pin<Box<dyn Stream<Item = StreamItem> + Send>>;

pub struct StreamingResponse {
    pub request_id: String,
    pub stream: ChatStream,
}

/// Codec plus the synthesizer used for streamed chunks.
#[derive(Clone)]
struct AudioBackend {
    codec: Arc<dyn AudioCodec>,
    synthesizer: Arc<dyn ChunkSynthesizer>,
}

#[derive(Clone)]
pub struct ChatServing {
    config: ServingConfig,
    engine: Arc<dyn EngineClient>,
    audio: Option<AudioBackend>,
    reasoning: Option<Arc<dyn ReasoningExtractorFactory>>,
    tools: Option<Arc<dyn ToolExtractorFactory>>,
}

impl ChatServing {
    pub fn new(config: ServingConfig, engine: Arc<dyn EngineClient>) -> Self {
        Self {
            config,
            engine,
            audio: None,
            reasoning: None,
            tools: None,
        }
    }

    /// Enable audio output, synthesizing streamed chunks with the codec itself.
    pub fn with_codec(self, codec: Arc<dyn AudioCodec>) -> Self {
        let synthesizer = Arc::new(CodecSynthesizer::new(
            codec.clone(),
            self.config.crossfade_samples,
            self.config.audio_stream,
        ));
        self.with_audio(codec, synthesizer)
    }

    pub fn with_audio(
        mut self,
        codec: Arc<dyn AudioCodec>,
        synthesizer: Arc<dyn ChunkSynthesizer>,
    ) -> Self {
        self.audio = Some(AudioBackend { codec, synthesizer });
        self
    }

    pub fn with_reasoning(mut self, factory: Arc<dyn ReasoningExtractorFactory>) -> Self {
        self.reasoning = Some(factory);
        self
    }

    pub fn with_tools(mut self, factory: Arc<dyn ToolExtractorFactory>) -> Self {
        self.tools = Some(factory);
        self
    }

    pub fn config(&self) -> &ServingConfig {
        &self.config
    }

    pub fn engine(&self) -> Arc<dyn EngineClient> {
        self.engine.clone()
    }

    /// Reject requests that cannot be served before anything is generated.
    pub fn validate(&self, request: &ChatRequest) -> Result<(), ServeError> {
        if request.messages.is_empty() {
            return Err(ServeError::validation("messages must not be empty"));
        }
        if request.n == 0 {
            return Err(ServeError::validation("n must be at least 1"));
        }
        if request.logprobs && request.top_logprobs.is_some_and(|k| k > 20) {
            return Err(ServeError::validation("top_logprobs must be between 0 and 20"));
        }

        match request.tool_choice_mode() {
            Some(ToolChoiceMode::Auto)
                if !(self.config.enable_auto_tools && self.tools.is_some()) =>
            {
                return Err(ServeError::validation(
                    "\"auto\" tool choice requires enable_auto_tools and a tool_call_parser to be set",
                ));
            }
            Some(ToolChoiceMode::Required) if !request.has_tools() => {
                return Err(ServeError::validation(
                    "tool_choice \"required\" requires tools to be provided",
                ));
            }
            _ => {}
        }
        if let Some(name) = request.named_tool() {
            let known = request
                .tools
                .iter()
                .flatten()
                .any(|t| t.function.name == name);
            if !known {
                return Err(ServeError::validation(format!(
                    "tool_choice names function {name:?} which is not in tools"
                )));
            }
        }

        self.audio_format(request)?;
        if request.stream {
            if let Some(config) = self.chunker_config(request) {
                config
                    .validate()
                    .map_err(|e| ServeError::validation(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Pick the extraction variant for a request.
    pub fn pipeline_kind(&self, request: &ChatRequest) -> PipelineKind {
        let reasoning = self.config.enable_reasoning && self.reasoning.is_some();
        if let Some(name) = request.named_tool() {
            return PipelineKind::NamedTool {
                name: name.to_string(),
                reasoning,
            };
        }
        let mode = request.tool_choice_mode();
        if mode == Some(ToolChoiceMode::Required) && request.has_tools() {
            return PipelineKind::RequiredTool { reasoning };
        }
        let auto_tools = request.has_tools()
            && self.tools.is_some()
            && self.config.enable_auto_tools
            && matches!(mode, None | Some(ToolChoiceMode::Auto));
        match (reasoning, auto_tools) {
            (true, true) => PipelineKind::ReasoningThenTool,
            (false, true) => PipelineKind::ToolOnly,
            (true, false) => PipelineKind::ReasoningOnly,
            (false, false) => PipelineKind::Plain,
        }
    }

    /// Role announced for the response.
    pub fn role_for(&self, request: &ChatRequest) -> String {
        if request.add_generation_prompt {
            return self.config.response_role.clone();
        }
        request
            .last_message()
            .map_or_else(|| self.config.response_role.clone(), |m| m.role.clone())
    }

    /// Text echoed back for `echo` requests: the last message's content when
    /// it belongs to the announced role.
    pub fn echo_text(&self, request: &ChatRequest, role: &str) -> Option<String> {
        if !request.echo {
            return None;
        }
        let last = request.last_message().filter(|m| m.role == role)?;
        let text = last.content.as_ref()?.as_text();
        (!text.is_empty()).then_some(text)
    }

    fn audio_format(&self, request: &ChatRequest) -> Result<AudioFormat, ServeError> {
        let format = request.audio.as_ref().and_then(|a| a.format.as_deref());
        AudioFormat::parse_optional(format).map_err(|e| ServeError::validation(e.to_string()))
    }

    fn chunker_config(&self, request: &ChatRequest) -> Option<ChunkerConfig> {
        let backend = self.audio.as_ref()?;
        let per_second = backend.codec.tokens_per_second();
        let options = request.audio.as_ref();
        Some(ChunkerConfig {
            chunk_size: options
                .and_then(|a| a.audio_chunk_size)
                .or(self.config.audio_chunk_size)
                .unwrap_or(per_second),
            overlap_size: options
                .and_then(|a| a.audio_chunk_overlap_size)
                .or(self.config.audio_chunk_overlap_size)
                .unwrap_or(per_second),
            num_codebooks: backend.codec.num_codebooks(),
        })
    }

    fn generation_request(&self, request: &ChatRequest) -> GenerationRequest {
        GenerationRequest {
            request_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            messages: request.messages.clone(),
            tools: request.tools.clone().unwrap_or_default(),
            add_generation_prompt: request.add_generation_prompt,
            n: request.n,
            max_tokens: request.max_tokens,
            logprobs: request.top_logprobs.filter(|_| request.logprobs),
            structured_output: matches!(request.tool_choice_mode(), Some(ToolChoiceMode::Required))
                || request.named_tool().is_some(),
        }
    }

    fn build_choices(
        &self,
        request: &ChatRequest,
        kind: &PipelineKind,
    ) -> Result<Vec<ChoiceStreamState>, ServeError> {
        let chunker_config = self.chunker_config(request);
        (0..request.n)
            .map(|_| -> Result<ChoiceStreamState, ServeError> {
                let pipeline = ChoicePipeline::build(
                    kind,
                    request,
                    self.reasoning.as_deref(),
                    self.tools.as_deref(),
                )?;
                let chunker = match (chunker_config, &self.audio) {
                    (Some(config), Some(backend)) => {
                        Some(AudioChunker::new(config, backend.synthesizer.clone())?)
                    }
                    _ => None,
                };
                Ok(ChoiceStreamState::new(pipeline, chunker))
            })
            .collect()
    }

    /// Start a streaming completion.
    ///
    /// Request validation and engine admission failures are returned as
    /// errors. Once a stream is returned, every failure is reported inside it.
    pub async fn stream(&self, request: &ChatRequest) -> Result<StreamingResponse, ServeError> {
        self.validate(request)?;
        let kind = self.pipeline_kind(request);
        let generation = self.generation_request(request);
        let request_id = generation.request_id.clone();
        tracing::debug!(%request_id, ?kind, n = request.n, "starting chat stream");

        let choices = match self.build_choices(request, &kind) {
            Ok(choices) => choices,
            Err(e) => {
                tracing::error!(%request_id, error = %e, "failed to set up chat stream");
                let items = vec![StreamItem::Error(e), StreamItem::Done];
                return Ok(StreamingResponse {
                    request_id,
                    stream: Box::pin(futures::stream::iter(items)),
                });
            }
        };

        let role = self.role_for(request);
        let options = AssemblerOptions {
            echo: self.echo_text(request, &role),
            role,
            include_usage: request.include_usage(),
            include_continuous_usage: request.include_continuous_usage(),
            enable_prompt_tokens_details: self.config.enable_prompt_tokens_details,
            require_logprobs: request.wants_logprobs(),
        };

        let source = self.engine.generate(generation).await?;
        let assembler = StreamAssembler::new(options, choices);
        Ok(StreamingResponse {
            request_id,
            stream: Box::pin(assembler.into_stream(source)),
        })
    }

    /// Run a completion to the end and return the whole response.
    pub async fn complete(&self, request: &ChatRequest) -> Result<FullResponse, ServeError> {
        self.validate(request)?;
        let kind = self.pipeline_kind(request);

        let reasoning = match self.reasoning.as_deref() {
            Some(factory) if kind.uses_reasoning() => {
                Some(factory.create(request).map_err(|e| ServeError::ExtractorSetup {
                    kind: "reasoning",
                    message: e.to_string(),
                })?)
            }
            _ => None,
        };
        let tools = match self.tools.as_deref() {
            Some(factory) if kind.uses_tool_extractor() => {
                Some(factory.create(request).map_err(|e| ServeError::ExtractorSetup {
                    kind: "tool",
                    message: e.to_string(),
                })?)
            }
            _ => None,
        };

        let role = self.role_for(request);
        let options = AggregateOptions {
            echo: self.echo_text(request, &role),
            role,
            require_logprobs: request.wants_logprobs(),
            enable_prompt_tokens_details: self.config.enable_prompt_tokens_details,
            audio_format: self.audio_format(request)?,
            audio_stream: self.config.audio_stream,
        };

        let generation = self.generation_request(request);
        let request_id = generation.request_id.clone();
        tracing::debug!(%request_id, ?kind, n = request.n, "starting chat completion");
        let source = self.engine.generate(generation).await?;

        let codec = self.audio.as_ref().map(|a| a.codec.clone());
        let mut response = FullAggregator::new(options, kind, reasoning, tools, codec)
            .collect(source)
            .await?;
        response.request_id = request_id;
        Ok(response)
    }
}
