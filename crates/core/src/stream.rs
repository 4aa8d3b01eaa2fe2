//! Incremental response assembly.
//!
//! [`StreamAssembler`] consumes the engine's per-step outputs for one request
//! and produces ordered [`DeltaFrame`]s per choice. All per-choice state is
//! owned by the assembler and only touched between pulls from the engine.

use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::audio::{AudioChunk, AudioChunker, AudioError};
use crate::engine::{
    AudioRow, CompletionOutput, FinishReason, GenerationStream, RequestOutput, TokenLogprob,
    AUDIO_SEGMENT_SENTINEL,
};
use crate::error::ServeError;
use crate::extract::{ChoicePipeline, DeltaMessage, DeltaToolCall, ToolCallExtractor};
use crate::protocol::UsageInfo;

/// Finish reason as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceFinishReason {
    Stop,
    Length,
    Abort,
    ToolCalls,
}

impl ChoiceFinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Abort => "abort",
            Self::ToolCalls => "tool_calls",
        }
    }
}

impl From<FinishReason> for ChoiceFinishReason {
    fn from(reason: FinishReason) -> Self {
        match reason {
            FinishReason::Stop => Self::Stop,
            FinishReason::Length => Self::Length,
            FinishReason::Abort => Self::Abort,
        }
    }
}

/// One emitted unit for one choice.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaFrame {
    pub choice_index: usize,
    pub delta: DeltaMessage,
    pub logprobs: Option<Vec<TokenLogprob>>,
    pub finish_reason: Option<ChoiceFinishReason>,
    pub stop_reason: Option<serde_json::Value>,
    /// Running usage, present only with continuous usage stats.
    pub usage: Option<UsageInfo>,
}

impl DeltaFrame {
    fn new(choice_index: usize, delta: DeltaMessage) -> Self {
        Self {
            choice_index,
            delta,
            logprobs: None,
            finish_reason: None,
            stop_reason: None,
            usage: None,
        }
    }
}

/// Items produced by [`StreamAssembler::into_stream`]. `Done` is always last.
#[derive(Debug)]
pub enum StreamItem {
    Frame(DeltaFrame),
    /// Final usage summary, not tied to any choice.
    Usage(UsageInfo),
    Error(ServeError),
    Done,
}

/// Request-level knobs for the assembler.
#[derive(Debug, Clone, Default)]
pub struct AssemblerOptions {
    /// Role announced in the first frame of every choice.
    pub role: String,
    /// Text echoed right after the role frame.
    pub echo: Option<String>,
    pub include_usage: bool,
    pub include_continuous_usage: bool,
    pub enable_prompt_tokens_details: bool,
    /// Fail steps that come back without logprobs.
    pub require_logprobs: bool,
}

/// Per-choice streaming state.
pub struct ChoiceStreamState {
    pipeline: ChoicePipeline,
    chunker: Option<AudioChunker>,
    num_output_tokens: usize,
    first_frame_sent: bool,
    finished: bool,
}

impl ChoiceStreamState {
    pub fn new(pipeline: ChoicePipeline, chunker: Option<AudioChunker>) -> Self {
        Self {
            pipeline,
            chunker,
            num_output_tokens: 0,
            first_frame_sent: false,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn num_output_tokens(&self) -> usize {
        self.num_output_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Init,
    Streaming,
    Done,
}

pub struct StreamAssembler {
    options: AssemblerOptions,
    choices: Vec<ChoiceStreamState>,
    state: AssemblerState,
    num_prompt_tokens: usize,
    num_cached_tokens: Option<usize>,
}

impl StreamAssembler {
    pub fn new(options: AssemblerOptions, choices: Vec<ChoiceStreamState>) -> Self {
        Self {
            options,
            choices,
            state: AssemblerState::Init,
            num_prompt_tokens: 0,
            num_cached_tokens: None,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn choices(&self) -> &[ChoiceStreamState] {
        &self.choices
    }

    /// Turn one engine step into frames.
    pub fn on_output(&mut self, output: &RequestOutput) -> Result<Vec<DeltaFrame>, ServeError> {
        let mut frames = Vec::new();

        if self.state == AssemblerState::Init {
            self.num_prompt_tokens = output.num_prompt_tokens();
            self.num_cached_tokens = output.num_cached_tokens;
            self.state = AssemblerState::Streaming;
            for index in 0..self.choices.len() {
                self.push_opening_frames(index, &mut frames);
            }
        }

        for step in &output.outputs {
            let Some(choice) = self.choices.get_mut(step.index) else {
                tracing::warn!(index = step.index, "engine output for unknown choice");
                continue;
            };
            if choice.finished {
                continue;
            }
            if let Some(frame) = step_choice(&self.options, self.num_prompt_tokens, choice, step)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Close the stream after the engine is exhausted: flush pending audio
    /// and report usage.
    pub fn finish(&mut self) -> Result<Vec<StreamItem>, ServeError> {
        let mut items = Vec::new();
        for (index, choice) in self.choices.iter_mut().enumerate() {
            if choice.finished {
                continue;
            }
            let Some(chunker) = choice.chunker.as_mut() else {
                continue;
            };
            if let Some(chunk) = chunker.flush()? {
                let mut frame = DeltaFrame::new(
                    index,
                    DeltaMessage {
                        audio: Some(chunk),
                        ..Default::default()
                    },
                );
                frame.usage = self
                    .options
                    .include_continuous_usage
                    .then(|| UsageInfo::new(self.num_prompt_tokens, choice.num_output_tokens));
                items.push(StreamItem::Frame(frame));
            }
        }

        if self.options.include_usage {
            items.push(StreamItem::Usage(self.usage()));
        }
        self.state = AssemblerState::Done;
        Ok(items)
    }

    /// Usage summed over every choice.
    pub fn usage(&self) -> UsageInfo {
        let completion = self.choices.iter().map(|c| c.num_output_tokens).sum();
        let cached = self
            .num_cached_tokens
            .filter(|&n| self.options.enable_prompt_tokens_details && n > 0);
        UsageInfo::new(self.num_prompt_tokens, completion).with_cached_tokens(cached)
    }

    /// Drive the assembler over an engine stream. The output always ends
    /// with [`StreamItem::Done`].
    pub fn into_stream(mut self, mut source: GenerationStream) -> impl Stream<Item = StreamItem> + Send {
        async_stream::stream! {
            let mut failure = None;
            while let Some(next) = source.next().await {
                match next.map_err(ServeError::from).and_then(|out| self.on_output(&out)) {
                    Ok(frames) => {
                        for frame in frames {
                            yield StreamItem::Frame(frame);
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            match failure {
                Some(ServeError::ClientDisconnected) => {
                    tracing::info!("client disconnected, abandoning stream");
                    yield StreamItem::Error(ServeError::ClientDisconnected);
                }
                Some(e) => {
                    tracing::error!(error = %e, "error in chat completion stream");
                    yield StreamItem::Error(e);
                }
                None => match self.finish() {
                    Ok(items) => {
                        for item in items {
                            yield item;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "error closing chat completion stream");
                        yield StreamItem::Error(e);
                    }
                },
            }
            yield StreamItem::Done;
        }
    }

    fn push_opening_frames(&mut self, index: usize, frames: &mut Vec<DeltaFrame>) {
        let usage = self
            .options
            .include_continuous_usage
            .then(|| UsageInfo::new(self.num_prompt_tokens, 0));
        let choice = &mut self.choices[index];
        if choice.first_frame_sent {
            return;
        }
        choice.first_frame_sent = true;

        let mut role = DeltaFrame::new(
            index,
            DeltaMessage {
                role: Some(self.options.role.clone()),
                content: Some(String::new()),
                ..Default::default()
            },
        );
        role.usage = usage.clone();
        frames.push(role);

        if let Some(echo) = &self.options.echo {
            let mut frame = DeltaFrame::new(index, DeltaMessage::content(echo.clone()));
            frame.usage = usage;
            frames.push(frame);
        }
    }
}

/// Run one step for one unfinished choice.
fn step_choice(
    options: &AssemblerOptions,
    num_prompt_tokens: usize,
    choice: &mut ChoiceStreamState,
    step: &CompletionOutput,
) -> Result<Option<DeltaFrame>, ServeError> {
    let audio = match choice.chunker.as_mut() {
        Some(chunker) => advance_audio(chunker, step.mm_token_ids.as_deref())?,
        None => None,
    };

    if step.text.is_empty()
        && step.token_ids.is_empty()
        && choice.num_output_tokens == 0
        && step.finish_reason.is_none()
        && audio.is_none()
    {
        tracing::debug!(index = step.index, "skipping empty step");
        return Ok(None);
    }

    if options.require_logprobs && step.logprobs.is_none() {
        return Err(ServeError::validation("Did not output logprobs"));
    }

    choice.num_output_tokens += step.token_ids.len();
    let mut delta = choice.pipeline.step(&step.text, &step.token_ids);
    if let Some(chunk) = audio {
        delta.get_or_insert_with(DeltaMessage::default).audio = Some(chunk);
    }

    let (delta, finish) = match step.finish_reason {
        Some(reason) => {
            let mut delta = delta.unwrap_or_default();
            let streamed_arguments = delta.tool_calls.iter().any(|c| c.arguments.is_some());
            if let Some(tools) = choice
                .pipeline
                .tool_extractor()
                .filter(|_| streamed_arguments && choice.pipeline.auto_tools_called())
            {
                reconcile_tool_arguments(tools, &mut delta);
            }
            if let Some(chunk) = choice.chunker.as_mut().map(AudioChunker::flush).transpose()?.flatten() {
                match delta.audio.as_mut() {
                    Some(audio) => audio.append(chunk),
                    None => delta.audio = Some(chunk),
                }
            }
            choice.finished = true;

            let reason = if choice.pipeline.auto_tools_called() {
                ChoiceFinishReason::ToolCalls
            } else {
                reason.into()
            };
            (delta, Some(reason))
        }
        None => match delta.filter(|d| !d.is_empty()) {
            Some(delta) => (delta, None),
            None => {
                tracing::debug!(index = step.index, "suppressing empty delta");
                return Ok(None);
            }
        },
    };

    Ok(Some(DeltaFrame {
        choice_index: step.index,
        delta,
        logprobs: if options.require_logprobs {
            step.logprobs.clone()
        } else {
            None
        },
        finish_reason: finish,
        stop_reason: finish.and(step.stop_reason.clone()),
        usage: options
            .include_continuous_usage
            .then(|| UsageInfo::new(num_prompt_tokens, choice.num_output_tokens)),
    }))
}

/// Feed this step's rows to the chunker. A step without rows ends the
/// current segment, as does a sentinel row.
fn advance_audio(
    chunker: &mut AudioChunker,
    rows: Option<&[AudioRow]>,
) -> Result<Option<AudioChunk>, AudioError> {
    let rows = match rows {
        Some(rows) if !rows.is_empty() => rows,
        _ if chunker.is_empty() => return Ok(None),
        _ => return chunker.end_segment(),
    };

    let mut out: Option<AudioChunk> = None;
    let mut collect = |chunk: Option<AudioChunk>| {
        if let Some(chunk) = chunk {
            match out.as_mut() {
                Some(existing) => existing.append(chunk),
                None => out = Some(chunk),
            }
        }
    };

    let mut pending = Vec::new();
    for row in rows {
        if row.first() == Some(&AUDIO_SEGMENT_SENTINEL) {
            collect(chunker.feed(std::mem::take(&mut pending))?);
            collect(chunker.end_segment()?);
        } else {
            pending.push(row.clone());
        }
    }
    if !pending.is_empty() {
        collect(chunker.feed(pending)?);
    }
    Ok(out)
}

/// Make the argument fragments of the last tool add up to the extractor's
/// final parsed arguments.
///
/// The step's own fragment is already counted in the extractor's streamed
/// text, so it is replaced by whatever is still missing.
fn reconcile_tool_arguments(tools: &dyn ToolCallExtractor, delta: &mut DeltaMessage) {
    let Some(index) = tools.prev_tool_calls().len().checked_sub(1) else {
        return;
    };
    let expected = tools.prev_tool_calls()[index].arguments.as_str();
    let streamed = tools.streamed_args().get(index).map_or("", String::as_str);

    let latest: usize = delta
        .tool_calls
        .iter()
        .filter(|c| c.index == index)
        .filter_map(|c| c.arguments.as_deref())
        .map(str::len)
        .sum();
    let actual = streamed
        .get(..streamed.len().saturating_sub(latest))
        .unwrap_or("");
    let Some(remaining) = expected.strip_prefix(actual).map(str::to_string) else {
        tracing::warn!(
            index,
            streamed = actual,
            expected,
            "streamed tool arguments diverge from parsed arguments, not reconciling"
        );
        return;
    };

    delta.tool_calls.retain_mut(|call| {
        if call.index != index {
            return true;
        }
        call.arguments = None;
        call.id.is_some() || call.name.is_some()
    });
    if remaining.is_empty() {
        return;
    }
    match delta.tool_calls.iter_mut().find(|c| c.index == index) {
        Some(call) => call.arguments = Some(remaining),
        None => delta
            .tool_calls
            .push(DeltaToolCall::arguments(index, remaining)),
    }
}
