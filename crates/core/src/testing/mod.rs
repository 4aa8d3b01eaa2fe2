//! Shared test utilities for higgs-core.
//!
//! Scripted engines, deterministic codecs and a recording synthesizer for
//! driving the assembler without a real model.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::audio::{AudioCodec, AudioError, ChunkSynthesizer, SynthesisRequest, SynthesizedAudio};
use crate::config::AudioStreamIds;
use crate::engine::{
    AudioRow, CompletionOutput, EngineClient, EngineError, FinishReason, GenerationRequest,
    GenerationStream, RequestOutput,
};
use crate::request::{EngineCoreRequest, RequestEventKind, RequestRecord, RequestStatus};

// ─── Step builders ────────────────────────────────────────────────────────

pub fn text_step(index: usize, text: &str, token_ids: &[u32]) -> CompletionOutput {
    CompletionOutput {
        index,
        text: text.to_string(),
        token_ids: token_ids.to_vec(),
        ..Default::default()
    }
}

pub fn finish_step(
    index: usize,
    text: &str,
    token_ids: &[u32],
    reason: FinishReason,
) -> CompletionOutput {
    CompletionOutput {
        finish_reason: Some(reason),
        ..text_step(index, text, token_ids)
    }
}

/// A step that carries audio rows alongside one text token.
pub fn audio_step(index: usize, token_id: u32, rows: Vec<AudioRow>) -> CompletionOutput {
    CompletionOutput {
        mm_token_ids: Some(rows),
        ..text_step(index, "", &[token_id])
    }
}

/// One scripted engine step.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Outputs(Vec<CompletionOutput>),
    Fail(EngineError),
}

impl From<Vec<CompletionOutput>> for ScriptStep {
    fn from(outputs: Vec<CompletionOutput>) -> Self {
        Self::Outputs(outputs)
    }
}

impl From<CompletionOutput> for ScriptStep {
    fn from(output: CompletionOutput) -> Self {
        Self::Outputs(vec![output])
    }
}

// ─── Scripted engine ──────────────────────────────────────────────────────

/// Engine that replays one queued script per `generate` call.
///
/// Each choice is tracked in a [`RequestRecord`] so `finished` and audio
/// bookkeeping behave like a real engine's.
pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    aborted: Mutex<Vec<String>>,
    prompt_token_ids: Vec<u32>,
    num_cached_tokens: Option<usize>,
}

impl ScriptedEngine {
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            prompt_token_ids,
            num_cached_tokens: None,
        }
    }

    pub fn with_cached_tokens(mut self, cached: usize) -> Self {
        self.num_cached_tokens = Some(cached);
        self
    }

    pub fn push_script<S: Into<ScriptStep>>(&self, steps: impl IntoIterator<Item = S>) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(steps.into_iter().map(Into::into).collect());
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap().clone()
    }

    fn replay(&self, request: &GenerationRequest, script: Vec<ScriptStep>) -> Vec<Result<RequestOutput, EngineError>> {
        let mut records: Vec<RequestRecord> = (0..request.n)
            .map(|i| {
                let mut record = RequestRecord::from_engine_core_request(EngineCoreRequest {
                    request_id: format!("{}-{i}", request.request_id),
                    prompt_token_ids: self.prompt_token_ids.clone(),
                    max_tokens: request.max_tokens.unwrap_or(usize::MAX),
                    ..Default::default()
                })
                .unwrap();
                record.record_event(RequestEventKind::Queued, None);
                record
            })
            .collect();

        let mut items = Vec::new();
        for step in script {
            let outputs = match step {
                ScriptStep::Fail(e) => {
                    items.push(Err(e));
                    break;
                }
                ScriptStep::Outputs(outputs) => outputs,
            };
            for out in &outputs {
                let record = &mut records[out.index];
                if record.status == RequestStatus::Waiting {
                    record.status = RequestStatus::Running;
                    record.record_event(RequestEventKind::Scheduled, None);
                }
                record.append_output_tokens(&out.token_ids);
                for row in out.mm_token_ids.iter().flatten() {
                    record
                        .append_audio_token_row(row.clone(), AudioStreamIds::default())
                        .unwrap();
                }
                record.status = match out.finish_reason {
                    Some(FinishReason::Stop) => RequestStatus::FinishedStopped,
                    Some(FinishReason::Length) => RequestStatus::FinishedLengthCapped,
                    Some(FinishReason::Abort) => RequestStatus::FinishedAborted,
                    None => record.status,
                };
            }
            items.push(Ok(RequestOutput {
                request_id: request.request_id.clone(),
                prompt_token_ids: self.prompt_token_ids.clone(),
                encoder_prompt_token_ids: None,
                num_cached_tokens: self.num_cached_tokens,
                outputs,
                finished: records.iter().all(RequestRecord::is_finished),
            }));
        }
        items
    }
}

#[async_trait]
impl EngineClient for ScriptedEngine {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, EngineError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| EngineError::Generation("no script queued".into()))?;
        let items = self.replay(&request, script);
        self.requests.lock().unwrap().push(request);
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn abort(&self, request_id: &str) -> Result<(), EngineError> {
        self.aborted.lock().unwrap().push(request_id.to_string());
        Ok(())
    }
}

// ─── Audio ────────────────────────────────────────────────────────────────

/// Codec that turns every timestep into `samples_per_token` copies of the
/// first codebook's value scaled into `[0, 1)`.
pub struct StepCodec {
    num_codebooks: usize,
    samples_per_token: usize,
}

impl StepCodec {
    pub fn new(num_codebooks: usize, samples_per_token: usize) -> Self {
        Self {
            num_codebooks,
            samples_per_token,
        }
    }
}

impl AudioCodec for StepCodec {
    fn num_codebooks(&self) -> usize {
        self.num_codebooks
    }

    fn codebook_size(&self) -> usize {
        1024
    }

    fn tokens_per_second(&self) -> usize {
        25
    }

    fn sample_rate(&self) -> u32 {
        (25 * self.samples_per_token) as u32
    }

    fn decode(&self, codes: &[Vec<i64>]) -> Result<Vec<f32>, AudioError> {
        let first = codes
            .first()
            .ok_or_else(|| AudioError::Decode("no codebooks".into()))?;
        Ok(first
            .iter()
            .flat_map(|&c| {
                std::iter::repeat(c as f32 / self.codebook_size() as f32).take(self.samples_per_token)
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthCall {
    /// Rows in the buffer when the call was made.
    pub buffered: usize,
    pub chunk_len: usize,
    pub finalize: bool,
    pub had_fade_tail: bool,
}

/// Synthesizer that records each call and returns one silent sample per row.
#[derive(Default)]
pub struct RecordingSynthesizer {
    calls: Mutex<Vec<SynthCall>>,
}

impl RecordingSynthesizer {
    pub fn calls(&self) -> Vec<SynthCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ChunkSynthesizer for RecordingSynthesizer {
    fn sample_rate(&self) -> u32 {
        100
    }

    fn synthesize(&self, request: SynthesisRequest<'_>) -> Result<SynthesizedAudio, AudioError> {
        self.calls.lock().unwrap().push(SynthCall {
            buffered: request.rows.len(),
            chunk_len: request.chunk_len,
            finalize: request.finalize,
            had_fade_tail: request.fade_tail.is_some(),
        });
        Ok(SynthesizedAudio {
            samples: vec![0.0; request.chunk_len],
            fade_tail: (!request.finalize).then(|| vec![0.0; 2]),
        })
    }
}

/// Shared handle type used by tests that also inspect the synthesizer.
pub fn recording_synthesizer() -> Arc<RecordingSynthesizer> {
    Arc::new(RecordingSynthesizer::default())
}
