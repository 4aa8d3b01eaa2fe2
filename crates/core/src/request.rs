//! Per-request lifecycle record.
//!
//! A [`RequestRecord`] is created when the engine admits a request and is
//! mutated on every generation step. Token buffers are owned here and only
//! exposed as borrowed slices, so every append goes through
//! [`RequestRecord::append_output_tokens`] and both buffers stay in sync.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::config::AudioStreamIds;
use crate::engine::{AudioRow, FinishReason, AUDIO_SEGMENT_SENTINEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Waiting,
    WaitingForStructuredOutput,
    Running,
    Preempted,
    FinishedStopped,
    FinishedLengthCapped,
    FinishedAborted,
    FinishedIgnored,
}

const FINISHED_STATES: [RequestStatus; 4] = [
    RequestStatus::FinishedStopped,
    RequestStatus::FinishedLengthCapped,
    RequestStatus::FinishedAborted,
    RequestStatus::FinishedIgnored,
];

impl RequestStatus {
    pub fn is_finished(self) -> bool {
        FINISHED_STATES.contains(&self)
    }

    /// Client-facing reason for a finished state, `None` while still live.
    pub fn finish_reason(self) -> Option<FinishReason> {
        match self {
            Self::FinishedStopped => Some(FinishReason::Stop),
            Self::FinishedLengthCapped | Self::FinishedIgnored => Some(FinishReason::Length),
            Self::FinishedAborted => Some(FinishReason::Abort),
            Self::Waiting
            | Self::WaitingForStructuredOutput
            | Self::Running
            | Self::Preempted => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEventKind {
    Queued,
    Scheduled,
    Preempted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestEvent {
    pub kind: RequestEventKind,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Where a multimodal input sits inside the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderRange {
    pub offset: usize,
    pub length: usize,
}

/// Opaque multimodal payload; only the engine interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiModalInput {
    pub modality: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("{inputs} multimodal inputs but {positions} placeholder positions")]
    PositionsMismatch { inputs: usize, positions: usize },
    #[error("{inputs} multimodal inputs but {hashes} hashes")]
    HashesMismatch { inputs: usize, hashes: usize },
    #[error("audio row has {got} codebooks, request uses {expected}")]
    CodebookWidth { expected: usize, got: usize },
    #[error("audio row has no codebooks")]
    EmptyAudioRow,
}

/// Request as handed over by the engine core on admission.
#[derive(Debug, Clone, Default)]
pub struct EngineCoreRequest {
    pub request_id: String,
    pub prompt_token_ids: Vec<u32>,
    pub mm_inputs: Vec<MultiModalInput>,
    pub mm_hashes: Option<Vec<String>>,
    pub mm_positions: Vec<PlaceholderRange>,
    pub max_tokens: usize,
    pub eos_token_id: Option<u32>,
    pub arrival_time: f64,
    pub structured_output: bool,
}

pub struct RequestRecord {
    pub request_id: String,
    pub status: RequestStatus,
    pub stop_reason: Option<serde_json::Value>,
    pub max_tokens: usize,
    pub eos_token_id: Option<u32>,
    pub arrival_time: f64,
    /// Prompt tokens already processed (chunked prefill).
    pub num_computed_tokens: usize,

    prompt_token_ids: Vec<u32>,
    output_token_ids: Vec<u32>,
    all_token_ids: Vec<u32>,
    spec_token_ids: Vec<u32>,

    mm_inputs: Vec<MultiModalInput>,
    mm_hashes: Option<Vec<String>>,
    mm_positions: Vec<PlaceholderRange>,
    structured_output: bool,

    events: Vec<RequestEvent>,

    audio_num_codebooks: Option<usize>,
    num_audio_delays: usize,
    num_audio_eos: usize,
    output_mm_token_ids: Vec<AudioRow>,
}

impl RequestRecord {
    pub fn from_engine_core_request(request: EngineCoreRequest) -> Result<Self, RequestError> {
        let inputs = request.mm_inputs.len();
        if inputs != request.mm_positions.len() {
            return Err(RequestError::PositionsMismatch {
                inputs,
                positions: request.mm_positions.len(),
            });
        }
        if let Some(hashes) = &request.mm_hashes {
            if hashes.len() != inputs {
                return Err(RequestError::HashesMismatch {
                    inputs,
                    hashes: hashes.len(),
                });
            }
        }

        let status = if request.structured_output {
            RequestStatus::WaitingForStructuredOutput
        } else {
            RequestStatus::Waiting
        };

        Ok(Self {
            request_id: request.request_id,
            status,
            stop_reason: None,
            max_tokens: request.max_tokens,
            eos_token_id: request.eos_token_id,
            arrival_time: request.arrival_time,
            num_computed_tokens: 0,
            all_token_ids: request.prompt_token_ids.clone(),
            prompt_token_ids: request.prompt_token_ids,
            output_token_ids: Vec::new(),
            spec_token_ids: Vec::new(),
            mm_inputs: request.mm_inputs,
            mm_hashes: request.mm_hashes,
            mm_positions: request.mm_positions,
            structured_output: request.structured_output,
            events: Vec::new(),
            audio_num_codebooks: None,
            num_audio_delays: 0,
            num_audio_eos: 0,
            output_mm_token_ids: Vec::new(),
        })
    }

    // ─── Token buffers ────────────────────────────────────────────────────

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    pub fn all_token_ids(&self) -> &[u32] {
        &self.all_token_ids
    }

    pub fn spec_token_ids(&self) -> &[u32] {
        &self.spec_token_ids
    }

    pub fn append_output_tokens(&mut self, token_ids: &[u32]) {
        self.output_token_ids.extend_from_slice(token_ids);
        self.all_token_ids.extend_from_slice(token_ids);
    }

    /// Speculative tokens are proposed fresh every step.
    pub fn set_spec_token_ids(&mut self, token_ids: Vec<u32>) {
        self.spec_token_ids = token_ids;
    }

    pub fn num_tokens(&self) -> usize {
        self.all_token_ids.len()
    }

    pub fn num_tokens_with_spec(&self) -> usize {
        self.all_token_ids.len() + self.spec_token_ids.len()
    }

    pub fn num_output_tokens(&self) -> usize {
        self.output_token_ids.len()
    }

    // ─── Multimodal inputs ────────────────────────────────────────────────

    pub fn mm_inputs(&self) -> &[MultiModalInput] {
        &self.mm_inputs
    }

    pub fn mm_hashes(&self) -> Option<&[String]> {
        self.mm_hashes.as_deref()
    }

    pub fn mm_positions(&self) -> &[PlaceholderRange] {
        &self.mm_positions
    }

    pub fn num_encoder_inputs(&self) -> usize {
        self.mm_inputs.len()
    }

    /// Encoder tokens occupied by one multimodal input.
    pub fn num_encoder_tokens(&self, input_id: usize) -> Option<usize> {
        self.mm_positions.get(input_id).map(|p| p.length)
    }

    pub fn use_structured_output(&self) -> bool {
        self.structured_output
    }

    // ─── Status ───────────────────────────────────────────────────────────

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.status.finish_reason()
    }

    // ─── Events ───────────────────────────────────────────────────────────

    /// Record an event at `timestamp`, or now when not given.
    pub fn record_event(&mut self, kind: RequestEventKind, timestamp: Option<f64>) {
        let timestamp = timestamp.unwrap_or_else(now_secs);
        self.events.push(RequestEvent { kind, timestamp });
    }

    /// Drain recorded events. Returns `None` when nothing was recorded since
    /// the last call.
    pub fn take_events(&mut self) -> Option<Vec<RequestEvent>> {
        if self.events.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.events))
    }

    // ─── Audio delay-pattern bookkeeping ──────────────────────────────────

    pub fn audio_num_codebooks(&self) -> Option<usize> {
        self.audio_num_codebooks
    }

    pub fn num_audio_delays(&self) -> usize {
        self.num_audio_delays
    }

    pub fn num_audio_eos(&self) -> usize {
        self.num_audio_eos
    }

    pub fn output_mm_token_ids(&self) -> &[AudioRow] {
        &self.output_mm_token_ids
    }

    /// Track one step of audio output.
    ///
    /// A sentinel row ends the current audio segment and resets all audio
    /// state except the codebook count. Empty rows are rejected. Otherwise the
    /// row is kept; the first `audio_num_codebooks` rows count as delay
    /// warm-up, and later rows raise `num_audio_eos` to one past the last
    /// codebook that reported end of stream.
    pub fn append_audio_token_row(
        &mut self,
        row: AudioRow,
        ids: AudioStreamIds,
    ) -> Result<(), RequestError> {
        if row.first() == Some(&AUDIO_SEGMENT_SENTINEL) {
            self.num_audio_eos = 0;
            self.num_audio_delays = 0;
            self.output_mm_token_ids.clear();
            return Ok(());
        }
        if row.is_empty() {
            return Err(RequestError::EmptyAudioRow);
        }

        let num_codebooks = *self.audio_num_codebooks.get_or_insert(row.len());
        if row.len() != num_codebooks {
            return Err(RequestError::CodebookWidth {
                expected: num_codebooks,
                got: row.len(),
            });
        }

        if self.num_audio_delays < num_codebooks {
            self.num_audio_delays += 1;
        } else if self.num_audio_eos < num_codebooks {
            if let Some(last_eos) = row.iter().rposition(|&t| t == ids.eos) {
                self.num_audio_eos = self.num_audio_eos.max(last_eos + 1);
            }
        }
        self.output_mm_token_ids.push(row);
        Ok(())
    }

    /// All codebooks have reported end of stream for the current segment.
    pub fn audio_stream_ended(&self) -> bool {
        self.audio_num_codebooks
            .is_some_and(|c| c > 0 && self.num_audio_eos >= c)
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDS: AudioStreamIds = AudioStreamIds { bos: 1024, eos: 1025 };

    fn record() -> RequestRecord {
        RequestRecord::from_engine_core_request(EngineCoreRequest {
            request_id: "req-0".into(),
            prompt_token_ids: vec![1, 2, 3],
            max_tokens: 16,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn status_is_finished() {
        assert!(!RequestStatus::Waiting.is_finished());
        assert!(!RequestStatus::WaitingForStructuredOutput.is_finished());
        assert!(!RequestStatus::Running.is_finished());
        assert!(!RequestStatus::Preempted.is_finished());
        assert!(RequestStatus::FinishedStopped.is_finished());
        assert!(RequestStatus::FinishedLengthCapped.is_finished());
        assert!(RequestStatus::FinishedAborted.is_finished());
        assert!(RequestStatus::FinishedIgnored.is_finished());
    }

    #[test]
    fn finished_states_map_to_reasons() {
        assert_eq!(RequestStatus::FinishedStopped.finish_reason(), Some(FinishReason::Stop));
        assert_eq!(
            RequestStatus::FinishedLengthCapped.finish_reason(),
            Some(FinishReason::Length)
        );
        assert_eq!(RequestStatus::FinishedIgnored.finish_reason(), Some(FinishReason::Length));
        assert_eq!(RequestStatus::FinishedAborted.finish_reason(), Some(FinishReason::Abort));
        assert_eq!(RequestStatus::Running.finish_reason(), None);
    }

    #[test]
    fn append_keeps_buffers_in_sync() {
        let mut req = record();
        req.append_output_tokens(&[10, 11]);
        req.append_output_tokens(&[12]);
        assert_eq!(req.output_token_ids(), &[10, 11, 12]);
        assert_eq!(req.all_token_ids(), &[1, 2, 3, 10, 11, 12]);
        assert_eq!(req.prompt_token_ids(), &[1, 2, 3]);
        assert_eq!(req.num_tokens(), 6);
        assert_eq!(req.num_output_tokens(), 3);
    }

    #[test]
    fn spec_tokens_are_replaced_not_appended() {
        let mut req = record();
        req.set_spec_token_ids(vec![5, 6]);
        req.set_spec_token_ids(vec![7]);
        assert_eq!(req.spec_token_ids(), &[7]);
        assert_eq!(req.num_tokens_with_spec(), 4);
    }

    #[test]
    fn take_events_drains_once() {
        let mut req = record();
        req.record_event(RequestEventKind::Queued, Some(1.0));
        req.record_event(RequestEventKind::Scheduled, None);

        let events = req.take_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, RequestEventKind::Queued);
        assert_eq!(events[0].timestamp, 1.0);
        assert!(events[1].timestamp > 1.0);

        assert!(req.take_events().is_none());
    }

    #[test]
    fn structured_output_starts_in_waiting_for_structured_output() {
        let req = RequestRecord::from_engine_core_request(EngineCoreRequest {
            structured_output: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(req.status, RequestStatus::WaitingForStructuredOutput);
        assert!(req.use_structured_output());
    }

    #[test]
    fn multimodal_lengths_are_checked() {
        let input = MultiModalInput {
            modality: "audio".into(),
            data: vec![0; 4],
        };
        let err = RequestRecord::from_engine_core_request(EngineCoreRequest {
            mm_inputs: vec![input.clone()],
            ..Default::default()
        })
        .err();
        assert_eq!(
            err,
            Some(RequestError::PositionsMismatch {
                inputs: 1,
                positions: 0
            })
        );

        let err = RequestRecord::from_engine_core_request(EngineCoreRequest {
            mm_inputs: vec![input.clone()],
            mm_positions: vec![PlaceholderRange { offset: 0, length: 8 }],
            mm_hashes: Some(vec![]),
            ..Default::default()
        })
        .err();
        assert_eq!(err, Some(RequestError::HashesMismatch { inputs: 1, hashes: 0 }));

        let req = RequestRecord::from_engine_core_request(EngineCoreRequest {
            mm_inputs: vec![input],
            mm_positions: vec![PlaceholderRange { offset: 3, length: 8 }],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(req.num_encoder_tokens(0), Some(8));
        assert_eq!(req.num_encoder_tokens(1), None);
    }

    #[test]
    fn audio_rows_learn_codebooks_and_count_delays() {
        let mut req = record();
        for step in 0..4 {
            req.append_audio_token_row(vec![IDS.bos; 4], IDS).unwrap();
            assert_eq!(req.audio_num_codebooks(), Some(4));
            assert_eq!(req.num_audio_delays(), step + 1);
        }
        assert_eq!(req.num_audio_eos(), 0);
        assert_eq!(req.output_mm_token_ids().len(), 4);
    }

    #[test]
    fn eos_column_sets_eos_count_monotonically() {
        let mut req = record();
        for _ in 0..4 {
            req.append_audio_token_row(vec![1, 2, 3, 4], IDS).unwrap();
        }
        req.append_audio_token_row(vec![5, 6, IDS.eos, 7], IDS).unwrap();
        assert_eq!(req.num_audio_eos(), 3);

        req.append_audio_token_row(vec![IDS.eos, 6, 7, 8], IDS).unwrap();
        assert_eq!(req.num_audio_eos(), 3);

        req.append_audio_token_row(vec![IDS.eos; 4], IDS).unwrap();
        assert_eq!(req.num_audio_eos(), 4);
        assert!(req.audio_stream_ended());
    }

    #[test]
    fn sentinel_row_hard_resets_audio_state() {
        let mut req = record();
        for _ in 0..5 {
            req.append_audio_token_row(vec![1, IDS.eos, 3, 4], IDS).unwrap();
        }
        assert_eq!(req.num_audio_eos(), 2);

        req.append_audio_token_row(vec![AUDIO_SEGMENT_SENTINEL, 0, 0, 0], IDS)
            .unwrap();
        assert_eq!(req.num_audio_eos(), 0);
        assert_eq!(req.num_audio_delays(), 0);
        assert!(req.output_mm_token_ids().is_empty());
        assert_eq!(req.audio_num_codebooks(), Some(4));
    }

    #[test]
    fn codebook_width_is_fixed_after_first_row() {
        let mut req = record();
        req.append_audio_token_row(vec![1, 2, 3, 4], IDS).unwrap();
        let err = req.append_audio_token_row(vec![1, 2], IDS).unwrap_err();
        assert_eq!(err, RequestError::CodebookWidth { expected: 4, got: 2 });
        assert_eq!(req.output_mm_token_ids().len(), 1);
    }

    #[test]
    fn empty_row_is_rejected_without_fixing_the_width() {
        let mut req = record();
        let err = req.append_audio_token_row(Vec::new(), IDS).unwrap_err();
        assert_eq!(err, RequestError::EmptyAudioRow);
        assert_eq!(req.audio_num_codebooks(), None);

        req.append_audio_token_row(vec![1, 2, 3, 4], IDS).unwrap();
        assert_eq!(req.audio_num_codebooks(), Some(4));
        assert_eq!(req.output_mm_token_ids().len(), 1);
    }
}
