//! Audio token handling for delay-patterned codebook streams.
//!
//! The model emits one row of codebook tokens per step. Codebook `k` is
//! delayed by `k` steps, so rows must be realigned with
//! [`revert_delay_pattern`] before the codec can decode them.
//!
//! - [`AudioChunker`] decides when enough rows have arrived to emit a
//!   streamed chunk.
//! - [`CodecSynthesizer`] turns a chunk of rows into samples and carries the
//!   crossfade tail between chunks.
//! - [`encode`] packs waveforms into the response audio formats.

mod chunker;
pub mod encode;
mod synth;

use thiserror::Error;

use crate::config::AudioStreamIds;
use crate::engine::{AudioRow, AUDIO_SEGMENT_SENTINEL};

pub use chunker::{AudioChunker, ChunkerConfig};
pub use encode::AudioFormat;
pub use synth::CodecSynthesizer;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("invalid chunk configuration: {0}")]
    InvalidConfig(String),
    #[error("audio row {row} has {got} codebooks, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("codec decode failed: {0}")]
    Decode(String),
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("WAV encoding failed: {0}")]
    Wav(#[from] hound::Error),
}

/// Codebook-index to waveform decoder.
pub trait AudioCodec: Send + Sync {
    fn num_codebooks(&self) -> usize;

    /// Number of valid code values per codebook.
    fn codebook_size(&self) -> usize;

    /// Rows the model emits per second of audio.
    fn tokens_per_second(&self) -> usize;

    fn sample_rate(&self) -> u32;

    fn samples_per_token(&self) -> usize {
        (self.sample_rate() as usize / self.tokens_per_second().max(1)).max(1)
    }

    /// Decode aligned codes, laid out as `codes[codebook][timestep]`, into mono samples.
    fn decode(&self, codes: &[Vec<i64>]) -> Result<Vec<f32>, AudioError>;
}

/// Rows handed to a [`ChunkSynthesizer`] for one streamed chunk.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisRequest<'a> {
    /// Every buffered row. Rows past `chunk_len` are look-ahead context.
    pub rows: &'a [AudioRow],
    /// Rows this chunk is responsible for.
    pub chunk_len: usize,
    /// Tail of the previous chunk to blend into the start of this one.
    pub fade_tail: Option<&'a [f32]>,
    /// Last chunk of a segment: emit everything and carry nothing forward.
    pub finalize: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesizedAudio {
    pub samples: Vec<f32>,
    pub fade_tail: Option<Vec<f32>>,
}

/// Turns a window of audio rows into playable samples.
pub trait ChunkSynthesizer: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn synthesize(&self, request: SynthesisRequest<'_>) -> Result<SynthesizedAudio, AudioError>;
}

/// A streamed piece of audio for one choice.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Rows consumed from the chunker buffer.
    pub num_rows: usize,
    pub finalize: bool,
    /// Crossfade source for the next chunk; `None` when nothing follows.
    pub fade_tail: Option<Vec<f32>>,
}

impl AudioChunk {
    /// Concatenate a later chunk of the same choice onto this one.
    pub fn append(&mut self, later: AudioChunk) {
        self.samples.extend(later.samples);
        self.num_rows += later.num_rows;
        self.finalize = later.finalize;
        self.fade_tail = later.fade_tail;
    }
}

/// Realign delay-patterned rows into `codes[codebook][timestep]`.
///
/// Codebook `k` is shifted left by `k`, so `n` rows yield
/// `n - num_codebooks + 1` timesteps (none when `n < num_codebooks`).
pub fn revert_delay_pattern(
    rows: &[AudioRow],
    num_codebooks: usize,
) -> Result<Vec<Vec<i64>>, AudioError> {
    if let Some((row, bad)) = rows
        .iter()
        .enumerate()
        .find(|(_, r)| r.len() != num_codebooks)
    {
        return Err(AudioError::RowWidth {
            row,
            expected: num_codebooks,
            got: bad.len(),
        });
    }

    let steps = (rows.len() + 1).saturating_sub(num_codebooks);
    Ok((0..num_codebooks)
        .map(|k| (0..steps).map(|t| rows[t + k][k]).collect())
        .collect())
}

/// Clamp codes into `[0, codebook_size - 1]` so stream markers decode safely.
pub fn clamp_codes(codes: &mut [Vec<i64>], codebook_size: usize) {
    let max = codebook_size.saturating_sub(1) as i64;
    for code in codes.iter_mut().flatten() {
        *code = (*code).clamp(0, max);
    }
}

fn is_uniform(row: &[i64], id: i64) -> bool {
    !row.is_empty() && row.iter().all(|&t| t == id)
}

/// Split a complete row stream into audio segments.
///
/// A segment ends after an all-EOS row or at a sentinel row (which is
/// dropped). Each segment loses its leading all-BOS and trailing all-EOS
/// synchronisation rows.
pub fn split_audio_segments(rows: &[AudioRow], ids: AudioStreamIds) -> Vec<Vec<AudioRow>> {
    let mut segments = Vec::new();
    let mut current: Vec<AudioRow> = Vec::new();

    for row in rows {
        if row.first() == Some(&AUDIO_SEGMENT_SENTINEL) {
            segments.push(std::mem::take(&mut current));
            continue;
        }
        current.push(row.clone());
        if is_uniform(row, ids.eos) {
            segments.push(std::mem::take(&mut current));
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .filter_map(|mut seg| {
            if seg.first().is_some_and(|r| is_uniform(r, ids.bos)) {
                seg.remove(0);
            }
            if seg.last().is_some_and(|r| is_uniform(r, ids.eos)) {
                seg.pop();
            }
            (!seg.is_empty()).then_some(seg)
        })
        .collect()
}

/// Decode a complete row stream into one waveform, segment by segment.
pub fn decode_full(
    rows: &[AudioRow],
    codec: &dyn AudioCodec,
    ids: AudioStreamIds,
) -> Result<Vec<f32>, AudioError> {
    let mut waveform = Vec::new();
    for segment in split_audio_segments(rows, ids) {
        let mut codes = revert_delay_pattern(&segment, codec.num_codebooks())?;
        if codes.first().map_or(true, |c| c.is_empty()) {
            continue;
        }
        clamp_codes(&mut codes, codec.codebook_size());
        waveform.extend(codec.decode(&codes)?);
    }
    Ok(waveform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StepCodec;

    const IDS: AudioStreamIds = AudioStreamIds { bos: 1024, eos: 1025 };

    #[test]
    fn revert_shifts_each_codebook_by_its_index() {
        // Codebook k holds value 10*t + k at row t + k.
        let rows: Vec<AudioRow> = (0..6)
            .map(|r| (0..3).map(|k| 10 * (r as i64 - k) + k).collect())
            .collect();
        let codes = revert_delay_pattern(&rows, 3).unwrap();
        assert_eq!(codes.len(), 3);
        assert_eq!(codes[0], vec![0, 10, 20, 30]);
        assert_eq!(codes[1], vec![1, 11, 21, 31]);
        assert_eq!(codes[2], vec![2, 12, 22, 32]);
    }

    #[test]
    fn revert_with_too_few_rows_is_empty() {
        let rows = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let codes = revert_delay_pattern(&rows, 3).unwrap();
        assert!(codes.iter().all(|c| c.is_empty()));
    }

    #[test]
    fn revert_rejects_ragged_rows() {
        let rows = vec![vec![1, 2], vec![3]];
        assert!(matches!(
            revert_delay_pattern(&rows, 2),
            Err(AudioError::RowWidth { row: 1, .. })
        ));
    }

    #[test]
    fn clamp_maps_markers_into_range() {
        let mut codes = vec![vec![-3, 5, 1025]];
        clamp_codes(&mut codes, 1024);
        assert_eq!(codes, vec![vec![0, 5, 1023]]);
    }

    #[test]
    fn split_strips_sync_rows_and_breaks_on_markers() {
        let rows = vec![
            vec![IDS.bos, IDS.bos],
            vec![1, IDS.bos],
            vec![2, 3],
            vec![IDS.eos, 4],
            vec![IDS.eos, IDS.eos],
            vec![AUDIO_SEGMENT_SENTINEL, 0],
            vec![IDS.bos, IDS.bos],
            vec![7, IDS.bos],
        ];
        let segments = split_audio_segments(&rows, IDS);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], vec![vec![1, IDS.bos], vec![2, 3], vec![IDS.eos, 4]]);
        assert_eq!(segments[1], vec![vec![7, IDS.bos]]);
    }

    #[test]
    fn decode_full_concatenates_segments() {
        let codec = StepCodec::new(2, 4);
        let seg = |v: i64| {
            vec![
                vec![IDS.bos, IDS.bos],
                vec![v, IDS.bos],
                vec![v, v],
                vec![IDS.eos, v],
                vec![IDS.eos, IDS.eos],
            ]
        };
        let mut rows = seg(1);
        rows.extend(seg(2));
        let waveform = decode_full(&rows, &codec, IDS).unwrap();
        // Each segment keeps 3 rows -> 2 timesteps -> 2 * samples_per_token samples.
        assert_eq!(waveform.len(), 2 * 2 * codec.samples_per_token());
    }
}
