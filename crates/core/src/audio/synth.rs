use std::sync::Arc;

use super::{
    clamp_codes, is_uniform, revert_delay_pattern, AudioCodec, AudioError, ChunkSynthesizer,
    SynthesisRequest, SynthesizedAudio,
};
use crate::config::AudioStreamIds;

/// [`ChunkSynthesizer`] backed by an [`AudioCodec`].
///
/// Decodes the whole buffered window, keeps the samples belonging to the
/// chunk's own rows, and hands the next `crossfade_samples` decoded samples
/// forward as the fade tail. A leading all-BOS row and, when finalizing, a
/// trailing all-EOS row are stream markers and are never decoded.
pub struct CodecSynthesizer {
    codec: Arc<dyn AudioCodec>,
    crossfade_samples: usize,
    ids: AudioStreamIds,
}

impl CodecSynthesizer {
    pub fn new(codec: Arc<dyn AudioCodec>, crossfade_samples: usize, ids: AudioStreamIds) -> Self {
        Self {
            codec,
            crossfade_samples,
            ids,
        }
    }
}

impl ChunkSynthesizer for CodecSynthesizer {
    fn sample_rate(&self) -> u32 {
        self.codec.sample_rate()
    }

    fn synthesize(&self, request: SynthesisRequest<'_>) -> Result<SynthesizedAudio, AudioError> {
        let mut rows = request.rows;
        let mut chunk_len = request.chunk_len;
        if rows.first().is_some_and(|r| is_uniform(r, self.ids.bos)) {
            rows = &rows[1..];
            chunk_len = chunk_len.saturating_sub(1);
        }
        if request.finalize && rows.last().is_some_and(|r| is_uniform(r, self.ids.eos)) {
            rows = &rows[..rows.len() - 1];
        }

        let mut codes = revert_delay_pattern(rows, self.codec.num_codebooks())?;
        if codes.first().map_or(true, |c| c.is_empty()) {
            return Ok(SynthesizedAudio::default());
        }
        clamp_codes(&mut codes, self.codec.codebook_size());
        let decoded = self.codec.decode(&codes)?;

        let emit = if request.finalize {
            decoded.len()
        } else {
            (chunk_len * self.codec.samples_per_token()).min(decoded.len())
        };
        let mut samples = decoded[..emit].to_vec();
        if let Some(tail) = request.fade_tail {
            crossfade(&mut samples, tail);
        }

        let fade_tail = if request.finalize {
            None
        } else {
            let end = (emit + self.crossfade_samples).min(decoded.len());
            (end > emit).then(|| decoded[emit..end].to_vec())
        };
        Ok(SynthesizedAudio { samples, fade_tail })
    }
}

/// Blend `tail` out while the head of `samples` fades in.
fn crossfade(samples: &mut [f32], tail: &[f32]) {
    let n = tail.len().min(samples.len());
    for (i, (s, t)) in samples.iter_mut().zip(tail).take(n).enumerate() {
        let w = (i + 1) as f32 / (n + 1) as f32;
        *s = *s * w + *t * (1.0 - w);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{decode_full, AudioChunker, ChunkerConfig};
    use crate::engine::AudioRow;
    use crate::testing::StepCodec;

    fn rows(values: &[i64]) -> Vec<AudioRow> {
        values.iter().map(|&v| vec![v, v]).collect()
    }

    #[test]
    fn emits_only_the_chunk_rows_and_carries_a_tail() {
        let codec = Arc::new(StepCodec::new(2, 4));
        let synth = CodecSynthesizer::new(codec, 3, AudioStreamIds::default());
        let window = rows(&[1, 2, 3, 4, 5, 6]);
        let out = synth
            .synthesize(SynthesisRequest {
                rows: &window,
                chunk_len: 2,
                fade_tail: None,
                finalize: false,
            })
            .unwrap();
        assert_eq!(out.samples.len(), 8);
        assert_eq!(out.fade_tail.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn finalize_emits_everything_without_tail() {
        let codec = Arc::new(StepCodec::new(2, 4));
        let synth = CodecSynthesizer::new(codec, 3, AudioStreamIds::default());
        let window = rows(&[1, 2, 3, 4]);
        let out = synth
            .synthesize(SynthesisRequest {
                rows: &window,
                chunk_len: 4,
                fade_tail: None,
                finalize: true,
            })
            .unwrap();
        assert_eq!(out.samples.len(), 3 * 4);
        assert!(out.fade_tail.is_none());
    }

    #[test]
    fn too_few_rows_produce_silence_not_errors() {
        let codec = Arc::new(StepCodec::new(4, 4));
        let synth = CodecSynthesizer::new(codec, 3, AudioStreamIds::default());
        let window = vec![vec![1, 1, 1, 1]];
        let out = synth
            .synthesize(SynthesisRequest {
                rows: &window,
                chunk_len: 1,
                fade_tail: None,
                finalize: true,
            })
            .unwrap();
        assert!(out.samples.is_empty());
    }

    #[test]
    fn stream_markers_are_not_decoded() {
        let ids = AudioStreamIds::default();
        let (b, e) = (ids.bos, ids.eos);
        let stream = vec![vec![b, b], vec![3, b], vec![4, 3], vec![e, 4], vec![e, e]];
        let codec = Arc::new(StepCodec::new(2, 1));
        let full = decode_full(&stream, codec.as_ref(), ids).unwrap();
        assert_eq!(full.len(), 2);

        let synth = Arc::new(CodecSynthesizer::new(codec, 0, ids));
        let config = ChunkerConfig {
            chunk_size: 2,
            overlap_size: 1,
            num_codebooks: 2,
        };
        let mut chunker = AudioChunker::new(config, synth).unwrap();
        let mut streamed = Vec::new();
        for row in stream {
            if let Some(chunk) = chunker.feed(vec![row]).unwrap() {
                streamed.extend(chunk.samples);
            }
        }
        if let Some(chunk) = chunker.flush().unwrap() {
            streamed.extend(chunk.samples);
        }
        assert_eq!(streamed, full);
    }

    #[test]
    fn leading_marker_row_does_not_count_towards_emitted_samples() {
        let ids = AudioStreamIds::default();
        let codec = Arc::new(StepCodec::new(2, 4));
        let synth = CodecSynthesizer::new(codec, 0, ids);
        let window = vec![vec![ids.bos, ids.bos], vec![3, ids.bos], vec![4, 3], vec![5, 4]];
        let out = synth
            .synthesize(SynthesisRequest {
                rows: &window,
                chunk_len: 2,
                fade_tail: None,
                finalize: false,
            })
            .unwrap();
        assert_eq!(out.samples, vec![3.0 / 1024.0; 4]);
    }

    #[test]
    fn crossfade_moves_from_tail_towards_new_samples() {
        let mut samples = vec![1.0; 4];
        crossfade(&mut samples, &[0.0, 0.0, 0.0]);
        assert!(samples[0] < samples[1] && samples[1] < samples[2]);
        assert!(samples[2] < 1.0);
        assert_eq!(samples[3], 1.0);
    }
}
