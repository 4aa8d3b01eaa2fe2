use std::sync::Arc;

use super::{AudioChunk, AudioError, ChunkSynthesizer, SynthesisRequest};
use crate::engine::AudioRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub overlap_size: usize,
    pub num_codebooks: usize,
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<(), AudioError> {
        if self.num_codebooks == 0 {
            return Err(AudioError::InvalidConfig("num_codebooks must be positive".into()));
        }
        if self.chunk_size < self.num_codebooks {
            return Err(AudioError::InvalidConfig(format!(
                "chunk_size {} is smaller than the {} codebook delay",
                self.chunk_size, self.num_codebooks
            )));
        }
        Ok(())
    }

    /// Rows in the first chunk, shortened by the delay-pattern warm-up.
    pub fn first_chunk_rows(&self) -> usize {
        self.chunk_size + 1 - self.num_codebooks
    }

    /// Buffered rows needed before the first chunk can be emitted.
    pub fn first_chunk_threshold(&self) -> usize {
        self.chunk_size + self.num_codebooks - 1
    }

    /// Buffered rows needed before a regular chunk can be emitted.
    pub fn chunk_threshold(&self) -> usize {
        self.chunk_size + self.overlap_size
    }
}

/// Per-choice accumulator that releases audio rows to the synthesizer in
/// bounded chunks.
///
/// The first chunk of each segment is emitted early with fewer rows to cut
/// time-to-first-audio. Later chunks keep `overlap_size` rows buffered as
/// look-ahead, and each chunk's fade tail is blended into the next one.
pub struct AudioChunker {
    config: ChunkerConfig,
    synthesizer: Arc<dyn ChunkSynthesizer>,
    buffer: Vec<AudioRow>,
    first_chunk: bool,
    fade_tail: Option<Vec<f32>>,
}

impl AudioChunker {
    pub fn new(
        config: ChunkerConfig,
        synthesizer: Arc<dyn ChunkSynthesizer>,
    ) -> Result<Self, AudioError> {
        config.validate()?;
        Ok(Self {
            config,
            synthesizer,
            buffer: Vec::new(),
            first_chunk: true,
            fade_tail: None,
        })
    }

    pub fn config(&self) -> ChunkerConfig {
        self.config
    }

    pub fn buffered_rows(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffer new rows and emit at most one chunk once enough have arrived.
    pub fn feed(&mut self, rows: Vec<AudioRow>) -> Result<Option<AudioChunk>, AudioError> {
        self.buffer.extend(rows);

        if self.first_chunk && self.buffer.len() >= self.config.first_chunk_threshold() {
            let chunk = self.synthesize(self.config.first_chunk_rows(), false)?;
            self.first_chunk = false;
            return Ok(Some(chunk));
        }
        if !self.first_chunk && self.buffer.len() >= self.config.chunk_threshold() {
            return self.synthesize(self.config.chunk_size, false).map(Some);
        }
        Ok(None)
    }

    /// Emit every remaining row as a final chunk.
    pub fn flush(&mut self) -> Result<Option<AudioChunk>, AudioError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let chunk = self.synthesize(self.buffer.len(), true)?;
        self.fade_tail = None;
        Ok(Some(chunk))
    }

    /// Close the current audio segment. The next segment starts over with a
    /// reduced first chunk and no crossfade.
    pub fn end_segment(&mut self) -> Result<Option<AudioChunk>, AudioError> {
        let chunk = self.flush()?;
        self.first_chunk = true;
        self.fade_tail = None;
        Ok(chunk)
    }

    fn synthesize(&mut self, chunk_len: usize, finalize: bool) -> Result<AudioChunk, AudioError> {
        let out = self.synthesizer.synthesize(SynthesisRequest {
            rows: &self.buffer,
            chunk_len,
            fade_tail: self.fade_tail.as_deref(),
            finalize,
        })?;
        self.buffer.drain(..chunk_len);
        self.fade_tail = out.fade_tail.clone();
        tracing::debug!(
            rows = chunk_len,
            samples = out.samples.len(),
            finalize,
            "audio chunk ready"
        );
        Ok(AudioChunk {
            samples: out.samples,
            sample_rate: self.synthesizer.sample_rate(),
            num_rows: chunk_len,
            finalize,
            fade_tail: out.fade_tail,
        })
    }
}
