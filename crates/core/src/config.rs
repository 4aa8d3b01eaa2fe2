use serde::Deserialize;

/// Sentinel ids that bracket an audio stream inside each codebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AudioStreamIds {
    pub bos: i64,
    pub eos: i64,
}

impl Default for AudioStreamIds {
    fn default() -> Self {
        Self {
            bos: 1024,
            eos: 1025,
        }
    }
}

/// Serving-level behaviour shared by every request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Role announced when the request asks for a generation prompt.
    pub response_role: String,
    pub enable_auto_tools: bool,
    pub enable_reasoning: bool,
    pub enable_prompt_tokens_details: bool,
    pub audio_stream: AudioStreamIds,
    /// Rows per streamed audio chunk. Falls back to the codec's tokens per second.
    pub audio_chunk_size: Option<usize>,
    /// Rows kept behind each chunk for continuity. Falls back to the codec's tokens per second.
    pub audio_chunk_overlap_size: Option<usize>,
    /// Samples blended between consecutive streamed chunks.
    pub crossfade_samples: usize,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            response_role: "assistant".to_string(),
            enable_auto_tools: false,
            enable_reasoning: false,
            enable_prompt_tokens_details: false,
            audio_stream: AudioStreamIds::default(),
            audio_chunk_size: None,
            audio_chunk_overlap_size: None,
            crossfade_samples: 240,
        }
    }
}
