//! Response audio encoding.

use std::io::Cursor;
use std::str::FromStr;

use base64::Engine;

use super::AudioError;

/// Container for response audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    #[default]
    Wav,
    /// Raw 16-bit little-endian mono samples.
    Pcm,
}

impl FromStr for AudioFormat {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wav" => Ok(Self::Wav),
            "pcm" | "pcm16" => Ok(Self::Pcm),
            other => Err(AudioError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl AudioFormat {
    pub fn parse_optional(format: Option<&str>) -> Result<Self, AudioError> {
        format.map_or(Ok(Self::default()), str::parse)
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

pub fn pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| to_i16(s).to_le_bytes())
        .collect()
}

pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let mut buf = Vec::new();
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec)?;
    for &s in samples {
        writer.write_sample(to_i16(s))?;
    }
    writer.finalize()?;
    Ok(buf)
}

/// Encode a waveform in `format` and base64 it for a JSON payload.
pub fn encode_base64(
    samples: &[f32],
    sample_rate: u32,
    format: AudioFormat,
) -> Result<String, AudioError> {
    let bytes = match format {
        AudioFormat::Wav => wav_bytes(samples, sample_rate)?,
        AudioFormat::Pcm => pcm16_bytes(samples),
    };
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}
