#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_lossless)]

use anyhow::Result;
use thiserror::Error;

/// Smallest buffer that can hold RIFF + fmt + data headers
pub const MIN_WAV_LEN: usize = 44;

/// Sample rate every normalization path produces
pub const NORMALIZED_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WavError {
    #[error("not a PCM WAV buffer: {0}")]
    NotWav(&'static str),
}

/// Layout of a linear PCM WAV buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate_hz: u32,
    pub bits_per_sample: u16,
    /// First byte after the `data` chunk header
    pub data_offset: u32,
    /// `min(declared, available)`; always safe to slice with
    pub data_length: u32,
    /// Size field as written by the encoder, possibly larger than the buffer
    pub declared_data_length: u32,
}

impl WavHeader {
    /// The audio payload of `bytes`, clamped to what is actually present.
    pub fn data<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        let start = (self.data_offset as usize).min(bytes.len());
        let available = bytes.len() - start;
        let len = (self.data_length as usize).min(available);
        &bytes[start..start + len]
    }

    /// True for the 16 kHz mono 16-bit shape the transcoders produce
    pub fn is_normalized(&self) -> bool {
        self.sample_rate_hz == NORMALIZED_SAMPLE_RATE
            && self.channels == 1
            && self.bits_per_sample == 16
    }

    pub fn duration_seconds(&self) -> f32 {
        let bytes_per_second =
            self.sample_rate_hz as f32 * self.channels as f32 * (self.bits_per_sample as f32 / 8.0);
        if bytes_per_second == 0.0 {
            return 0.0;
        }
        self.data_length as f32 / bytes_per_second
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Parse a RIFF/WAVE buffer in a single forward pass over its sub-chunks.
///
/// The `data` chunk is only searched for after `fmt ` has been seen. A
/// declared data size larger than the remaining buffer is clamped.
pub fn parse(bytes: &[u8]) -> Result<WavHeader, WavError> {
    if bytes.len() < MIN_WAV_LEN {
        return Err(WavError::NotWav("buffer shorter than a WAV header"));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(WavError::NotWav("missing RIFF/WAVE markers"));
    }

    let mut format: Option<(u16, u32, u16)> = None;
    let mut pos = 12usize;

    while pos.checked_add(8).is_some_and(|end| end <= bytes.len()) {
        let id = &bytes[pos..pos + 4];
        let size = read_u32(bytes, pos + 4);
        let body = pos + 8;

        match (id, format) {
            (b"fmt ", None) => {
                if size < 16 || body + 16 > bytes.len() {
                    return Err(WavError::NotWav("truncated fmt chunk"));
                }
                if read_u16(bytes, body) != 1 {
                    return Err(WavError::NotWav("not linear PCM"));
                }
                let channels = read_u16(bytes, body + 2);
                let sample_rate = read_u32(bytes, body + 4);
                let bits = read_u16(bytes, body + 14);
                if !matches!(channels, 1 | 2) {
                    return Err(WavError::NotWav("unsupported channel count"));
                }
                if !matches!(bits, 8 | 16 | 24 | 32) {
                    return Err(WavError::NotWav("unsupported bit depth"));
                }
                format = Some((channels, sample_rate, bits));
            }
            (b"data", Some((channels, sample_rate_hz, bits_per_sample))) => {
                let available = (bytes.len() - body) as u32;
                return Ok(WavHeader {
                    channels,
                    sample_rate_hz,
                    bits_per_sample,
                    data_offset: body as u32,
                    data_length: size.min(available),
                    declared_data_length: size,
                });
            }
            _ => {}
        }

        // RIFF chunks are word aligned
        let padded = size as usize + (size as usize & 1);
        match body.checked_add(padded) {
            Some(next) => pos = next,
            None => break,
        }
    }

    if format.is_none() {
        Err(WavError::NotWav("no fmt chunk"))
    } else {
        Err(WavError::NotWav("no data chunk"))
    }
}

/// WAV file encoder for converting f32 audio samples to 16-bit PCM WAV format
/// Produces the normalized shape every recognizer accepts: 16kHz mono, 16-bit PCM
pub struct WavEncoder {
    sample_rate: u32,
    channels: u16,
}

impl WavEncoder {
    /// Create a new WAV encoder with specified sample rate and channels
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Generate a 44-byte header for `data_size` bytes of PCM at the given depth
    pub fn header_for(&self, bits_per_sample: u16, data_size: u32) -> Vec<u8> {
        let byte_rate = self.sample_rate * self.channels as u32 * (bits_per_sample as u32 / 8);
        let block_align = self.channels * (bits_per_sample / 8);
        let file_size = 36u32.saturating_add(data_size);

        let mut header = Vec::with_capacity(MIN_WAV_LEN);

        // RIFF header
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&file_size.to_le_bytes());
        header.extend_from_slice(b"WAVE");

        // fmt chunk
        header.extend_from_slice(b"fmt ");
        header.extend_from_slice(&16u32.to_le_bytes()); // chunk size
        header.extend_from_slice(&1u16.to_le_bytes()); // PCM format
        header.extend_from_slice(&self.channels.to_le_bytes());
        header.extend_from_slice(&self.sample_rate.to_le_bytes());
        header.extend_from_slice(&byte_rate.to_le_bytes());
        header.extend_from_slice(&block_align.to_le_bytes());
        header.extend_from_slice(&bits_per_sample.to_le_bytes());

        // data chunk header
        header.extend_from_slice(b"data");
        header.extend_from_slice(&data_size.to_le_bytes());

        header
    }

    /// Convert f32 samples to i16 PCM format
    /// Input samples should be in range [-1.0, 1.0]
    pub fn convert_samples(&self, samples: &[f32]) -> Vec<i16> {
        samples
            .iter()
            .map(|&sample| {
                // Clamp to [-1.0, 1.0] range to prevent overflow
                let clamped = sample.clamp(-1.0, 1.0);
                (clamped * i16::MAX as f32) as i16
            })
            .collect()
    }

    /// Convert f32 audio buffer to complete WAV file bytes
    pub fn encode_to_wav(&self, samples: &[f32]) -> Result<Vec<u8>> {
        if samples.is_empty() {
            return Err(anyhow::anyhow!("Cannot encode empty audio buffer to WAV"));
        }

        let pcm_samples = self.convert_samples(samples);
        let data_size = u32::try_from(pcm_samples.len() * 2)
            .map_err(|_| anyhow::anyhow!("Audio too long for a WAV container"))?;
        let header = self.header_for(16, data_size);

        let mut wav_data = Vec::with_capacity(header.len() + pcm_samples.len() * 2);
        wav_data.extend_from_slice(&header);

        // Add PCM data as little-endian bytes
        for sample in pcm_samples {
            wav_data.extend_from_slice(&sample.to_le_bytes());
        }

        Ok(wav_data)
    }
}

impl Default for WavEncoder {
    /// Encoder for the normalized shape: 16kHz mono
    fn default() -> Self {
        Self::new(NORMALIZED_SAMPLE_RATE, 1)
    }
}
