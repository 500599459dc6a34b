use std::io::Cursor;

use async_trait::async_trait;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::FallbackDecoder;
use crate::request::AudioFormat;
use crate::transcription::TranscriptionError;
use crate::wav::{WavEncoder, NORMALIZED_SAMPLE_RATE};

/// In-process MP3 decoder producing normalized WAV
pub struct NativeDecoder {
    enabled: bool,
}

impl NativeDecoder {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl FallbackDecoder for NativeDecoder {
    fn name(&self) -> &str {
        "symphonia"
    }

    fn available(&self) -> bool {
        self.enabled
    }

    fn supports(&self, format: AudioFormat) -> bool {
        // Unknown uploads are often MP3 without a useful name; the probe decides
        matches!(format, AudioFormat::Mp3 | AudioFormat::Unknown)
    }

    async fn decode(
        &self,
        bytes: &[u8],
        format: AudioFormat,
    ) -> Result<Vec<u8>, TranscriptionError> {
        let data = bytes.to_vec();
        let samples = tokio::task::spawn_blocking(move || decode_to_mono(data, format))
            .await
            .map_err(|e| TranscriptionError::TranscodeFailure(format!("decoder task: {}", e)))??;

        WavEncoder::default()
            .encode_to_wav(&samples)
            .map_err(|e| TranscriptionError::TranscodeFailure(e.to_string()))
    }
}

fn decode_failed(stage: &str, e: impl std::fmt::Display) -> TranscriptionError {
    TranscriptionError::TranscodeFailure(format!("{}: {}", stage, e))
}

/// Decode to 16 kHz mono f32 samples
fn decode_to_mono(data: Vec<u8>, format: AudioFormat) -> Result<Vec<f32>, TranscriptionError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());

    let mut hint = Hint::new();
    if format == AudioFormat::Mp3 {
        hint.with_extension("mp3");
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| decode_failed("probe", e))?;

    let mut reader = probed.format;

    let track = reader
        .default_track()
        .ok_or_else(|| decode_failed("track", "no audio track found"))?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let source_rate = codec_params
        .sample_rate
        .ok_or_else(|| decode_failed("track", "unknown sample rate"))?;
    let mut channels = codec_params.channels.map_or(1, |c| c.count());

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| decode_failed("codec", e))?;

    let mut mono: Vec<f32> = Vec::new();

    loop {
        let packet = match reader.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(decode_failed("packet", e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                tracing::warn!(error = %e, "Skipping corrupt audio frame");
                continue;
            }
            Err(e) => return Err(decode_failed("decode", e)),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }
        // Track parameters may omit the layout; each buffer knows its own
        channels = spec.channels.count();

        let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        downmix_into(sample_buf.samples(), channels, &mut mono);
    }

    if mono.is_empty() {
        return Err(decode_failed("decode", "no audio samples decoded"));
    }

    if source_rate != NORMALIZED_SAMPLE_RATE {
        mono = resample(&mono, source_rate, NORMALIZED_SAMPLE_RATE)?;
    }

    tracing::debug!(
        samples = mono.len(),
        source_rate,
        channels,
        "Decoded audio in process"
    );
    Ok(mono)
}

fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    for frame in interleaved.chunks(channels) {
        out.push(frame.iter().sum::<f32>() / channels as f32);
    }
}

fn resample(
    samples: &[f32],
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<f32>, TranscriptionError> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let chunk_size = 1024;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| decode_failed("resampler init", e))?;

    let expected = (samples.len() as f64 * ratio).ceil() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay + chunk_size);

    let mut chunks = samples.chunks_exact(chunk_size);
    for chunk in &mut chunks {
        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| decode_failed("resample", e))?;
        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
    }

    let rest = chunks.remainder();
    if !rest.is_empty() {
        let result = resampler
            .process_partial(Some(&[rest][..]), None)
            .map_err(|e| decode_failed("resample", e))?;
        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
    }

    // Flush the filter until the delayed tail is out
    while output.len() < delay + expected {
        let result = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(|e| decode_failed("resample flush", e))?;
        match result.first() {
            Some(channel) if !channel.is_empty() => output.extend_from_slice(channel),
            _ => break,
        }
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}
