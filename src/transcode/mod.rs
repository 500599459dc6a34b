//! Normalization strategies: turn an arbitrary container into 16 kHz mono
//! 16-bit PCM WAV, either through an external tool or in process.

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::request::AudioFormat;
use crate::transcription::{SpeechEngine, TranscriptionError};

pub mod ffmpeg;
#[cfg(feature = "fallback-decoder")]
pub mod native;

/// Converter backed by something outside the process
#[async_trait]
pub trait Transcoder: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the converter can run at all. Implementations probe once and
    /// remember the answer.
    async fn available(&self) -> bool;

    /// Convert `bytes` to normalized WAV, failing with `TranscodeFailure`
    /// (or `Canceled` when `cancel` fires first).
    async fn convert(
        &self,
        bytes: &[u8],
        format: AudioFormat,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, TranscriptionError>;
}

/// In-process decoder used when no transcoder is available
#[async_trait]
pub trait FallbackDecoder: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Whether this decoder understands `format` at all
    fn supports(&self, format: AudioFormat) -> bool;

    async fn decode(
        &self,
        bytes: &[u8],
        format: AudioFormat,
    ) -> Result<Vec<u8>, TranscriptionError>;
}

/// What the running deployment can do, computed once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub transcoder: bool,
    pub fallback_decoder: bool,
    /// The speech engine can demux compressed containers itself
    pub compressed_stream: bool,
}

impl Capabilities {
    pub async fn probe(
        transcoder: Option<&dyn Transcoder>,
        decoders: &[&dyn FallbackDecoder],
        engine: &dyn SpeechEngine,
    ) -> Self {
        let transcoder = match transcoder {
            Some(t) => t.available().await,
            None => false,
        };
        let capabilities = Self {
            transcoder,
            fallback_decoder: decoders.iter().any(|d| d.available()),
            compressed_stream: engine.supports_compressed(),
        };

        tracing::info!(
            transcoder = capabilities.transcoder,
            fallback_decoder = capabilities.fallback_decoder,
            compressed_stream = capabilities.compressed_stream,
            engine = engine.name(),
            "Probed pipeline capabilities"
        );
        capabilities
    }
}
