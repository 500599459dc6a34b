//! Top-level entry point: pick a normalization path, then walk providers until
//! one produces text.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::recognizer::{NormalizedAudio, StreamingRecognitionClient};
use crate::request::{AudioFormat, AudioRequest};
use crate::transcode::{Capabilities, FallbackDecoder, Transcoder};
use crate::transcription::{ProviderAttempt, TranscriptionError, TranscriptionProvider};
use crate::wav;

/// Transcript plus every recognition attempt made to get it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptionOutcome {
    pub text: Option<String>,
    pub attempts: Vec<ProviderAttempt>,
}

pub struct ProviderOrchestrator {
    secondary: Vec<Box<dyn TranscriptionProvider>>,
    recognizer: StreamingRecognitionClient,
    transcoder: Option<Arc<dyn Transcoder>>,
    decoders: Vec<Arc<dyn FallbackDecoder>>,
    capabilities: Capabilities,
}

impl ProviderOrchestrator {
    pub fn new(recognizer: StreamingRecognitionClient, capabilities: Capabilities) -> Self {
        Self {
            secondary: Vec::new(),
            recognizer,
            transcoder: None,
            decoders: Vec::new(),
            capabilities,
        }
    }

    /// Providers are tried in the order they are added, before the engine
    pub fn with_secondary(mut self, provider: Box<dyn TranscriptionProvider>) -> Self {
        self.secondary.push(provider);
        self
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn FallbackDecoder>) -> Self {
        self.decoders.push(decoder);
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Best-effort transcript. `Ok(None)` means nothing could be
    /// transcribed; only cancellation and an empty upload are errors.
    pub async fn transcribe(
        &self,
        request: &AudioRequest,
        cancel: &CancelToken,
    ) -> Result<Option<String>, TranscriptionError> {
        Ok(self.transcribe_with_attempts(request, cancel).await?.text)
    }

    pub async fn transcribe_with_attempts(
        &self,
        request: &AudioRequest,
        cancel: &CancelToken,
    ) -> Result<TranscriptionOutcome, TranscriptionError> {
        if request.bytes.is_empty() {
            return Err(TranscriptionError::InvalidRequest(
                "audio upload is empty".to_string(),
            ));
        }
        if cancel.is_canceled() {
            return Err(TranscriptionError::Canceled);
        }

        let format = request.format();
        tracing::info!(
            %format,
            bytes = request.bytes.len(),
            file_name = %request.file_name,
            content_type = %request.content_type,
            "Transcription started"
        );

        let mut attempts = Vec::new();
        let text = self.run(request, format, cancel, &mut attempts).await?;

        match &text {
            Some(text) => tracing::info!(
                %format,
                chars = text.len(),
                attempts = attempts.len(),
                "Transcription succeeded"
            ),
            None => tracing::warn!(
                %format,
                bytes = request.bytes.len(),
                attempts = attempts.len(),
                "No transcript produced"
            ),
        }

        Ok(TranscriptionOutcome { text, attempts })
    }

    async fn run(
        &self,
        request: &AudioRequest,
        format: AudioFormat,
        cancel: &CancelToken,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Result<Option<String>, TranscriptionError> {
        let hint = request.normalized_language();

        for provider in &self.secondary {
            let result = cancel
                .run(provider.transcribe_upload(request))
                .await
                .ok_or(TranscriptionError::Canceled)?;
            attempts.push(ProviderAttempt::from_result(provider.name(), &result));
            match result {
                Ok(text) if !text.trim().is_empty() => return Ok(Some(text.trim().to_string())),
                Ok(_) => tracing::info!(provider = provider.name(), "Provider returned no text"),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        provider = provider.name(),
                        %format,
                        error = %e,
                        "Provider failed, falling through"
                    );
                }
            }
        }

        // Unknown uploads may still be WAV; try passthrough before converting
        if matches!(format, AudioFormat::Wav | AudioFormat::Unknown) {
            match wav::parse(&request.bytes) {
                Ok(header) => {
                    if let Some(text) = self
                        .recognize_wav(&request.bytes, header, hint, cancel, attempts)
                        .await?
                    {
                        return Ok(Some(text));
                    }
                    if header.is_normalized() {
                        return Ok(None);
                    }
                    tracing::info!(
                        sample_rate = header.sample_rate_hz,
                        bits = header.bits_per_sample,
                        channels = header.channels,
                        "Direct recognition empty, retrying through normalization"
                    );
                }
                Err(e) if format == AudioFormat::Wav => {
                    tracing::warn!(
                        error = %e,
                        bytes = request.bytes.len(),
                        "Declared WAV did not parse"
                    );
                }
                Err(_) => {}
            }
        }

        if let Some(normalized) = self.normalize(&request.bytes, format, cancel).await? {
            match wav::parse(&normalized) {
                Ok(header) => {
                    return self
                        .recognize_wav(&normalized, header, hint, cancel, attempts)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        bytes = normalized.len(),
                        "Normalized output is not WAV"
                    );
                }
            }
        }

        if !self.capabilities.compressed_stream {
            tracing::warn!(
                %format,
                engine = self.recognizer.engine().name(),
                "No conversion path and no compressed-stream support, skipping recognition"
            );
            return Ok(None);
        }

        let audio = NormalizedAudio::Compressed {
            bytes: &request.bytes,
            format,
        };
        match self
            .recognizer
            .recognize_once(audio, hint, cancel, attempts)
            .await
        {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.is_canceled() => Err(e),
            Err(e) => {
                tracing::warn!(%format, error = %e, "Compressed recognition exhausted");
                Ok(None)
            }
        }
    }

    async fn recognize_wav(
        &self,
        bytes: &[u8],
        header: wav::WavHeader,
        hint: Option<&str>,
        cancel: &CancelToken,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Result<Option<String>, TranscriptionError> {
        let audio = NormalizedAudio::Wav { bytes, header };
        match self
            .recognizer
            .recognize_once(audio, hint, cancel, attempts)
            .await
        {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.is_canceled() => Err(e),
            Err(e) => {
                tracing::warn!(
                    duration_seconds = header.duration_seconds(),
                    error = %e,
                    "WAV recognition produced nothing"
                );
                Ok(None)
            }
        }
    }

    /// Transcoder first, then in-process decoders
    async fn normalize(
        &self,
        bytes: &[u8],
        format: AudioFormat,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<u8>>, TranscriptionError> {
        let transcoder = self
            .transcoder
            .as_ref()
            .filter(|_| self.capabilities.transcoder);
        if let Some(transcoder) = transcoder {
            match transcoder.convert(bytes, format, cancel).await {
                Ok(normalized) => return Ok(Some(normalized)),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        transcoder = transcoder.name(),
                        %format,
                        bytes = bytes.len(),
                        error = %e,
                        "Transcoding failed"
                    );
                }
            }
        }

        if !self.capabilities.fallback_decoder {
            return Ok(None);
        }

        for decoder in self
            .decoders
            .iter()
            .filter(|d| d.available() && d.supports(format))
        {
            let result = cancel
                .run(decoder.decode(bytes, format))
                .await
                .ok_or(TranscriptionError::Canceled)?;
            match result {
                Ok(normalized) => return Ok(Some(normalized)),
                Err(e) => {
                    tracing::warn!(
                        decoder = decoder.name(),
                        %format,
                        bytes = bytes.len(),
                        error = %e,
                        "Fallback decoding failed"
                    );
                }
            }
        }

        Ok(None)
    }
}
