//! Push normalized audio into a speech engine and wait for one result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::request::AudioFormat;
use crate::transcription::{
    ErrorKind, LocaleMode, ProviderAttempt, Recognition, SpeechEngine, StreamFormat,
    TranscriptionError,
};
use crate::wav::WavHeader;

/// Audio ready for recognition
#[derive(Debug, Clone, Copy)]
pub enum NormalizedAudio<'a> {
    /// PCM WAV with a parsed header; only the data span is streamed
    Wav { bytes: &'a [u8], header: WavHeader },
    /// A container the engine demuxes itself
    Compressed { bytes: &'a [u8], format: AudioFormat },
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub chunk_size: usize,
    pub default_locale: String,
    pub candidate_locales: Vec<String>,
    pub attempt_timeout: Duration,
    /// Where temp-file fallbacks are written; the system temp dir when unset
    pub temp_dir: Option<PathBuf>,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            default_locale: "en-US".to_string(),
            candidate_locales: vec!["en-US".into(), "fr-FR".into(), "de-DE".into()],
            attempt_timeout: Duration::from_secs(60),
            temp_dir: None,
        }
    }
}

impl From<&Config> for RecognitionSettings {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.stream_chunk_bytes,
            default_locale: config.speech_default_locale.clone(),
            candidate_locales: config.speech_candidate_locales.clone(),
            attempt_timeout: Duration::from_secs(config.recognition_timeout_seconds),
            temp_dir: config.temp_dir.clone(),
        }
    }
}

pub struct StreamingRecognitionClient {
    engine: Arc<dyn SpeechEngine>,
    settings: RecognitionSettings,
}

impl StreamingRecognitionClient {
    pub fn new(engine: Arc<dyn SpeechEngine>, settings: RecognitionSettings) -> Self {
        Self { engine, settings }
    }

    pub fn engine(&self) -> &dyn SpeechEngine {
        self.engine.as_ref()
    }

    /// Recognize `audio` once.
    ///
    /// With a language hint this is a single forced-locale attempt. Without
    /// one, auto-detection runs first and a forced retry with the default
    /// locale follows if it produced nothing. Every attempt is appended to
    /// `attempts`.
    pub async fn recognize_once(
        &self,
        audio: NormalizedAudio<'_>,
        language_hint: Option<&str>,
        cancel: &CancelToken,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Result<String, TranscriptionError> {
        let plan = match language_hint {
            Some(locale) => vec![LocaleMode::Forced(locale.to_string())],
            None => vec![
                LocaleMode::Auto(self.settings.candidate_locales.clone()),
                LocaleMode::Forced(self.settings.default_locale.clone()),
            ],
        };

        let engine = self.engine.name();
        let mut last_error = TranscriptionError::NoSpeechDetected {
            provider: engine.to_string(),
        };

        for locales in &plan {
            let mut detected = None;
            let outcome = self.attempt(audio, locales, cancel).await.map(|r| {
                detected = r.locale;
                r.text.trim().to_string()
            });
            attempts.push(ProviderAttempt::from_result(engine, &outcome));

            match outcome {
                Ok(text) if !text.is_empty() => {
                    if let LocaleMode::Auto(_) = locales {
                        tracing::info!(engine, locale = ?detected, "Auto-detected language");
                    }
                    return Ok(text);
                }
                Ok(_) => {
                    tracing::info!(engine, ?locales, "Recognition returned no text");
                }
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) if e.kind() == ErrorKind::EngineUnavailable => return Err(e),
                Err(e) => {
                    tracing::warn!(engine, ?locales, error = %e, "Recognition attempt failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// One cancelable, time-bounded attempt
    async fn attempt(
        &self,
        audio: NormalizedAudio<'_>,
        locales: &LocaleMode,
        cancel: &CancelToken,
    ) -> Result<Recognition, TranscriptionError> {
        let bounded =
            tokio::time::timeout(self.settings.attempt_timeout, self.push(audio, locales));
        match cancel.run(bounded).await {
            None => Err(TranscriptionError::Canceled),
            Some(Err(_)) => Err(TranscriptionError::network(
                self.engine.name(),
                "Recognition timeout",
                format!("no result within {:?}", self.settings.attempt_timeout),
            )),
            Some(Ok(result)) => result,
        }
    }

    async fn push(
        &self,
        audio: NormalizedAudio<'_>,
        locales: &LocaleMode,
    ) -> Result<Recognition, TranscriptionError> {
        match audio {
            NormalizedAudio::Wav { bytes, header } => {
                let opened = match StreamFormat::pcm(&header) {
                    Ok(format) => self.engine.open_stream(format, locales).await,
                    Err(e) => Err(e),
                };

                let mut stream = match opened {
                    Ok(stream) => stream,
                    Err(e) if matches!(e.kind(), ErrorKind::NotWav | ErrorKind::InvalidRequest) => {
                        tracing::warn!(
                            engine = self.engine.name(),
                            sample_rate = header.sample_rate_hz,
                            bits = header.bits_per_sample,
                            channels = header.channels,
                            error = %e,
                            "PCM stream rejected, recognizing from a temp file"
                        );
                        return self.recognize_via_file(bytes, AudioFormat::Wav, locales).await;
                    }
                    Err(e) => return Err(e),
                };

                for chunk in header.data(bytes).chunks(self.settings.chunk_size.max(1)) {
                    stream.write(chunk).await?;
                }
                stream.finish().await
            }
            NormalizedAudio::Compressed { bytes, format } => {
                if !self.engine.supports_compressed() {
                    return Err(TranscriptionError::EngineUnavailable(format!(
                        "{} cannot demux {}",
                        self.engine.name(),
                        format
                    )));
                }
                let mut stream = self
                    .engine
                    .open_stream(StreamFormat::Compressed(format), locales)
                    .await?;
                stream.write(bytes).await?;
                stream.finish().await
            }
        }
    }

    /// The file is removed when this returns or the future is dropped
    async fn recognize_via_file(
        &self,
        bytes: &[u8],
        format: AudioFormat,
        locales: &LocaleMode,
    ) -> Result<Recognition, TranscriptionError> {
        let suffix = format!(".{}", format.extension());
        let mut builder = tempfile::Builder::new();
        builder.prefix("speechflow-").suffix(&suffix);
        let file = match &self.settings.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| {
            TranscriptionError::ConfigurationError(format!("Failed to create temp file: {}", e))
        })?;

        tokio::fs::write(file.path(), bytes).await.map_err(|e| {
            TranscriptionError::ConfigurationError(format!("Failed to write temp file: {}", e))
        })?;

        self.engine.recognize_file(file.path(), locales).await
    }
}
