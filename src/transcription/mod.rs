use async_trait::async_trait;
use std::fmt;
use std::fmt::Write;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::Stream;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::request::{AudioFormat, AudioRequest};
use crate::wav::WavHeader;

// Push-stream engine over Google Speech v2 gRPC
pub mod google_v2;
// Secondary provider posting the whole upload
pub mod openai;
// Push-stream engine over a streamed multipart upload
pub mod streaming;

#[derive(Debug)]
pub struct ApiErrorDetails {
    pub provider: String,
    pub status_code: Option<u16>,
    pub error_code: Option<String>,
    pub error_message: String,
    pub raw_response: Option<String>,
}

#[derive(Debug)]
pub struct NetworkErrorDetails {
    pub provider: String,
    pub error_type: String,
    pub error_message: String,
}

#[derive(Debug)]
pub enum TranscriptionError {
    NotWav(String),
    TranscodeFailure(String),
    EngineUnavailable(String),
    NoSpeechDetected {
        provider: String,
    },
    AuthenticationFailed {
        provider: String,
        details: Option<String>,
    },
    NetworkError(NetworkErrorDetails),
    FileTooLarge(usize),
    ApiError(ApiErrorDetails),
    JsonError(String),
    ConfigurationError(String),
    UnsupportedProvider(String),
    InvalidRequest(String),
    Canceled,
}

/// Coarse classification used for fallback decisions and attempt logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotWav,
    TranscodeFailure,
    EngineUnavailable,
    NoSpeechDetected,
    ProviderError,
    Canceled,
    InvalidRequest,
}

impl TranscriptionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranscriptionError::NotWav(_) => ErrorKind::NotWav,
            TranscriptionError::TranscodeFailure(_) => ErrorKind::TranscodeFailure,
            TranscriptionError::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            TranscriptionError::NoSpeechDetected { .. } => ErrorKind::NoSpeechDetected,
            TranscriptionError::Canceled => ErrorKind::Canceled,
            TranscriptionError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            TranscriptionError::AuthenticationFailed { .. }
            | TranscriptionError::NetworkError(_)
            | TranscriptionError::FileTooLarge(_)
            | TranscriptionError::ApiError(_)
            | TranscriptionError::JsonError(_)
            | TranscriptionError::ConfigurationError(_)
            | TranscriptionError::UnsupportedProvider(_) => ErrorKind::ProviderError,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TranscriptionError::Canceled)
    }

    pub(crate) fn network(provider: &str, error_type: &str, error: impl fmt::Display) -> Self {
        TranscriptionError::NetworkError(NetworkErrorDetails {
            provider: provider.to_string(),
            error_type: error_type.to_string(),
            error_message: error.to_string(),
        })
    }

    pub(crate) fn api(
        provider: &str,
        status_code: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        TranscriptionError::ApiError(ApiErrorDetails {
            provider: provider.to_string(),
            status_code,
            error_code: None,
            error_message: message.into(),
            raw_response: None,
        })
    }
}

impl fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptionError::NotWav(reason) => write!(f, "Not a PCM WAV buffer: {}", reason),
            TranscriptionError::TranscodeFailure(reason) => {
                write!(f, "Transcoding failed: {}", reason)
            }
            TranscriptionError::EngineUnavailable(reason) => {
                write!(f, "Recognition engine unavailable: {}", reason)
            }
            TranscriptionError::NoSpeechDetected { provider } => {
                write!(f, "No speech detected by {}", provider)
            }
            TranscriptionError::AuthenticationFailed { provider, details } => {
                if let Some(details) = details {
                    write!(f, "Authentication failed with {}: {}", provider, details)
                } else {
                    write!(f, "Authentication failed with {}", provider)
                }
            }
            TranscriptionError::NetworkError(details) => {
                write!(
                    f,
                    "Network error with {}: {} - {}",
                    details.provider, details.error_type, details.error_message
                )
            }
            TranscriptionError::FileTooLarge(size) => {
                write!(f, "File too large: {} bytes", size)
            }
            TranscriptionError::ApiError(details) => {
                let mut msg = format!("API error with {}", details.provider);

                if let Some(status) = details.status_code {
                    write!(&mut msg, " (HTTP {})", status)?;
                }

                if let Some(code) = &details.error_code {
                    write!(&mut msg, " [{}]", code)?;
                }

                write!(&mut msg, ": {}", details.error_message)?;

                write!(f, "{}", msg)
            }
            TranscriptionError::JsonError(msg) => write!(f, "JSON error: {}", msg),
            TranscriptionError::ConfigurationError(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            TranscriptionError::UnsupportedProvider(provider) => {
                write!(f, "Unsupported provider: {}", provider)
            }
            TranscriptionError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            TranscriptionError::Canceled => write!(f, "Transcription canceled"),
        }
    }
}

impl std::error::Error for TranscriptionError {}

/// One recognition try, kept for diagnostics only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAttempt {
    pub provider_name: String,
    pub succeeded: bool,
    pub error_kind: Option<ErrorKind>,
    pub text: Option<String>,
}

impl ProviderAttempt {
    pub fn from_result(provider_name: &str, result: &Result<String, TranscriptionError>) -> Self {
        match result {
            Ok(text) if !text.trim().is_empty() => Self {
                provider_name: provider_name.to_string(),
                succeeded: true,
                error_kind: None,
                text: Some(text.clone()),
            },
            Ok(_) => Self {
                provider_name: provider_name.to_string(),
                succeeded: false,
                error_kind: Some(ErrorKind::NoSpeechDetected),
                text: None,
            },
            Err(e) => Self {
                provider_name: provider_name.to_string(),
                succeeded: false,
                error_kind: Some(e.kind()),
                text: None,
            },
        }
    }
}

/// Which locales a recognition attempt may match
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocaleMode {
    /// Let the engine pick among these candidates
    Auto(Vec<String>),
    Forced(String),
}

impl LocaleMode {
    pub fn codes(&self) -> Vec<String> {
        match self {
            LocaleMode::Auto(candidates) => candidates.clone(),
            LocaleMode::Forced(locale) => vec![locale.clone()],
        }
    }
}

/// How the bytes written to a push stream are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Pcm {
        sample_rate_hz: u32,
        bits_per_sample: u16,
        channels: u16,
        data_length: u32,
    },
    Compressed(AudioFormat),
}

impl StreamFormat {
    /// Stream layout for a parsed header. Rejects headers that parse but
    /// cannot describe a usable stream.
    pub fn pcm(header: &WavHeader) -> Result<Self, TranscriptionError> {
        if !(4_000..=192_000).contains(&header.sample_rate_hz) {
            return Err(TranscriptionError::NotWav(format!(
                "implausible sample rate {} Hz",
                header.sample_rate_hz
            )));
        }
        Ok(StreamFormat::Pcm {
            sample_rate_hz: header.sample_rate_hz,
            bits_per_sample: header.bits_per_sample,
            channels: header.channels,
            data_length: header.data_length,
        })
    }
}

/// Text an engine heard, and the locale it matched when it reports one
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Recognition {
    pub text: String,
    pub locale: Option<String>,
}

/// Caller-controlled ingestion channel into a recognition engine
#[async_trait]
pub trait PushStream: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TranscriptionError>;

    /// Signal end of stream and wait for the single recognition result
    async fn finish(self: Box<Self>) -> Result<Recognition, TranscriptionError>;
}

#[async_trait]
pub trait SpeechEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Whether compressed containers may be pushed without local decoding
    fn supports_compressed(&self) -> bool;

    async fn open_stream(
        &self,
        format: StreamFormat,
        locales: &LocaleMode,
    ) -> Result<Box<dyn PushStream>, TranscriptionError>;

    /// Recognize a complete audio file, letting the engine detect its layout
    async fn recognize_file(
        &self,
        path: &Path,
        locales: &LocaleMode,
    ) -> Result<Recognition, TranscriptionError>;
}

/// Provider that accepts the original upload in any container
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe_upload(&self, request: &AudioRequest)
        -> Result<String, TranscriptionError>;
}

/// `Stream` over an mpsc receiver, used to feed request bodies from push writes
pub struct ChannelStream<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> ChannelStream<T> {
    pub fn new(receiver: mpsc::Receiver<T>) -> Self {
        Self { receiver }
    }
}

impl<T> Unpin for ChannelStream<T> {}

impl<T> Stream for ChannelStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

pub struct TranscriptionFactory;

impl TranscriptionFactory {
    pub async fn create_engine(
        config: &Config,
    ) -> Result<Arc<dyn SpeechEngine>, TranscriptionError> {
        match config.speech_engine.to_lowercase().as_str() {
            "google" => {
                let credentials_path =
                    config.google_application_credentials.clone().ok_or_else(|| {
                        TranscriptionError::ConfigurationError(
                            "Google application credentials not found".to_string(),
                        )
                    })?;

                let engine = google_v2::GoogleV2Engine::new(
                    credentials_path,
                    config.google_speech_model.clone(),
                    config.speech_compressed_streams,
                )
                .await?;

                Ok(Arc::new(engine))
            }
            "openai" => {
                let api_key = config.openai_api_key.clone().ok_or_else(|| {
                    TranscriptionError::ConfigurationError("OpenAI API key not found".to_string())
                })?;

                let engine = streaming::StreamingEngine::new(
                    api_key,
                    config.openai_base_url.clone(),
                    config.whisper_model.clone(),
                    config.speech_compressed_streams,
                );

                Ok(Arc::new(engine))
            }
            _ => Err(TranscriptionError::UnsupportedProvider(
                config.speech_engine.clone(),
            )),
        }
    }

    /// Providers tried, in order, before the speech engine
    pub fn create_secondary(
        config: &Config,
    ) -> Result<Vec<Box<dyn TranscriptionProvider>>, TranscriptionError> {
        match config.secondary_provider.to_lowercase().as_str() {
            "" | "none" => Ok(Vec::new()),
            "openai" => {
                let api_key = config.openai_api_key.clone().ok_or_else(|| {
                    TranscriptionError::ConfigurationError("OpenAI API key not found".to_string())
                })?;

                let client = openai::OpenAIProvider::new_with_options(
                    api_key,
                    Some(config.whisper_timeout_seconds),
                    Some(config.whisper_max_retries),
                    Some(config.whisper_model.clone()),
                    config.openai_base_url.clone(),
                )?;

                Ok(vec![Box::new(client)])
            }
            _ => Err(TranscriptionError::UnsupportedProvider(
                config.secondary_provider.clone(),
            )),
        }
    }
}
