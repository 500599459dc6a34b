use async_trait::async_trait;
use google_api_proto::google::cloud::speech::v2::{
    explicit_decoding_config::AudioEncoding, recognition_config::DecodingConfig,
    recognize_request::AudioSource, speech_client::SpeechClient,
    streaming_recognize_request::StreamingRequest, AutoDetectDecodingConfig,
    ExplicitDecodingConfig, RecognitionConfig, RecognitionFeatures, RecognizeRequest,
    StreamingRecognitionConfig, StreamingRecognizeRequest,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tonic::{
    transport::{Channel, ClientTlsConfig},
    Code, Request, Status,
};
use yup_oauth2::{ServiceAccountAuthenticator, ServiceAccountKey};

use super::{
    ChannelStream, LocaleMode, PushStream, Recognition, SpeechEngine, StreamFormat,
    TranscriptionError,
};

const PROVIDER: &str = "Google";
const ENGINE_NAME: &str = "google-v2";
const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
// Google caps auto-detection at three candidate languages
const MAX_LANGUAGE_CODES: usize = 3;
// Streaming audio messages must stay under 15 KB each
const MAX_AUDIO_MESSAGE: usize = 15 * 1024;
// Access tokens live an hour; refresh well before that
const TOKEN_LIFETIME: Duration = Duration::from_secs(45 * 60);

struct CachedToken {
    header: String,
    fetched_at: Instant,
}

pub struct GoogleV2Engine {
    client: SpeechClient<Channel>,
    key: ServiceAccountKey,
    token: Arc<Mutex<Option<CachedToken>>>,
    recognizer: String,
    model: String,
    compressed: bool,
}

impl GoogleV2Engine {
    pub async fn new(
        credentials_path: String,
        model: String,
        compressed: bool,
    ) -> Result<Self, TranscriptionError> {
        // Read service account key
        let service_account_key =
            tokio::fs::read_to_string(&credentials_path)
                .await
                .map_err(|e| {
                    TranscriptionError::ConfigurationError(format!(
                        "Failed to read service account key from {}: {}",
                        credentials_path, e
                    ))
                })?;

        let key: ServiceAccountKey = serde_json::from_str(&service_account_key).map_err(|e| {
            TranscriptionError::ConfigurationError(format!(
                "Failed to parse service account key: {}",
                e
            ))
        })?;

        let project_id = key.project_id.clone().ok_or_else(|| {
            TranscriptionError::ConfigurationError(
                "No project_id in service account key".to_string(),
            )
        })?;

        // Create channel with explicit TLS configuration
        let tls_config = ClientTlsConfig::new().domain_name("speech.googleapis.com");
        let endpoint = Channel::from_static("https://speech.googleapis.com")
            .tls_config(tls_config)
            .map_err(|e| TranscriptionError::network(PROVIDER, "TLS config error", e))?
            .connect_timeout(Duration::from_secs(10));
        let channel = endpoint.connect().await.map_err(|e| {
            TranscriptionError::network(
                PROVIDER,
                "Connection failed",
                format!("Failed to connect to speech.googleapis.com: {}", e),
            )
        })?;

        let engine = Self {
            client: SpeechClient::new(channel),
            key,
            token: Arc::new(Mutex::new(None)),
            recognizer: format!("projects/{}/locations/global/recognizers/_", project_id),
            model,
            compressed,
        };

        // Fail at startup rather than on the first upload
        engine.authorization().await?;
        Ok(engine)
    }

    /// Bearer header for the current access token, refreshed when stale
    async fn authorization(&self) -> Result<String, TranscriptionError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.fetched_at.elapsed() < TOKEN_LIFETIME {
                return Ok(token.header.clone());
            }
        }

        let auth_failed = |e: &dyn std::fmt::Display| TranscriptionError::AuthenticationFailed {
            provider: PROVIDER.to_string(),
            details: Some(e.to_string()),
        };

        let auth = ServiceAccountAuthenticator::builder(self.key.clone())
            .build()
            .await
            .map_err(|e| auth_failed(&e))?;
        let token = auth.token(&[SCOPE]).await.map_err(|e| auth_failed(&e))?;
        let header = format!("Bearer {}", token.token().unwrap_or(""));

        tracing::debug!(provider = PROVIDER, "Fetched access token");
        *cached = Some(CachedToken {
            header: header.clone(),
            fetched_at: Instant::now(),
        });
        Ok(header)
    }

    async fn authorized<T>(&self, message: T) -> Result<Request<T>, TranscriptionError> {
        let header = self.authorization().await?;
        let mut req = Request::new(message);
        req.metadata_mut().insert(
            "authorization",
            header
                .parse()
                .map_err(|_| TranscriptionError::AuthenticationFailed {
                    provider: PROVIDER.to_string(),
                    details: Some("Access token is not a valid header".to_string()),
                })?,
        );
        Ok(req)
    }

    fn recognition_config(
        &self,
        decoding: DecodingConfig,
        locales: &LocaleMode,
    ) -> RecognitionConfig {
        RecognitionConfig {
            decoding_config: Some(decoding),
            model: self.model.clone(),
            language_codes: build_language_codes(locales),
            features: Some(RecognitionFeatures {
                enable_automatic_punctuation: true,
                enable_word_time_offsets: false,
                enable_word_confidence: false,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Language codes for one attempt: the forced locale, or up to three
/// distinct auto-detection candidates.
fn build_language_codes(locales: &LocaleMode) -> Vec<String> {
    let mut language_codes: Vec<String> = Vec::new();

    for code in locales.codes() {
        if language_codes.len() >= MAX_LANGUAGE_CODES {
            break;
        }
        if !code.trim().is_empty() && !language_codes.contains(&code) {
            language_codes.push(code);
        }
    }

    language_codes
}

/// Decoding config for a push stream
fn decoding_for(format: StreamFormat) -> Result<DecodingConfig, TranscriptionError> {
    match format {
        StreamFormat::Pcm {
            sample_rate_hz,
            bits_per_sample: 16,
            channels,
            ..
        } => Ok(DecodingConfig::ExplicitDecodingConfig(ExplicitDecodingConfig {
            encoding: AudioEncoding::Linear16 as i32,
            sample_rate_hertz: sample_rate_hz as i32,
            audio_channel_count: i32::from(channels),
            ..Default::default()
        })),
        StreamFormat::Pcm {
            bits_per_sample, ..
        } => Err(TranscriptionError::NotWav(format!(
            "{}-bit PCM cannot be streamed as LINEAR16",
            bits_per_sample
        ))),
        StreamFormat::Compressed(_) => Ok(DecodingConfig::AutoDecodingConfig(
            AutoDetectDecodingConfig {},
        )),
    }
}

fn status_error(status: &Status) -> TranscriptionError {
    match status.code() {
        Code::Unauthenticated | Code::PermissionDenied => TranscriptionError::AuthenticationFailed {
            provider: PROVIDER.to_string(),
            details: Some(status.message().to_string()),
        },
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
            TranscriptionError::network(PROVIDER, "gRPC transport", status.message())
        }
        code => TranscriptionError::api(
            PROVIDER,
            None,
            format!("status={:?}, message={}", code, status.message()),
        ),
    }
}

fn no_speech() -> TranscriptionError {
    TranscriptionError::NoSpeechDetected {
        provider: ENGINE_NAME.to_string(),
    }
}

/// Join transcripts in order; the first non-empty language code wins.
fn collect_results<'a>(
    results: impl Iterator<Item = (&'a str, &'a str)>,
    text: &mut Vec<String>,
    locale: &mut Option<String>,
) {
    for (transcript, language_code) in results {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            continue;
        }
        text.push(transcript.to_string());
        if locale.is_none() && !language_code.is_empty() {
            *locale = Some(language_code.to_string());
        }
    }
}

fn into_recognition(
    text: Vec<String>,
    locale: Option<String>,
) -> Result<Recognition, TranscriptionError> {
    let text = text.join(" ");
    if text.is_empty() {
        return Err(no_speech());
    }
    Ok(Recognition { text, locale })
}

struct GrpcPushStream {
    tx: Option<mpsc::Sender<StreamingRecognizeRequest>>,
    call: Option<JoinHandle<Result<Recognition, TranscriptionError>>>,
}

impl GrpcPushStream {
    async fn join(&mut self) -> Result<Recognition, TranscriptionError> {
        match self.call.take() {
            Some(handle) => handle
                .await
                .map_err(|e| TranscriptionError::network(PROVIDER, "Stream task failed", e))?,
            None => Err(TranscriptionError::network(
                PROVIDER,
                "Stream task failed",
                "stream already finished",
            )),
        }
    }
}

#[async_trait]
impl PushStream for GrpcPushStream {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TranscriptionError> {
        let Some(tx) = &self.tx else {
            return Err(TranscriptionError::network(PROVIDER, "Stream closed", "stream finished"));
        };
        for piece in chunk.chunks(MAX_AUDIO_MESSAGE) {
            let message = StreamingRecognizeRequest {
                streaming_request: Some(StreamingRequest::Audio(piece.to_vec().into())),
                ..Default::default()
            };
            if tx.send(message).await.is_err() {
                // The call ended early; surface its own error
                self.tx = None;
                return match self.join().await {
                    Err(e) => Err(e),
                    Ok(_) => Err(TranscriptionError::network(
                        PROVIDER,
                        "Stream closed",
                        "server closed the stream before end of audio",
                    )),
                };
            }
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<Recognition, TranscriptionError> {
        // Dropping the sender half-closes the request stream
        self.tx = None;
        self.join().await
    }
}

impl Drop for GrpcPushStream {
    fn drop(&mut self) {
        if let Some(handle) = self.call.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl SpeechEngine for GoogleV2Engine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn supports_compressed(&self) -> bool {
        self.compressed
    }

    async fn open_stream(
        &self,
        format: StreamFormat,
        locales: &LocaleMode,
    ) -> Result<Box<dyn PushStream>, TranscriptionError> {
        let decoding = decoding_for(format)?;
        let config = StreamingRecognizeRequest {
            recognizer: self.recognizer.clone(),
            streaming_request: Some(StreamingRequest::StreamingConfig(
                StreamingRecognitionConfig {
                    config: Some(self.recognition_config(decoding, locales)),
                    ..Default::default()
                },
            )),
        };

        let (tx, rx) = mpsc::channel::<StreamingRecognizeRequest>(32);
        tx.send(config).await.map_err(|_| {
            TranscriptionError::network(PROVIDER, "Stream closed", "request channel closed")
        })?;

        let request = self.authorized(ChannelStream::new(rx)).await?;
        let mut client = self.client.clone();

        let call = tokio::spawn(async move {
            let mut responses = client
                .streaming_recognize(request)
                .await
                .map_err(|e| status_error(&e))?
                .into_inner();

            let mut text = Vec::new();
            let mut locale = None;
            while let Some(response) = responses.message().await.map_err(|e| status_error(&e))? {
                let finals = response.results.iter().filter(|r| r.is_final).filter_map(|r| {
                    r.alternatives
                        .first()
                        .map(|alt| (alt.transcript.as_str(), r.language_code.as_str()))
                });
                collect_results(finals, &mut text, &mut locale);
            }

            into_recognition(text, locale)
        });

        Ok(Box::new(GrpcPushStream {
            tx: Some(tx),
            call: Some(call),
        }))
    }

    async fn recognize_file(
        &self,
        path: &Path,
        locales: &LocaleMode,
    ) -> Result<Recognition, TranscriptionError> {
        let content = tokio::fs::read(path).await.map_err(|e| {
            TranscriptionError::ConfigurationError(format!(
                "Failed to read audio file {}: {}",
                path.display(),
                e
            ))
        })?;

        let request = RecognizeRequest {
            recognizer: self.recognizer.clone(),
            config: Some(self.recognition_config(
                DecodingConfig::AutoDecodingConfig(AutoDetectDecodingConfig {}),
                locales,
            )),
            config_mask: None,
            audio_source: Some(AudioSource::Content(content.into())),
        };

        let mut client = self.client.clone();
        let response = client
            .recognize(self.authorized(request).await?)
            .await
            .map_err(|e| status_error(&e))?
            .into_inner();

        let mut text = Vec::new();
        let mut locale = None;
        let results = response.results.iter().filter_map(|r| {
            r.alternatives
                .first()
                .map(|alt| (alt.transcript.as_str(), r.language_code.as_str()))
        });
        collect_results(results, &mut text, &mut locale);

        into_recognition(text, locale)
    }
}
