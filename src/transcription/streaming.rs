use super::openai::{classify_send_error, error_from_response, iso_language};
use super::{
    ChannelStream, LocaleMode, PushStream, Recognition, SpeechEngine, StreamFormat,
    TranscriptionError,
};
use crate::request::classify;
use crate::wav::WavEncoder;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Body;
use serde::Deserialize;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PROVIDER: &str = "OpenAI";

type BodyChunk = Result<Bytes, std::io::Error>;

#[derive(Deserialize)]
struct VerboseTranscription {
    text: String,
    #[serde(default)]
    language: Option<String>,
}

/// Speech engine that streams audio into an OpenAI-compatible
/// `/audio/transcriptions` endpoint while the HTTP request is in flight.
///
/// Auto mode cannot restrict candidates on this API; the engine detects the
/// language freely and reports it.
pub struct StreamingEngine {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
    compressed: bool,
}

impl StreamingEngine {
    pub fn new(api_key: String, base_url: Option<String>, model: String, compressed: bool) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
            client: reqwest::Client::new(),
            compressed,
        }
    }

    fn multipart_header(
        boundary: &str,
        model: &str,
        locales: &LocaleMode,
        file_name: &str,
        mime: &str,
    ) -> String {
        let mut body_parts = Vec::new();

        body_parts.push(format!(
            "--{}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\n{}\r\n",
            boundary, model
        ));

        body_parts.push(format!(
            "--{}\r\nContent-Disposition: form-data; name=\"response_format\"\r\n\r\nverbose_json\r\n",
            boundary
        ));

        if let LocaleMode::Forced(locale) = locales {
            body_parts.push(format!(
                "--{}\r\nContent-Disposition: form-data; name=\"language\"\r\n\r\n{}\r\n",
                boundary,
                iso_language(locale)
            ));
        }

        body_parts.push(format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            boundary, file_name, mime
        ));

        body_parts.join("")
    }

    /// Start the upload and return the push half of its body
    async fn start_upload(
        &self,
        format: StreamFormat,
        locales: &LocaleMode,
    ) -> Result<MultipartPushStream, TranscriptionError> {
        let (file_name, mime, preamble) = match format {
            StreamFormat::Pcm {
                sample_rate_hz,
                bits_per_sample,
                channels,
                data_length,
            } => {
                let header = WavEncoder::new(sample_rate_hz, channels)
                    .header_for(bits_per_sample, data_length);
                ("audio.wav".to_string(), "audio/wav", Some(header))
            }
            StreamFormat::Compressed(container) => (
                format!("audio.{}", container.extension()),
                container.mime_type(),
                None,
            ),
        };

        let boundary = format!("----SpeechflowBoundary{}", uuid::Uuid::new_v4().simple());
        let header = Self::multipart_header(&boundary, &self.model, locales, &file_name, mime);
        let footer = format!("\r\n--{}--\r\n", boundary);

        let (tx, rx) = mpsc::channel::<BodyChunk>(16);
        let closed =
            || TranscriptionError::network(PROVIDER, "Upload closed", "body channel closed");
        tx.send(Ok(Bytes::from(header))).await.map_err(|_| closed())?;
        if let Some(wav_header) = preamble {
            tx.send(Ok(Bytes::from(wav_header)))
                .await
                .map_err(|_| closed())?;
        }

        let url = format!("{}/audio/transcriptions", self.base_url);
        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::wrap_stream(ChannelStream::new(rx)));

        let request_task = tokio::spawn(async move {
            let response = request
                .send()
                .await
                .map_err(|e| TranscriptionError::network(PROVIDER, classify_send_error(&e), &e))?;

            let status = response.status();
            let response_text = response
                .text()
                .await
                .map_err(|e| TranscriptionError::network(PROVIDER, "Response reading error", e))?;

            if !status.is_success() {
                return Err(error_from_response(PROVIDER, status, response_text));
            }

            let parsed: VerboseTranscription =
                serde_json::from_str(&response_text).map_err(|e| {
                    TranscriptionError::JsonError(format!("Failed to parse response: {}", e))
                })?;

            Ok(Recognition {
                text: parsed.text.trim().to_string(),
                locale: parsed.language,
            })
        });

        Ok(MultipartPushStream {
            tx: Some(tx),
            footer,
            request: Some(request_task),
        })
    }
}

struct MultipartPushStream {
    tx: Option<mpsc::Sender<BodyChunk>>,
    footer: String,
    request: Option<JoinHandle<Result<Recognition, TranscriptionError>>>,
}

impl MultipartPushStream {
    async fn join(&mut self) -> Result<Recognition, TranscriptionError> {
        match self.request.take() {
            Some(handle) => handle.await.map_err(|e| {
                TranscriptionError::network(PROVIDER, "Request task failed", e)
            })?,
            None => Err(TranscriptionError::network(
                PROVIDER,
                "Request task failed",
                "stream already finished",
            )),
        }
    }
}

#[async_trait]
impl PushStream for MultipartPushStream {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TranscriptionError> {
        let Some(tx) = &self.tx else {
            return Err(TranscriptionError::network(PROVIDER, "Upload closed", "stream finished"));
        };
        if tx.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
            // The request ended early; surface its own error
            self.tx = None;
            return match self.join().await {
                Err(e) => Err(e),
                Ok(_) => Err(TranscriptionError::network(
                    PROVIDER,
                    "Upload closed",
                    "server answered before the upload finished",
                )),
            };
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<Recognition, TranscriptionError> {
        if let Some(tx) = self.tx.take() {
            // A closed channel means the request already ended; join reports why
            let _ = tx.send(Ok(Bytes::from(self.footer.clone()))).await;
        }
        self.join().await
    }
}

impl Drop for MultipartPushStream {
    fn drop(&mut self) {
        if let Some(handle) = self.request.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl SpeechEngine for StreamingEngine {
    fn name(&self) -> &str {
        "openai-streaming"
    }

    fn supports_compressed(&self) -> bool {
        self.compressed
    }

    async fn open_stream(
        &self,
        format: StreamFormat,
        locales: &LocaleMode,
    ) -> Result<Box<dyn PushStream>, TranscriptionError> {
        let stream = self.start_upload(format, locales).await?;
        Ok(Box::new(stream))
    }

    async fn recognize_file(
        &self,
        path: &Path,
        locales: &LocaleMode,
    ) -> Result<Recognition, TranscriptionError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            TranscriptionError::ConfigurationError(format!(
                "Failed to read audio file {}: {}",
                path.display(),
                e
            ))
        })?;
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let container = classify("", file_name);

        let mut stream = self
            .start_upload(StreamFormat::Compressed(container), locales)
            .await?;
        stream.write(&bytes).await?;
        Box::new(stream).finish().await
    }
}
