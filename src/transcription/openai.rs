use super::{ApiErrorDetails, TranscriptionError, TranscriptionProvider};
use crate::request::AudioRequest;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const PROVIDER: &str = "OpenAI";

// 25MB limit for the OpenAI transcription API
pub const MAX_FILE_SIZE: usize = 25 * 1024 * 1024;

/// Whisper-style endpoints take ISO-639-1 codes: "fr-FR" becomes "fr".
pub(crate) fn iso_language(locale: &str) -> String {
    locale
        .split(['-', '_'])
        .next()
        .unwrap_or(locale)
        .to_ascii_lowercase()
}

pub(crate) fn classify_send_error(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "Request timeout"
    } else if e.is_connect() {
        "Connection failed"
    } else if e.is_request() {
        "Request error"
    } else {
        "Network error"
    }
}

/// Map a non-200 response body onto the error taxonomy
pub(crate) fn error_from_response(
    provider: &str,
    status: reqwest::StatusCode,
    response_text: String,
) -> TranscriptionError {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return TranscriptionError::AuthenticationFailed {
            provider: provider.to_string(),
            details: Some("Invalid API key".to_string()),
        };
    }

    // Try to parse error details from response
    let (error_code, error_message) = if let Ok(json) = serde_json::from_str::<Value>(&response_text)
    {
        let code = json
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_str())
            .map(std::string::ToString::to_string);
        let message = json
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or(&response_text)
            .to_string();
        (code, message)
    } else {
        (None, response_text.clone())
    };

    TranscriptionError::ApiError(ApiErrorDetails {
        provider: provider.to_string(),
        status_code: Some(status.as_u16()),
        error_code,
        error_message,
        raw_response: Some(response_text),
    })
}

pub struct OpenAIProvider {
    api_key: String,
    client: reqwest::Client,
    max_retries: u32,
    model: String,
    base_url: String,
}

impl OpenAIProvider {
    /// Create a new `OpenAI` provider with custom options
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized
    pub fn new_with_options(
        api_key: String,
        timeout_seconds: Option<u64>,
        max_retries: Option<u32>,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Result<Self, TranscriptionError> {
        let timeout = Duration::from_secs(timeout_seconds.unwrap_or(30));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TranscriptionError::network(PROVIDER, "HTTP client error", e))?;

        Ok(OpenAIProvider {
            api_key,
            client,
            max_retries: max_retries.unwrap_or(3),
            model: model.unwrap_or_else(|| "whisper-1".to_string()),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }

    async fn transcribe_attempt(
        &self,
        request: &AudioRequest,
        language: Option<&str>,
    ) -> Result<String, TranscriptionError> {
        let url = format!("{}/audio/transcriptions", self.base_url);

        // The upload goes out in its original container
        let format = request.format();
        let file_name = if request.file_name.trim().is_empty() {
            format!("audio.{}", format.extension())
        } else {
            request.file_name.clone()
        };
        let mime = if request.content_type.trim().is_empty() {
            format.mime_type().to_string()
        } else {
            request.content_type.clone()
        };

        let audio_part = reqwest::multipart::Part::bytes(request.bytes.clone())
            .file_name(file_name)
            .mime_str(&mime)
            .map_err(|e| TranscriptionError::network(PROVIDER, "HTTP client error", e))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", audio_part)
            .text("model", self.model.clone());

        if let Some(lang) = language {
            form = form.text("language", iso_language(lang));
        }

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscriptionError::network(PROVIDER, classify_send_error(&e), &e))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| TranscriptionError::network(PROVIDER, "Response reading error", e))?;

        if status != reqwest::StatusCode::OK {
            return Err(error_from_response(PROVIDER, status, response_text));
        }

        let json: Value = serde_json::from_str(&response_text)
            .map_err(|e| TranscriptionError::JsonError(e.to_string()))?;
        let text = json.get("text").and_then(|t| t.as_str()).ok_or_else(|| {
            TranscriptionError::ApiError(ApiErrorDetails {
                provider: PROVIDER.to_string(),
                status_code: Some(200),
                error_code: None,
                error_message: "No text field in response".to_string(),
                raw_response: Some(response_text.clone()),
            })
        })?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl TranscriptionProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn transcribe_upload(
        &self,
        request: &AudioRequest,
    ) -> Result<String, TranscriptionError> {
        if request.bytes.len() > MAX_FILE_SIZE {
            return Err(TranscriptionError::FileTooLarge(request.bytes.len()));
        }

        let language = request.normalized_language();

        let mut retries = 0;
        loop {
            match self.transcribe_attempt(request, language).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Err(e);
                    }

                    // Don't retry on authentication errors
                    if matches!(e, TranscriptionError::AuthenticationFailed { .. }) {
                        return Err(e);
                    }

                    // Exponential backoff
                    let delay = backoff_delay(retries);
                    tracing::warn!(
                        provider = PROVIDER,
                        attempt = retries,
                        ?delay,
                        error = %e,
                        "Transcription attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// 1s, 2s, 4s, then 8s for every later retry
fn backoff_delay(retry: u32) -> Duration {
    Duration::from_millis(1000 * (1u64 << retry.saturating_sub(1).min(3)))
}
