use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::Transcoder;
use crate::cancel::CancelToken;
use crate::command::{self, CommandError};
use crate::request::AudioFormat;
use crate::transcription::TranscriptionError;

/// Transcoder that pipes audio through an external media tool
pub struct ProcessTranscoder {
    command: Vec<String>,
    probe_command: Vec<String>,
    probe_timeout: Duration,
    available: OnceCell<bool>,
}

impl ProcessTranscoder {
    /// ffmpeg reading any container on stdin and writing 16 kHz mono
    /// 16-bit WAV to stdout
    pub fn ffmpeg(program: impl Into<String>, probe_timeout: Duration) -> Self {
        let program = program.into();
        let command = [
            program.as_str(),
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-vn",
            "-ac",
            "1",
            "-ar",
            "16000",
            "-acodec",
            "pcm_s16le",
            "-f",
            "wav",
            "pipe:1",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

        Self::with_commands(command, vec![program, "-version".to_string()], probe_timeout)
    }

    pub fn with_commands(
        command: Vec<String>,
        probe_command: Vec<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            command,
            probe_command,
            probe_timeout,
            available: OnceCell::new(),
        }
    }
}

#[async_trait]
impl Transcoder for ProcessTranscoder {
    fn name(&self) -> &str {
        self.command.first().map_or("transcoder", String::as_str)
    }

    async fn available(&self) -> bool {
        // Two first callers may both probe; the answer is the same either way
        *self
            .available
            .get_or_init(|| command::probe(&self.probe_command, self.probe_timeout))
            .await
    }

    async fn convert(
        &self,
        bytes: &[u8],
        format: AudioFormat,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, TranscriptionError> {
        let output = command::execute_piped(&self.command, bytes, cancel)
            .await
            .map_err(|e| match e {
                CommandError::Canceled(_) => TranscriptionError::Canceled,
                other => TranscriptionError::TranscodeFailure(other.to_string()),
            })?;

        if !output.success() {
            tracing::warn!(
                transcoder = self.name(),
                %format,
                bytes = bytes.len(),
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Transcoder exited with failure"
            );
            return Err(TranscriptionError::TranscodeFailure(format!(
                "exit code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        if output.stdout.is_empty() {
            return Err(TranscriptionError::TranscodeFailure(
                "transcoder produced no output".to_string(),
            ));
        }

        tracing::debug!(
            transcoder = self.name(),
            %format,
            input_bytes = bytes.len(),
            output_bytes = output.stdout.len(),
            "Transcoded audio"
        );
        Ok(output.stdout)
    }
}
