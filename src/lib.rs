//! speechflow library entrypoint and public exports.
//!
//! This crate exposes a library-first API with a thin diagnostic binary.
//! Callers build a `ProviderOrchestrator` once and hand it `AudioRequest`s;
//! the answer is a transcript or `None`.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

pub mod cancel;
pub mod cli;
pub mod command;
pub mod config;
pub mod logging;
pub mod orchestrator;
pub mod recognizer;
pub mod request;
#[cfg(test)]
pub mod test_utils;
pub mod transcode;
pub mod transcription;
pub mod wav;

pub use cancel::CancelToken;
pub use orchestrator::{ProviderOrchestrator, TranscriptionOutcome};
pub use request::{AudioFormat, AudioRequest};
pub use transcription::TranscriptionError;

use recognizer::{RecognitionSettings, StreamingRecognitionClient};
use transcode::ffmpeg::ProcessTranscoder;
use transcode::{Capabilities, FallbackDecoder, Transcoder};
use transcription::TranscriptionFactory;

#[cfg(feature = "fallback-decoder")]
fn fallback_decoders(config: &config::Config) -> Vec<Arc<dyn FallbackDecoder>> {
    vec![Arc::new(transcode::native::NativeDecoder::new(
        config.enable_fallback_decoder,
    ))]
}

#[cfg(not(feature = "fallback-decoder"))]
fn fallback_decoders(_config: &config::Config) -> Vec<Arc<dyn FallbackDecoder>> {
    Vec::new()
}

/// Wire the configured engine, transcoder, decoders and secondary providers,
/// probing capabilities once.
pub async fn build_orchestrator(config: &config::Config) -> Result<ProviderOrchestrator> {
    let engine = TranscriptionFactory::create_engine(config)
        .await
        .context("Failed to create speech engine")?;

    let transcoder: Arc<dyn Transcoder> = Arc::new(ProcessTranscoder::ffmpeg(
        config.transcoder_command.clone(),
        Duration::from_millis(config.transcoder_probe_timeout_ms),
    ));
    let decoders = fallback_decoders(config);
    let decoder_refs: Vec<&dyn FallbackDecoder> = decoders.iter().map(|d| &**d).collect();

    let capabilities =
        Capabilities::probe(Some(transcoder.as_ref()), &decoder_refs, engine.as_ref()).await;

    let recognizer = StreamingRecognitionClient::new(engine, RecognitionSettings::from(config));
    let mut orchestrator =
        ProviderOrchestrator::new(recognizer, capabilities).with_transcoder(transcoder);
    for decoder in decoders {
        orchestrator = orchestrator.with_decoder(decoder);
    }
    for provider in TranscriptionFactory::create_secondary(config)? {
        orchestrator = orchestrator.with_secondary(provider);
    }

    Ok(orchestrator)
}

/// Run the diagnostic CLI given `RunOptions`.
/// Returns a process exit code.
pub async fn run(options: cli::RunOptions) -> Result<i32> {
    // Bootstrap configuration
    let envfile = options.envfile.clone().unwrap_or_else(cli::default_envfile_path);
    let (config, source) = config::bootstrap(Some(&envfile))?;
    logging::init_tracing(logging::LogFormat::parse(&config.log_format));
    source.log();

    let pipeline = build_orchestrator(&config).await?;

    let bytes = tokio::fs::read(&options.file)
        .await
        .with_context(|| format!("Failed to read {}", options.file.display()))?;
    let file_name = options
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let request = AudioRequest::new(
        bytes,
        file_name,
        options.content_type.unwrap_or_default(),
        options.language,
    );

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, canceling transcription");
            trigger.cancel();
        }
    });

    match pipeline.transcribe_with_attempts(&request, &cancel).await {
        Ok(outcome) => {
            for attempt in &outcome.attempts {
                tracing::debug!(
                    provider = %attempt.provider_name,
                    succeeded = attempt.succeeded,
                    error_kind = ?attempt.error_kind,
                    "Recognition attempt"
                );
            }
            match outcome.text {
                Some(text) => {
                    println!("{}", text);
                    Ok(0)
                }
                None => {
                    eprintln!("No transcript produced");
                    Ok(1)
                }
            }
        }
        Err(e) if e.is_canceled() => {
            eprintln!("Transcription canceled");
            Ok(130)
        }
        Err(e) => Err(e.into()),
    }
}
