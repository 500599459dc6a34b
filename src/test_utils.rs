//! Shared test utilities to prevent race conditions between test modules

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cancel::CancelToken;
use crate::request::{AudioFormat, AudioRequest};
use crate::transcode::{FallbackDecoder, Transcoder};
use crate::transcription::{
    LocaleMode, PushStream, Recognition, SpeechEngine, StreamFormat, TranscriptionError,
    TranscriptionProvider,
};
use crate::wav::WavEncoder;

// Global mutex to ensure tests that modify environment variables run sequentially
pub static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Canonical 44-byte-header WAV around `data`
pub fn build_wav(channels: u16, sample_rate: u32, bits: u16, data: &[u8]) -> Vec<u8> {
    let mut wav = WavEncoder::new(sample_rate, channels).header_for(bits, data.len() as u32);
    wav.extend_from_slice(data);
    wav
}

/// `seconds` of 16 kHz mono 16-bit PCM with a non-silent pattern
pub fn speech_wav(seconds: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..16_000 * seconds)
        .flat_map(|i| ((i % 200) as i16 * 100).to_le_bytes())
        .collect();
    build_wav(1, 16_000, 16, &data)
}

/// MPEG-1 Layer III, 128 kbps, 44.1 kHz frames carrying silence.
/// Zeroed side info and main data decode to 1152 zero samples per frame
/// and channel.
pub fn silent_mp3(frames: usize, stereo: bool) -> Vec<u8> {
    const FRAME_LEN: usize = 417;
    // Channel mode 0b11 is mono, 0b00 is stereo
    let mode = if stereo { 0x00 } else { 0xC0 };
    let mut bytes = Vec::with_capacity(frames * FRAME_LEN);
    for _ in 0..frames {
        bytes.extend_from_slice(&[0xFF, 0xFB, 0x90, mode]);
        bytes.extend(std::iter::repeat(0u8).take(FRAME_LEN - 4));
    }
    bytes
}

/// Whether a process with this pid still exists (zombies count as gone)
pub fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // State is the field after the parenthesised command name
        Ok(stat) => stat
            .rsplit_once(')')
            .map_or(false, |(_, rest)| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

/// Poll a pidfile written by a child shell until it holds a pid
pub async fn wait_for_pid(pidfile: &Path) -> u32 {
    for _ in 0..200 {
        if let Ok(text) = std::fs::read_to_string(pidfile) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("child never wrote {}", pidfile.display());
}

pub fn mp3_request() -> AudioRequest {
    // Frame sync followed by junk; only the declared type matters to the fakes
    let mut bytes = vec![0xFF, 0xFB, 0x90, 0x64];
    bytes.extend(std::iter::repeat(0x11).take(4096));
    AudioRequest::new(bytes, "note.mp3", "audio/mpeg", None)
}

/// What a fake engine answers for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Text(String),
    /// Ok with an empty transcript
    Empty,
    NoSpeech,
    ProviderError,
    /// Never answers; only cancellation or a timeout ends the attempt
    Stall,
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        MockReply::Text(text.to_string())
    }
}

/// One recognition attempt seen by `MockEngine`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub locales: LocaleMode,
    /// `None` for file recognition
    pub format: Option<StreamFormat>,
    pub writes: Vec<usize>,
    pub file: Option<std::path::PathBuf>,
    pub file_existed: bool,
}

#[derive(Default)]
struct Replies {
    auto: Option<MockReply>,
    forced: HashMap<String, MockReply>,
}

impl Replies {
    fn for_locales(&self, locales: &LocaleMode) -> MockReply {
        let reply = match locales {
            LocaleMode::Auto(_) => self.auto.clone(),
            LocaleMode::Forced(locale) => self.forced.get(locale).cloned(),
        };
        reply.unwrap_or(MockReply::NoSpeech)
    }
}

/// Speech engine fake answering per locale mode and recording every call
#[derive(Clone)]
pub struct MockEngine {
    replies: Arc<Mutex<Replies>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    compressed: bool,
    fail_open: bool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(Replies::default())),
            calls: Arc::new(Mutex::new(Vec::new())),
            compressed: false,
            fail_open: false,
        }
    }

    /// Every locale mode answers `reply`
    pub fn answering(reply: MockReply) -> Self {
        Self::new().with_auto(reply.clone()).with_fallback_forced(reply)
    }

    pub fn with_auto(self, reply: MockReply) -> Self {
        self.replies.lock().unwrap().auto = Some(reply);
        self
    }

    pub fn with_forced(self, locale: &str, reply: MockReply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .forced
            .insert(locale.to_string(), reply);
        self
    }

    fn with_fallback_forced(self, reply: MockReply) -> Self {
        for locale in ["en-US", "fr-FR", "de-DE", "es-ES"] {
            self.replies
                .lock()
                .unwrap()
                .forced
                .insert(locale.to_string(), reply.clone());
        }
        self
    }

    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Make every `open_stream` fail as if the stream could not be built
    pub fn with_failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn reply_for(&self, locales: &LocaleMode) -> MockReply {
        self.replies.lock().unwrap().for_locales(locales)
    }
}

async fn resolve(reply: MockReply) -> Result<Recognition, TranscriptionError> {
    match reply {
        MockReply::Text(text) => Ok(Recognition {
            text,
            locale: Some("fr-FR".to_string()),
        }),
        MockReply::Empty => Ok(Recognition::default()),
        MockReply::NoSpeech => Err(TranscriptionError::NoSpeechDetected {
            provider: "mock".to_string(),
        }),
        MockReply::ProviderError => Err(TranscriptionError::network(
            "mock",
            "Connection failed",
            "refused",
        )),
        MockReply::Stall => {
            std::future::pending::<()>().await;
            Err(TranscriptionError::Canceled)
        }
    }
}

struct MockPushStream {
    call: MockCall,
    calls: Arc<Mutex<Vec<MockCall>>>,
    reply: MockReply,
}

#[async_trait]
impl PushStream for MockPushStream {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TranscriptionError> {
        self.call.writes.push(chunk.len());
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<Recognition, TranscriptionError> {
        let MockPushStream { call, calls, reply } = *self;
        calls.lock().unwrap().push(call);
        resolve(reply).await
    }
}

#[async_trait]
impl SpeechEngine for MockEngine {
    fn name(&self) -> &str {
        "mock-engine"
    }

    fn supports_compressed(&self) -> bool {
        self.compressed
    }

    async fn open_stream(
        &self,
        format: StreamFormat,
        locales: &LocaleMode,
    ) -> Result<Box<dyn PushStream>, TranscriptionError> {
        if self.fail_open {
            return Err(TranscriptionError::NotWav(
                "stream rejected the header".to_string(),
            ));
        }
        Ok(Box::new(MockPushStream {
            call: MockCall {
                locales: locales.clone(),
                format: Some(format),
                writes: Vec::new(),
                file: None,
                file_existed: false,
            },
            calls: Arc::clone(&self.calls),
            reply: self.reply_for(locales),
        }))
    }

    async fn recognize_file(
        &self,
        path: &Path,
        locales: &LocaleMode,
    ) -> Result<Recognition, TranscriptionError> {
        self.calls.lock().unwrap().push(MockCall {
            locales: locales.clone(),
            format: None,
            writes: Vec::new(),
            file: Some(path.to_path_buf()),
            file_existed: path.exists(),
        });
        resolve(self.reply_for(locales)).await
    }
}

/// Transcoder fake with a canned answer and a call counter
pub struct MockTranscoder {
    available: bool,
    output: Option<Vec<u8>>,
    calls: AtomicUsize,
}

impl MockTranscoder {
    pub fn succeeding(output: Vec<u8>) -> Self {
        Self {
            available: true,
            output: Some(output),
            calls: AtomicUsize::new(0),
        }
    }

    /// Available, but every conversion exits 1
    pub fn failing() -> Self {
        Self {
            available: true,
            output: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            output: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for MockTranscoder {
    fn name(&self) -> &str {
        "mock-transcoder"
    }

    async fn available(&self) -> bool {
        self.available
    }

    async fn convert(
        &self,
        _bytes: &[u8],
        _format: AudioFormat,
        _cancel: &CancelToken,
    ) -> Result<Vec<u8>, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output.clone().ok_or_else(|| {
            TranscriptionError::TranscodeFailure("exit code 1: invalid data".to_string())
        })
    }
}

/// Fallback decoder fake
pub struct MockDecoder {
    output: Option<Vec<u8>>,
    calls: AtomicUsize,
}

impl MockDecoder {
    pub fn succeeding(output: Vec<u8>) -> Self {
        Self {
            output: Some(output),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            output: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FallbackDecoder for MockDecoder {
    fn name(&self) -> &str {
        "mock-decoder"
    }

    fn available(&self) -> bool {
        self.output.is_some()
    }

    fn supports(&self, format: AudioFormat) -> bool {
        format == AudioFormat::Mp3
    }

    async fn decode(
        &self,
        _bytes: &[u8],
        _format: AudioFormat,
    ) -> Result<Vec<u8>, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output
            .clone()
            .ok_or_else(|| TranscriptionError::TranscodeFailure("decoder missing".to_string()))
    }
}

/// Secondary provider fake
pub struct MockProvider {
    reply: MockReply,
    calls: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(reply: MockReply) -> Self {
        Self {
            reply,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter that stays readable after the provider is boxed away
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl TranscriptionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock-provider"
    }

    async fn transcribe_upload(
        &self,
        _request: &AudioRequest,
    ) -> Result<String, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        resolve(self.reply.clone()).await.map(|r| r.text)
    }
}
