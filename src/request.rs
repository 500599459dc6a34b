//! Inbound upload value and container classification.

use std::fmt;
use std::path::Path;

/// One audio upload handed to the pipeline by the calling business layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRequest {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub content_type: String,
    pub language_hint: Option<String>,
}

impl AudioRequest {
    pub fn new(
        bytes: Vec<u8>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        language_hint: Option<String>,
    ) -> Self {
        Self {
            bytes,
            file_name: file_name.into(),
            content_type: content_type.into(),
            language_hint,
        }
    }

    /// Language hint with "auto" and blank values treated as absent
    pub fn normalized_language(&self) -> Option<&str> {
        self.language_hint
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("auto"))
    }

    pub fn format(&self) -> AudioFormat {
        classify(&self.content_type, &self.file_name)
    }
}

/// Container hint derived from the declared content type and file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    Wav,
    Mp3,
    OggOrWebm,
    Unknown,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::OggOrWebm => "ogg",
            AudioFormat::Unknown => "bin",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::OggOrWebm => "audio/ogg",
            AudioFormat::Unknown => "application/octet-stream",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::OggOrWebm => "ogg/webm",
            AudioFormat::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Pick a container hint. A specific audio MIME type wins over the extension;
/// generic or missing types defer to the extension.
pub fn classify(content_type: &str, file_name: &str) -> AudioFormat {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let from_mime = match mime.as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" | "audio/x-pn-wav" => {
            AudioFormat::Wav
        }
        "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg-3" | "audio/x-mp3" => {
            AudioFormat::Mp3
        }
        "audio/ogg" | "audio/opus" | "audio/webm" | "video/webm" | "video/ogg"
        | "application/ogg" => AudioFormat::OggOrWebm,
        _ => AudioFormat::Unknown,
    };
    if from_mime != AudioFormat::Unknown {
        return from_mime;
    }

    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("wav" | "wave") => AudioFormat::Wav,
        Some("mp3") => AudioFormat::Mp3,
        Some("ogg" | "oga" | "opus" | "webm" | "weba") => AudioFormat::OggOrWebm,
        _ => AudioFormat::Unknown,
    }
}
