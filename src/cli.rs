//! CLI-facing options decoupled from parsing.
//! The actual clap parsing lives in the binary and maps into this struct.

use std::path::PathBuf;

/// Options passed from the CLI into the library entrypoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub envfile: Option<PathBuf>,
    /// Audio file to transcribe
    pub file: PathBuf,
    /// Declared MIME type; guessed from the extension when absent
    pub content_type: Option<String>,
    pub language: Option<String>,
}

/// Default path for the env file.
pub fn default_envfile_path() -> PathBuf {
    crate::config::default_envfile()
}
