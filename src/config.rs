use anyhow::Result;
use std::path::{Path, PathBuf};

/// Configuration for speechflow loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub secondary_provider: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub whisper_model: String,
    pub whisper_timeout_seconds: u64,
    pub whisper_max_retries: u32,
    pub speech_engine: String,
    pub google_application_credentials: Option<String>,
    pub google_speech_model: String,
    pub speech_compressed_streams: bool,
    pub speech_default_locale: String,
    pub speech_candidate_locales: Vec<String>,
    pub stream_chunk_bytes: usize,
    pub recognition_timeout_seconds: u64,
    pub transcoder_command: String,
    pub transcoder_probe_timeout_ms: u64,
    pub enable_fallback_decoder: bool,
    pub temp_dir: Option<PathBuf>,
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secondary_provider: "none".to_string(),
            openai_api_key: None,
            openai_base_url: None,
            whisper_model: "whisper-1".to_string(),
            whisper_timeout_seconds: 60,
            whisper_max_retries: 3,
            speech_engine: "google".to_string(),
            google_application_credentials: None,
            google_speech_model: "long".to_string(),
            speech_compressed_streams: true,
            speech_default_locale: "en-US".to_string(),
            speech_candidate_locales: vec![
                "en-US".to_string(),
                "fr-FR".to_string(),
                "de-DE".to_string(),
            ],
            stream_chunk_bytes: 32 * 1024,
            recognition_timeout_seconds: 60,
            transcoder_command: "ffmpeg".to_string(),
            transcoder_probe_timeout_ms: 2000,
            enable_fallback_decoder: true,
            temp_dir: None,
            log_format: "pretty".to_string(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = std::env::var(name) {
        if let Ok(parsed) = value.trim().parse::<T>() {
            *target = parsed;
        }
    }
}

fn bool_var(name: &str, target: &mut bool) {
    if let Ok(value) = std::env::var(name) {
        *target = value.to_lowercase() == "true";
    }
}

impl Config {
    /// Load configuration from environment variables
    #[allow(clippy::field_reassign_with_default)]
    pub fn from_env() -> Self {
        let mut config = Config::default();

        // Secondary provider
        if let Ok(provider) = std::env::var("SECONDARY_PROVIDER") {
            config.secondary_provider = provider;
        }
        config.openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        config.openai_base_url = std::env::var("OPENAI_BASE_URL").ok();

        if let Ok(model) = std::env::var("WHISPER_MODEL") {
            config.whisper_model = model;
        }
        parse_var("WHISPER_TIMEOUT_SECONDS", &mut config.whisper_timeout_seconds);
        parse_var("WHISPER_MAX_RETRIES", &mut config.whisper_max_retries);

        // Speech engine
        if let Ok(engine) = std::env::var("SPEECH_ENGINE") {
            config.speech_engine = engine;
        }
        config.google_application_credentials =
            std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok();
        if let Ok(model) = std::env::var("GOOGLE_SPEECH_MODEL") {
            config.google_speech_model = model;
        }
        bool_var("SPEECH_COMPRESSED_STREAMS", &mut config.speech_compressed_streams);

        // Recognition
        if let Ok(locale) = std::env::var("SPEECH_DEFAULT_LOCALE") {
            if !locale.trim().is_empty() {
                config.speech_default_locale = locale.trim().to_string();
            }
        }
        if let Ok(locales) = std::env::var("SPEECH_CANDIDATE_LOCALES") {
            let parsed: Vec<String> = locales
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                config.speech_candidate_locales = parsed;
            }
        }
        parse_var("STREAM_CHUNK_BYTES", &mut config.stream_chunk_bytes);
        parse_var(
            "RECOGNITION_TIMEOUT_SECONDS",
            &mut config.recognition_timeout_seconds,
        );

        // Normalization
        if let Ok(command) = std::env::var("TRANSCODER_COMMAND") {
            config.transcoder_command = command;
        }
        parse_var(
            "TRANSCODER_PROBE_TIMEOUT_MS",
            &mut config.transcoder_probe_timeout_ms,
        );
        bool_var("ENABLE_FALLBACK_DECODER", &mut config.enable_fallback_decoder);
        config.temp_dir = std::env::var("SPEECHFLOW_TEMP_DIR")
            .ok()
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);

        // Logging
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.log_format = format.to_lowercase();
        }

        config
    }

    /// Load environment file and return config
    pub fn load_env_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenvy::from_path(path)?;
        Ok(Self::from_env())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.speech_engine.to_lowercase().as_str() {
            "google" if self.google_application_credentials.is_none() => {
                return Err(anyhow::anyhow!(
                    "GOOGLE_APPLICATION_CREDENTIALS is required for SPEECH_ENGINE=google"
                ));
            }
            "openai" if self.openai_api_key.is_none() => {
                return Err(anyhow::anyhow!(
                    "OPENAI_API_KEY is required for SPEECH_ENGINE=openai"
                ));
            }
            "google" | "openai" => {}
            other => {
                return Err(anyhow::anyhow!("Unknown SPEECH_ENGINE: {}", other));
            }
        }

        if self.secondary_provider.eq_ignore_ascii_case("openai") && self.openai_api_key.is_none()
        {
            return Err(anyhow::anyhow!(
                "OPENAI_API_KEY is required for SECONDARY_PROVIDER=openai"
            ));
        }

        if self.stream_chunk_bytes == 0 {
            return Err(anyhow::anyhow!("STREAM_CHUNK_BYTES must be greater than 0"));
        }

        if self.recognition_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "RECOGNITION_TIMEOUT_SECONDS must be greater than 0"
            ));
        }

        if self.transcoder_command.trim().is_empty() {
            return Err(anyhow::anyhow!("TRANSCODER_COMMAND must not be empty"));
        }

        if let Some(dir) = &self.temp_dir {
            if !dir.is_dir() {
                return Err(anyhow::anyhow!(
                    "SPEECHFLOW_TEMP_DIR {} is not a directory",
                    dir.display()
                ));
            }
        }

        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/speechflow/.env`, or `./speechflow/.env` without a home
pub fn default_envfile() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| std::env::var("HOME").map_or_else(|_| PathBuf::from("."), PathBuf::from))
        .join("speechflow")
        .join(".env")
}

/// Where the configuration came from. Reported once logging is up,
/// since logging itself is configured from the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvSource {
    File(PathBuf),
    Missing(PathBuf),
    Unreadable { path: PathBuf, error: String },
}

impl EnvSource {
    pub fn log(&self) {
        match self {
            EnvSource::File(path) => {
                tracing::debug!(path = %path.display(), "Loaded environment file");
            }
            EnvSource::Missing(path) => {
                tracing::debug!(
                    path = %path.display(),
                    "Environment file not found, using system environment"
                );
            }
            EnvSource::Unreadable { path, error } => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "Failed to load environment file, falling back to system environment"
                );
            }
        }
    }
}

/// Load the env file when present, fall back to the process environment,
/// then validate.
pub fn bootstrap(envfile: Option<&Path>) -> Result<(Config, EnvSource)> {
    let envfile = envfile.map_or_else(default_envfile, Path::to_path_buf);

    let (config, source) = if envfile.exists() {
        match Config::load_env_file(&envfile) {
            Ok(config) => (config, EnvSource::File(envfile)),
            Err(e) => (
                Config::from_env(),
                EnvSource::Unreadable {
                    path: envfile,
                    error: e.to_string(),
                },
            ),
        }
    } else {
        (Config::from_env(), EnvSource::Missing(envfile))
    };

    config.validate()?;
    Ok((config, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ENV_MUTEX;
    use std::env;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VARS: &[&str] = &[
        "SECONDARY_PROVIDER",
        "OPENAI_API_KEY",
        "OPENAI_BASE_URL",
        "WHISPER_MODEL",
        "WHISPER_TIMEOUT_SECONDS",
        "WHISPER_MAX_RETRIES",
        "SPEECH_ENGINE",
        "GOOGLE_APPLICATION_CREDENTIALS",
        "GOOGLE_SPEECH_MODEL",
        "SPEECH_COMPRESSED_STREAMS",
        "SPEECH_DEFAULT_LOCALE",
        "SPEECH_CANDIDATE_LOCALES",
        "STREAM_CHUNK_BYTES",
        "RECOGNITION_TIMEOUT_SECONDS",
        "TRANSCODER_COMMAND",
        "TRANSCODER_PROBE_TIMEOUT_MS",
        "ENABLE_FALLBACK_DECODER",
        "SPEECHFLOW_TEMP_DIR",
        "LOG_FORMAT",
    ];

    // Helper function to clear all speechflow environment variables
    fn clear_env_vars() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    fn openai_config() -> Config {
        Config {
            speech_engine: "openai".to_string(),
            openai_api_key: Some("test-key".to_string()),
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.secondary_provider, "none");
        assert_eq!(config.openai_api_key, None);
        assert_eq!(config.whisper_model, "whisper-1");
        assert_eq!(config.speech_engine, "google");
        assert_eq!(config.google_speech_model, "long");
        assert!(config.speech_compressed_streams);
        assert_eq!(config.speech_default_locale, "en-US");
        assert_eq!(config.speech_candidate_locales, vec!["en-US", "fr-FR", "de-DE"]);
        assert_eq!(config.stream_chunk_bytes, 32768);
        assert_eq!(config.transcoder_command, "ffmpeg");
        assert_eq!(config.transcoder_probe_timeout_ms, 2000);
        assert!(config.enable_fallback_decoder);
        assert_eq!(config.log_format, "pretty");
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();

        // Clear all environment variables first
        clear_env_vars();

        let config = Config::from_env();
        assert_eq!(config.openai_api_key, None);
        assert_eq!(config.whisper_timeout_seconds, 60);
        assert_eq!(config.whisper_max_retries, 3);
        assert_eq!(config.recognition_timeout_seconds, 60);
        assert_eq!(config.temp_dir, None);

        // Clean up after test
        clear_env_vars();
    }

    #[test]
    fn test_config_from_env_variables() {
        let _lock = ENV_MUTEX.lock().unwrap();

        // Clear environment variables first to ensure clean state
        clear_env_vars();

        env::set_var("SECONDARY_PROVIDER", "openai");
        env::set_var("OPENAI_API_KEY", "test-api-key");
        env::set_var("OPENAI_BASE_URL", "http://localhost:9000/v1");
        env::set_var("SPEECH_ENGINE", "openai");
        env::set_var("SPEECH_COMPRESSED_STREAMS", "false");
        env::set_var("SPEECH_DEFAULT_LOCALE", "fr-FR");
        env::set_var("SPEECH_CANDIDATE_LOCALES", " fr-FR, es-ES ,, ");
        env::set_var("STREAM_CHUNK_BYTES", "4096");
        env::set_var("RECOGNITION_TIMEOUT_SECONDS", "15");
        env::set_var("TRANSCODER_COMMAND", "/usr/local/bin/ffmpeg");
        env::set_var("ENABLE_FALLBACK_DECODER", "FALSE");
        env::set_var("SPEECHFLOW_TEMP_DIR", "/var/tmp");
        env::set_var("LOG_FORMAT", "JSON");

        let config = Config::from_env();
        assert_eq!(config.secondary_provider, "openai");
        assert_eq!(config.openai_api_key, Some("test-api-key".to_string()));
        assert_eq!(
            config.openai_base_url.as_deref(),
            Some("http://localhost:9000/v1")
        );
        assert_eq!(config.speech_engine, "openai");
        assert!(!config.speech_compressed_streams);
        assert_eq!(config.speech_default_locale, "fr-FR");
        assert_eq!(config.speech_candidate_locales, vec!["fr-FR", "es-ES"]);
        assert_eq!(config.stream_chunk_bytes, 4096);
        assert_eq!(config.recognition_timeout_seconds, 15);
        assert_eq!(config.transcoder_command, "/usr/local/bin/ffmpeg");
        assert!(!config.enable_fallback_decoder);
        assert_eq!(config.temp_dir, Some(PathBuf::from("/var/tmp")));
        assert_eq!(config.log_format, "json");

        // Clean up after test
        clear_env_vars();
    }

    #[test]
    fn test_config_from_env_invalid_numbers() {
        let _lock = ENV_MUTEX.lock().unwrap();

        // Clear at the start
        clear_env_vars();

        // Set invalid numeric values
        env::set_var("WHISPER_TIMEOUT_SECONDS", "invalid");
        env::set_var("WHISPER_MAX_RETRIES", "bad");
        env::set_var("STREAM_CHUNK_BYTES", "-5");
        env::set_var("TRANSCODER_PROBE_TIMEOUT_MS", "soon");

        let config = Config::from_env();

        // Should fallback to defaults for invalid values
        assert_eq!(config.whisper_timeout_seconds, 60);
        assert_eq!(config.whisper_max_retries, 3);
        assert_eq!(config.stream_chunk_bytes, 32768);
        assert_eq!(config.transcoder_probe_timeout_ms, 2000);

        clear_env_vars();
    }

    #[test]
    fn test_load_env_file() {
        let _lock = ENV_MUTEX.lock().unwrap();

        clear_env_vars();

        // Create a temporary .env file
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "OPENAI_API_KEY=file-api-key").unwrap();
        writeln!(temp_file, "SPEECH_ENGINE=openai").unwrap();
        writeln!(temp_file, "WHISPER_MODEL=whisper-large-v3").unwrap();

        // Load config from file
        let config = Config::load_env_file(temp_file.path()).unwrap();

        assert_eq!(config.openai_api_key, Some("file-api-key".to_string()));
        assert_eq!(config.speech_engine, "openai");
        assert_eq!(config.whisper_model, "whisper-large-v3");

        // Other values should be defaults
        assert_eq!(config.speech_default_locale, "en-US");
        assert_eq!(config.secondary_provider, "none");

        clear_env_vars();
    }

    #[test]
    fn test_load_nonexistent_env_file() {
        let result = Config::load_env_file("/nonexistent/path/.env");
        assert!(result.is_err());
    }

    #[test]
    fn test_bootstrap_without_envfile_uses_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        env::set_var("SPEECH_ENGINE", "openai");
        env::set_var("OPENAI_API_KEY", "env-key");

        let (config, source) = bootstrap(Some(Path::new("/nonexistent/path/.env"))).unwrap();
        assert_eq!(config.openai_api_key.as_deref(), Some("env-key"));
        assert_eq!(
            source,
            EnvSource::Missing(PathBuf::from("/nonexistent/path/.env"))
        );

        clear_env_vars();
    }

    #[test]
    fn test_bootstrap_reports_unreadable_envfile() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        env::set_var("SPEECH_ENGINE", "openai");
        env::set_var("OPENAI_API_KEY", "env-key");

        // A directory exists but cannot be parsed as an env file
        let dir = tempfile::tempdir().unwrap();
        let (config, source) = bootstrap(Some(dir.path())).unwrap();

        assert_eq!(config.openai_api_key.as_deref(), Some("env-key"));
        assert!(matches!(source, EnvSource::Unreadable { ref path, .. } if path == dir.path()));

        clear_env_vars();
    }

    #[test]
    fn test_bootstrap_reports_loaded_envfile() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = tempfile::tempdir().unwrap();
        let envfile = dir.path().join(".env");
        std::fs::write(&envfile, "SPEECH_ENGINE=openai\nOPENAI_API_KEY=file-key\n").unwrap();

        let (config, source) = bootstrap(Some(&envfile)).unwrap();

        assert_eq!(config.openai_api_key.as_deref(), Some("file-key"));
        assert_eq!(source, EnvSource::File(envfile));

        clear_env_vars();
    }

    #[test]
    fn test_bootstrap_rejects_invalid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        // Default engine is google, which needs credentials
        let result = bootstrap(Some(Path::new("/nonexistent/path/.env")));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("GOOGLE_APPLICATION_CREDENTIALS"));

        clear_env_vars();
    }

    #[test]
    fn test_config_validation_success() {
        assert!(openai_config().validate().is_ok());

        let config = Config {
            google_application_credentials: Some("/etc/key.json".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_missing_api_key() {
        let config = Config {
            speech_engine: "openai".to_string(),
            ..Config::default()
        };

        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("OPENAI_API_KEY is required"));
    }

    #[test]
    fn test_config_validation_secondary_needs_key() {
        let config = Config {
            secondary_provider: "OpenAI".to_string(),
            google_application_credentials: Some("/etc/key.json".to_string()),
            ..Config::default()
        };

        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("SECONDARY_PROVIDER"));
    }

    #[test]
    fn test_config_validation_unknown_engine() {
        let config = Config {
            speech_engine: "azure".to_string(),
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("Unknown SPEECH_ENGINE"));
    }

    #[test]
    fn test_config_validation_invalid_numbers() {
        let mut config = openai_config();
        config.stream_chunk_bytes = 0;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("STREAM_CHUNK_BYTES"));

        let mut config = openai_config();
        config.recognition_timeout_seconds = 0;
        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("RECOGNITION_TIMEOUT_SECONDS"));
    }

    #[test]
    fn test_config_validation_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = openai_config();
        config.temp_dir = Some(dir.path().to_path_buf());
        assert!(config.validate().is_ok());

        config.temp_dir = Some(dir.path().join("missing"));
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("SPEECHFLOW_TEMP_DIR"));
    }

    #[test]
    fn test_default_envfile_location() {
        let path = default_envfile();
        assert!(path.ends_with("speechflow/.env"));
    }
}
