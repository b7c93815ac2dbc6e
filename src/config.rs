//! Application configuration
//!
//! Loaded from TOML (explicit path or the platform config directory),
//! then overridden from the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::codec::decoder::OPUS_SAMPLE_RATES;
use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub pipeline: PipelineConfig,
    pub client: ClientConfig,
}

/// HTTP/WebSocket listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub http_port: u16,
    /// Directory served for non-WebSocket requests
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            static_dir: None,
        }
    }
}

/// Remote conversational session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bidirectional WebSocket endpoint
    pub endpoint: String,
    pub model: String,
    /// Never written back to disk
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Persona text sent as the system instruction
    pub system_instruction: String,
    /// Rate of the PCM sent to the session
    pub input_sample_rate: u32,
    pub setup_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            model: DEFAULT_LIVE_MODEL.to_string(),
            api_key: None,
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            input_sample_rate: UPLINK_SAMPLE_RATE,
            setup_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    /// MIME type announced for uplink audio
    pub fn input_mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.input_sample_rate)
    }
}

/// Per-connection pipeline limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Decoded chunks waiting for the remote session
    pub uplink_queue_depth: usize,
    /// Remote events waiting for the client transport
    pub event_queue_depth: usize,
    /// Largest container element buffered before the stream is rejected
    pub max_element_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            uplink_queue_depth: DEFAULT_UPLINK_QUEUE_DEPTH,
            event_queue_depth: DEFAULT_EVENT_QUEUE_DEPTH,
            max_element_size: DEFAULT_MAX_ELEMENT_SIZE,
        }
    }
}

/// Native client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    /// How often recorded audio is flushed to the transport
    pub timeslice_ms: u64,
    pub frame_duration_ms: u32,
    pub bitrate: u32,
    /// Rate of the PCM received from the relay
    pub playback_sample_rate: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{}", DEFAULT_HTTP_PORT),
            timeslice_ms: DEFAULT_TIMESLICE_MS,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            bitrate: DEFAULT_VOICE_BITRATE,
            playback_sample_rate: DOWNLINK_SAMPLE_RATE,
        }
    }
}

impl AppConfig {
    /// Load from `path`, or from the default location if it exists, then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// `config.toml` in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "voice-relay", "voice-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Apply `PORT`, `GEMINI_API_KEY` and `RELAY_SERVER_URL`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.server.http_port = port;
        }
        if let Some(key) = lookup("GEMINI_API_KEY").filter(|k| !k.is_empty()) {
            self.session.api_key = Some(key);
        }
        if let Some(url) = lookup("RELAY_SERVER_URL") {
            self.client.server_url = url;
        }
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 {
            return Err(Error::Config("http_port must not be 0".into()));
        }
        if !OPUS_SAMPLE_RATES.contains(&self.session.input_sample_rate) {
            return Err(Error::Config(format!(
                "input_sample_rate must be one of {:?}",
                OPUS_SAMPLE_RATES
            )));
        }
        let endpoint = url::Url::parse(&self.session.endpoint)
            .map_err(|e| Error::Config(format!("invalid session endpoint: {}", e)))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::Config("session endpoint must be ws:// or wss://".into()));
        }
        if self.pipeline.uplink_queue_depth == 0 || self.pipeline.event_queue_depth == 0 {
            return Err(Error::Config("queue depths must be at least 1".into()));
        }
        if self.pipeline.max_element_size < MIN_MAX_ELEMENT_SIZE {
            return Err(Error::Config(format!(
                "max_element_size must be at least {} bytes",
                MIN_MAX_ELEMENT_SIZE
            )));
        }
        if ![10, 20, 40, 60].contains(&self.client.frame_duration_ms) {
            return Err(Error::Config("frame_duration_ms must be 10, 20, 40 or 60".into()));
        }
        if self.client.timeslice_ms < self.client.frame_duration_ms as u64 {
            return Err(Error::Config("timeslice_ms must cover at least one frame".into()));
        }
        if self.client.playback_sample_rate == 0 {
            return Err(Error::Config("playback_sample_rate must not be 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.input_mime_type(), "audio/pcm;rate=16000");
        assert_eq!(config.client.playback_sample_rate, 24000);
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml_str(
            r#"
            [server]
            http_port = 8080

            [pipeline]
            uplink_queue_depth = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.pipeline.uplink_queue_depth, 8);
        assert_eq!(config.session.input_sample_rate, 16000);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "PORT" => Some("4000".into()),
            "GEMINI_API_KEY" => Some("secret".into()),
            _ => None,
        });

        assert_eq!(config.server.http_port, 4000);
        assert_eq!(config.session.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_api_key_not_serialized() {
        let mut config = AppConfig::default();
        config.session.api_key = Some("secret".into());
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("secret"));
    }

    #[test]
    fn test_invalid_values() {
        let mut config = AppConfig::default();
        config.session.input_sample_rate = 44100;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.endpoint = "https://example.com".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.client.timeslice_ms = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_element_size_lower_bound() {
        let mut config = AppConfig::default();
        config.pipeline.max_element_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.pipeline.max_element_size = MIN_MAX_ELEMENT_SIZE - 1;
        assert!(config.validate().is_err());

        config.pipeline.max_element_size = MIN_MAX_ELEMENT_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_persona() {
        let config = AppConfig::default();
        assert!(config.session.system_instruction.starts_with("You are an expert sales and support assistant for Revolt Motors."));
        assert!(config.session.system_instruction.ends_with("Do not discuss other topics."));
    }
}
