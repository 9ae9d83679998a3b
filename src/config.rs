//! Configuration types for the voice relay.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the relay server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP/websocket listener settings.
    pub server: ServerConfig,
    /// Streaming speech recognition settings.
    pub stt: SttConfig,
    /// Streaming text generation settings.
    pub llm: LlmConfig,
    /// Streaming voice synthesis settings.
    pub tts: TtsConfig,
    /// Per-session timing and buffering.
    pub session: SessionConfig,
    /// Optional web lookup capability.
    pub lookup: LookupConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Streaming websocket endpoint (without query parameters).
    pub url: String,
    /// Sample rate of the client's PCM16 audio in Hz.
    pub sample_rate: u32,
    /// Ask the engine for formatted (punctuated) final turns.
    ///
    /// When enabled, only formatted end-of-turn events count as finalized.
    pub format_turns: bool,
    /// Forward interim transcripts to the client as `transcription` messages
    /// with `end_of_turn: false`.
    pub forward_interim: bool,
    /// Give up on the websocket handshake after this many seconds.
    pub connect_timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: "wss://streaming.assemblyai.com/v3/ws".to_owned(),
            sample_rate: 16_000,
            format_turns: true,
            forward_interim: false,
            connect_timeout_secs: 10,
        }
    }
}

impl SttConfig {
    /// Bound on connecting to the recognition engine.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions API.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum tokens to generate per reply.
    pub max_tokens: u32,
    /// Number of prior user/assistant exchanges included as context.
    pub history_exchanges: usize,
    /// System prompt describing the assistant persona.
    pub persona: String,
    /// Spoken when both the stream and the non-streaming retry fail.
    pub fallback_utterance: String,
    /// Upper bound for the non-streaming retry after a stream failure.
    pub fallback_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_owned(),
            model: "gemini-1.5-flash".to_owned(),
            temperature: 0.7,
            max_tokens: 512,
            history_exchanges: 6,
            persona: "You are a helpful voice assistant. Answer in a few short, \
                      spoken-friendly sentences. Do not use markdown, lists, or emoji."
                .to_owned(),
            fallback_utterance:
                "I apologize, but I encountered an issue processing that request.".to_owned(),
            fallback_timeout_secs: 15,
        }
    }
}

impl LlmConfig {
    /// Timeout for the non-streaming fallback call.
    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_secs.max(1))
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Streaming websocket endpoint (without query parameters).
    pub url: String,
    /// Voice selector.
    pub voice_id: String,
    /// Style tag.
    pub style: String,
    /// Speaking pace modifier.
    pub pace: f32,
    /// Energy modifier.
    pub energy: f32,
    /// Pitch modifier.
    pub pitch: f32,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output channel layout (`MONO` / `STEREO`).
    pub channel_type: String,
    /// Output container format (`MP3`, `WAV`, ...).
    pub format: String,
    /// Give up on opening a synthesis context after this many seconds.
    ///
    /// The reply then continues as text only.
    pub connect_timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.murf.ai/v1/speech/stream-input".to_owned(),
            voice_id: "en-US-william".to_owned(),
            style: "Conversational".to_owned(),
            pace: 0.92,
            energy: 0.6,
            pitch: -0.03,
            sample_rate: 44_100,
            channel_type: "MONO".to_owned(),
            format: "MP3".to_owned(),
            connect_timeout_secs: 10,
        }
    }
}

impl TtsConfig {
    /// Bound on opening a synthesis context, handshake and voice setup included.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

/// Session timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounded wait for a cancelled task (and its synthesis receive loop)
    /// before it is forcibly aborted.
    pub cancel_grace_ms: u64,
    /// How long to wait for trailing audio after the final text was sent.
    pub audio_drain_secs: u64,
    /// Ceiling for one whole response cycle.
    pub response_ceiling_secs: u64,
    /// Capacity of the inbound client frame queue.
    pub inbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: 3_000,
            audio_drain_secs: 60,
            response_ceiling_secs: 120,
            inbound_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Grace period for nested cancellation.
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Wait for the synthesis engine to deliver its final frame.
    pub fn audio_drain(&self) -> Duration {
        Duration::from_secs(self.audio_drain_secs)
    }

    /// Overall ceiling for a response cycle.
    pub fn response_ceiling(&self) -> Duration {
        Duration::from_secs(self.response_ceiling_secs.max(1))
    }
}

/// Web lookup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Whether lookups may run at all (still requires a credential).
    pub enabled: bool,
    /// Search API endpoint.
    pub url: String,
    /// Maximum results embedded into the prompt.
    pub max_results: usize,
    /// Maximum characters kept from each result body.
    pub snippet_chars: usize,
    /// Words that trigger a lookup when present in the transcript.
    pub keywords: Vec<String>,
    /// Request timeout for one search.
    pub timeout_secs: u64,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://api.tavily.com/search".to_owned(),
            max_results: 3,
            snippet_chars: 300,
            keywords: [
                "weather",
                "news",
                "current",
                "latest",
                "today",
                "recent",
                "now",
                "happening",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            timeout_secs: 8,
        }
    }
}

impl LookupConfig {
    /// Bound on one search request.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::RelayError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/voxrelay/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("voxrelay").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("voxrelay")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/voxrelay-config/config.toml")
        }
    }

    /// Load from `path` when it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only when the file exists but cannot be parsed.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.server.port > 0);
        assert!(config.stt.sample_rate > 0);
        assert!(config.llm.max_tokens > 0);
        assert!(config.llm.history_exchanges > 0);
        assert!(!config.llm.fallback_utterance.is_empty());
        assert!(!config.tts.voice_id.is_empty());
        assert!(config.session.cancel_grace() > Duration::ZERO);
        assert!(config.session.response_ceiling() > config.session.cancel_grace());
        assert!(!config.lookup.keywords.is_empty());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = RelayConfig::default();
        config.server.port = 9100;
        config.llm.temperature = 1.25;
        config.tts.voice_id = "en-US-natalie".to_owned();
        config.lookup.keywords = vec!["forecast".to_owned()];

        config.save_to_file(&path).unwrap();
        assert!(path.exists());

        let loaded = RelayConfig::from_file(&path).unwrap();
        assert_eq!(loaded.server.port, 9100);
        assert!((loaded.llm.temperature - 1.25).abs() < f64::EPSILON);
        assert_eq!(loaded.tts.voice_id, "en-US-natalie");
        assert_eq!(loaded.lookup.keywords, vec!["forecast".to_owned()]);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 7000\n").unwrap();

        let loaded = RelayConfig::from_file(&path).unwrap();
        assert_eq!(loaded.server.port, 7000);
        assert_eq!(loaded.server.host, "0.0.0.0");
        assert_eq!(loaded.llm.model, LlmConfig::default().model);
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();

        let result = RelayConfig::from_file(&path);
        assert!(matches!(result, Err(crate::error::RelayError::Config(_))));
    }

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let loaded =
            RelayConfig::load_or_default(std::path::Path::new("/nonexistent/voxrelay.toml"))
                .unwrap();
        assert_eq!(loaded.server.port, 8000);
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = RelayConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("voxrelay"));
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let server = ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 8123,
        };
        assert_eq!(server.bind_addr(), "127.0.0.1:8123");
    }
}
