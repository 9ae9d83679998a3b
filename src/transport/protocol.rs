//! JSON messages exchanged with the client over the relay websocket.
//!
//! Binary client frames carry raw PCM16 audio and never pass through
//! this module. Every text frame in either direction is a JSON object
//! tagged by `type`.

use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::credentials::{ApiKey, EngineCredentials};
use crate::error::{RelayError, Result};

/// Message sent from the relay to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Informational status.
    Status {
        /// Human-readable text.
        message: String,
    },
    /// Something went wrong that the user should know about.
    Error {
        /// Human-readable text.
        message: String,
    },
    /// A recognized user utterance.
    Transcription {
        /// Transcript text.
        text: String,
        /// Whether the utterance is finalized.
        end_of_turn: bool,
    },
    /// A fragment of the generated reply, for display.
    LlmChunk {
        /// Fragment text.
        data: String,
    },
    /// First audio of a reply is about to follow.
    AudioStart,
    /// One encoded audio chunk, base64 (standard alphabet).
    Audio {
        /// Base64 payload.
        data: String,
    },
    /// Reply audio finished normally.
    AudioEnd,
    /// Reply audio was cut off by a newer turn. Stop playback now.
    AudioInterrupt,
    /// Reply to a client ping.
    Pong,
}

impl ServerMessage {
    /// Build an `audio` message from raw bytes.
    pub fn audio(bytes: &[u8]) -> Self {
        Self::Audio {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Build a `status` message.
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    /// Build an `error` message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether this message ends a reply's audio stream.
    pub fn is_audio_terminator(&self) -> bool {
        matches!(self, Self::AudioEnd | Self::AudioInterrupt)
    }

    /// Serialize to the JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RelayError::Protocol(e.to_string()))
    }
}

/// Keys a client may provision for its own session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientKeys {
    /// Speech recognition key.
    #[serde(default)]
    pub assemblyai: Option<String>,
    /// Text generation key.
    #[serde(default)]
    pub gemini: Option<String>,
    /// Voice synthesis key.
    #[serde(default)]
    pub murf: Option<String>,
    /// Web lookup key.
    #[serde(default)]
    pub tavily: Option<String>,
}

impl ClientKeys {
    /// Convert to session credentials, dropping blank values.
    pub fn into_credentials(self) -> EngineCredentials {
        EngineCredentials {
            stt: self.assemblyai.and_then(ApiKey::new),
            llm: self.gemini.and_then(ApiKey::new),
            tts: self.murf.and_then(ApiKey::new),
            lookup: self.tavily.and_then(ApiKey::new),
        }
    }
}

/// Text message sent from the client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keep-alive ping.
    Ping,
    /// Provision engine keys for this session.
    Config {
        /// Keys to merge.
        #[serde(default)]
        keys: ClientKeys,
    },
}

impl ClientMessage {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))
    }
}

/// One frame received from the client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Raw PCM16 microphone audio.
    Audio(Bytes),
    /// JSON control message text.
    Text(String),
}
