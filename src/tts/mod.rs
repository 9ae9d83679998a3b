//! Streaming text-to-speech.
//!
//! A [`SynthesisEngine`] opens one bidirectional connection per reply:
//! text goes in through a [`SynthesisSink`], encoded audio comes back as
//! a stream of [`SynthesisFrame`]s. [`relay::SynthesisRelay`] drives such a
//! connection for one reply and forwards audio to the client through an
//! [`relay::AudioGate`].

pub mod murf;
pub mod relay;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;

use crate::config::TtsConfig;
use crate::error::Result;

pub use relay::{AudioGate, SynthesisRelay};

/// Voice parameters sent once per synthesis context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceConfig {
    /// Voice selector.
    #[serde(rename = "voiceId")]
    pub voice_id: String,
    /// Style tag.
    pub style: String,
    /// Speaking pace modifier.
    pub pace: f32,
    /// Energy modifier.
    pub energy: f32,
    /// Pitch modifier.
    pub pitch: f32,
}

impl From<&TtsConfig> for VoiceConfig {
    fn from(config: &TtsConfig) -> Self {
        Self {
            voice_id: config.voice_id.clone(),
            style: config.style.clone(),
            pace: config.pace,
            energy: config.energy,
            pitch: config.pitch,
        }
    }
}

/// Outbound message on a synthesis connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SynthesisRequest {
    /// Sent first, once per context.
    Configure {
        /// Voice parameters.
        voice_config: VoiceConfig,
        /// Context the audio belongs to.
        context_id: String,
    },
    /// Text to speak. `end` marks the last text of the context.
    Text {
        /// Sentence text.
        text: String,
        /// Whether this is the final text.
        end: bool,
        /// Context the text belongs to.
        context_id: String,
    },
}

/// One inbound frame from the synthesis engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SynthesisFrame {
    /// Decoded audio payload, if the frame carried any.
    pub audio: Option<Bytes>,
    /// The engine has produced all audio for the context.
    pub is_final: bool,
}

/// Inbound audio frames. The stream ends when the connection closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SynthesisFrame>> + Send>>;

/// Outbound half of a synthesis connection.
#[async_trait]
pub trait SynthesisSink: Send {
    /// Send one request.
    async fn send(&mut self, request: SynthesisRequest) -> Result<()>;

    /// Close the connection. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// An open synthesis connection split into its two halves.
pub struct SynthesisConnection {
    /// Outbound text.
    pub sink: Box<dyn SynthesisSink>,
    /// Inbound audio.
    pub frames: FrameStream,
}

/// Factory for per-reply synthesis connections.
#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &str;

    /// Open a new connection.
    async fn open(&self) -> Result<SynthesisConnection>;
}
