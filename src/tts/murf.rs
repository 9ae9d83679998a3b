//! Murf streaming synthesis over websocket.
//!
//! One websocket per reply. Output format parameters and the API key
//! travel in the query string; text and voice configuration are JSON
//! text frames; audio comes back as `{"audio": "<base64>", "final": bool}`.

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::config::TtsConfig;
use crate::error::{RelayError, Result};
use crate::tts::{
    SynthesisConnection, SynthesisEngine, SynthesisFrame, SynthesisRequest, SynthesisSink,
};

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Synthesis engine backed by Murf's `stream-input` websocket.
pub struct MurfEngine {
    config: TtsConfig,
    api_key: String,
}

impl std::fmt::Debug for MurfEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MurfEngine")
            .field("url", &self.config.url)
            .field("voice_id", &self.config.voice_id)
            .finish_non_exhaustive()
    }
}

impl MurfEngine {
    /// Create an engine for the given settings and key.
    pub fn new(config: TtsConfig, api_key: impl Into<String>) -> Self {
        Self {
            config,
            api_key: api_key.into(),
        }
    }

    /// Full connection URL including output format parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured base URL is invalid.
    pub fn connect_url(&self) -> Result<url::Url> {
        let sample_rate = self.config.sample_rate.to_string();
        url::Url::parse_with_params(
            &self.config.url,
            [
                ("api-key", self.api_key.as_str()),
                ("sample_rate", sample_rate.as_str()),
                ("channel_type", self.config.channel_type.as_str()),
                ("format", self.config.format.as_str()),
            ],
        )
        .map_err(|e| RelayError::Config(format!("invalid synthesis url: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct MurfFrame {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default, rename = "final")]
    is_final: bool,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Classified inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Audio and/or the final marker.
    Frame(SynthesisFrame),
    /// Neither audio nor `final`; nothing to do.
    Ignored,
    /// The engine reported an error; the context is dead.
    EngineError(String),
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// Returns an error for frames that are not valid JSON or carry invalid base64.
pub fn parse_frame(text: &str) -> Result<InboundFrame> {
    let frame: MurfFrame = serde_json::from_str(text)
        .map_err(|e| RelayError::Tts(format!("invalid frame: {e}")))?;

    if let Some(error) = frame.error {
        let message = error
            .as_str()
            .map_or_else(|| error.to_string(), String::from);
        return Ok(InboundFrame::EngineError(message));
    }

    let audio = match frame.audio.as_deref() {
        Some(encoded) if !encoded.is_empty() => Some(Bytes::from(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| RelayError::Tts(format!("invalid audio payload: {e}")))?,
        )),
        _ => None,
    };

    if audio.is_none() && !frame.is_final {
        return Ok(InboundFrame::Ignored);
    }
    Ok(InboundFrame::Frame(SynthesisFrame {
        audio,
        is_final: frame.is_final,
    }))
}

struct MurfSink {
    write: WsWrite,
    closed: bool,
}

#[async_trait]
impl SynthesisSink for MurfSink {
    async fn send(&mut self, request: SynthesisRequest) -> Result<()> {
        if self.closed {
            return Err(RelayError::Tts("connection already closed".into()));
        }
        let json = serde_json::to_string(&request)
            .map_err(|e| RelayError::Tts(format!("encode request: {e}")))?;
        self.write
            .send(Message::Text(json))
            .await
            .map_err(|e| RelayError::Tts(format!("send error: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.write
            .close()
            .await
            .map_err(|e| RelayError::Tts(format!("close error: {e}")))
    }
}

#[async_trait]
impl SynthesisEngine for MurfEngine {
    fn name(&self) -> &str {
        "murf"
    }

    async fn open(&self) -> Result<SynthesisConnection> {
        let url = self.connect_url()?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Tts(format!("connect: {e}")))?;
        debug!(voice_id = %self.config.voice_id, "connected to synthesis engine");

        let (write, read) = ws_stream.split();

        let frames = futures_util::stream::unfold(Some(read), |read| async move {
            let mut read = read?;
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                        Ok(InboundFrame::Frame(frame)) => {
                            return Some((Ok(frame), Some(read)));
                        }
                        Ok(InboundFrame::Ignored) => {}
                        Ok(InboundFrame::EngineError(message)) => {
                            let err = RelayError::Tts(format!("engine error: {message}"));
                            return Some((Err(err), None));
                        }
                        Err(e) => warn!("skipping synthesis frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Some((Err(RelayError::Tts(format!("read error: {e}"))), None));
                    }
                }
            }
        });

        Ok(SynthesisConnection {
            sink: Box::new(MurfSink {
                write,
                closed: false,
            }),
            frames: Box::pin(frames),
        })
    }
}
