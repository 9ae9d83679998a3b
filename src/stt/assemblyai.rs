//! AssemblyAI v3 streaming recognition over websocket.
//!
//! Binary frames carry PCM16 mono audio at the configured sample rate;
//! the server answers with JSON `Begin`, `Turn` and `Termination`
//! messages. `{"type":"Terminate"}` asks the server to flush and close.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::SttConfig;
use crate::error::{RelayError, Result};
use crate::pipeline::messages::{RecognitionEvent, Turn};
use crate::stt::{RecognitionEngine, RecognitionHandle, RecognitionSink};

const TERMINATE_MESSAGE: &str = r#"{"type":"Terminate"}"#;

/// Recognition engine backed by AssemblyAI's v3 streaming API.
pub struct AssemblyAiEngine {
    config: SttConfig,
    api_key: String,
}

impl std::fmt::Debug for AssemblyAiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssemblyAiEngine")
            .field("url", &self.config.url)
            .field("sample_rate", &self.config.sample_rate)
            .finish_non_exhaustive()
    }
}

impl AssemblyAiEngine {
    /// Create an engine for the given settings and key.
    pub fn new(config: SttConfig, api_key: impl Into<String>) -> Self {
        Self {
            config,
            api_key: api_key.into(),
        }
    }

    /// Full connection URL including stream parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured base URL is invalid.
    pub fn connect_url(&self) -> Result<url::Url> {
        let sample_rate = self.config.sample_rate.to_string();
        let format_turns = self.config.format_turns.to_string();
        url::Url::parse_with_params(
            &self.config.url,
            [
                ("sample_rate", sample_rate.as_str()),
                ("format_turns", format_turns.as_str()),
            ],
        )
        .map_err(|e| RelayError::Config(format!("invalid recognition url: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct ServerPayload {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    end_of_turn: bool,
    #[serde(default)]
    turn_is_formatted: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Map one server text message to an event.
///
/// `order` is the session-wide turn counter; it advances on every turn.
/// Unknown message types yield `None`.
pub fn parse_message(text: &str, order: &mut u64) -> Option<RecognitionEvent> {
    let payload: ServerPayload = match serde_json::from_str(text) {
        Ok(p) => p,
        Err(e) => {
            debug!("ignoring unparseable recognition message: {e}");
            return None;
        }
    };

    if let Some(message) = payload.error {
        return Some(RecognitionEvent::Error { message });
    }

    match payload.kind.as_deref() {
        Some("Begin") => Some(RecognitionEvent::Begin {
            id: payload.id.unwrap_or_default(),
        }),
        Some("Turn") => {
            let turn = Turn {
                transcript: payload.transcript,
                end_of_turn: payload.end_of_turn,
                turn_is_formatted: payload.turn_is_formatted,
                order: *order,
            };
            *order += 1;
            Some(RecognitionEvent::Turn(turn))
        }
        Some("Termination") => Some(RecognitionEvent::Termination),
        other => {
            debug!(kind = ?other, "ignoring recognition message");
            None
        }
    }
}

#[async_trait]
impl RecognitionEngine for AssemblyAiEngine {
    fn name(&self) -> &str {
        "assemblyai"
    }

    async fn connect(&self, sink: RecognitionSink) -> Result<RecognitionHandle> {
        let url = self.connect_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Stt(format!("build request: {e}")))?;
        let auth = HeaderValue::from_str(&self.api_key)
            .map_err(|e| RelayError::Credentials(format!("invalid recognition key: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        let timeout = self.config.connect_timeout();
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| RelayError::Stt(format!("connect timed out after {timeout:?}")))?
            .map_err(|e| RelayError::Stt(format!("connect: {e}")))?;
        info!(sample_rate = self.config.sample_rate, "connected to recognition engine");

        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(ws_stream, audio_rx, sink));
        Ok(RecognitionHandle::new(audio_tx, driver))
    }
}

/// Pump audio out and events in until either side ends.
async fn drive(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut audio_rx: mpsc::UnboundedReceiver<Bytes>,
    sink: RecognitionSink,
) {
    let (mut write, mut read) = ws_stream.split();
    let mut order = 0u64;

    loop {
        tokio::select! {
            pcm = audio_rx.recv() => match pcm {
                Some(pcm) => {
                    if let Err(e) = write.send(Message::Binary(pcm.to_vec())).await {
                        sink.emit(RecognitionEvent::Error {
                            message: format!("send audio: {e}"),
                        });
                        return;
                    }
                }
                None => {
                    // Session closed the handle: terminate and drain.
                    if let Err(e) = write.send(Message::Text(TERMINATE_MESSAGE.to_owned())).await {
                        debug!("sending terminate: {e}");
                    }
                    while let Some(Ok(message)) = read.next().await {
                        match message {
                            Message::Text(text) => {
                                if let Some(event) = parse_message(&text, &mut order) {
                                    let done = event == RecognitionEvent::Termination;
                                    sink.emit(event);
                                    if done {
                                        break;
                                    }
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    let _ = write.close().await;
                    return;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_message(&text, &mut order) {
                        let done = event == RecognitionEvent::Termination;
                        if !sink.emit(event) || done {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map_or_else(
                        || "no reason given".to_owned(),
                        |f| format!("{} {}", u16::from(f.code), f.reason),
                    );
                    warn!("recognition connection closed by server: {reason}");
                    sink.emit(RecognitionEvent::Error {
                        message: format!("connection closed: {reason}"),
                    });
                    return;
                }
                None => {
                    sink.emit(RecognitionEvent::Error {
                        message: "connection closed".into(),
                    });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    sink.emit(RecognitionEvent::Error {
                        message: format!("read error: {e}"),
                    });
                    return;
                }
            }
        }
    }
}
