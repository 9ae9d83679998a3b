//! One client session: credentials, recognition stream, turn handling and
//! the single active reply.
//!
//! The session loop is the only place that mutates session state. It
//! consumes two inputs: frames from the client socket and events from the
//! recognition engine's driver task. A finalized, new turn always wins:
//! any running reply is interrupted, cancelled and awaited before the new
//! user message is recorded and the next reply starts.

pub mod engines;
pub mod history;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::credentials::EngineCredentials;
use crate::pipeline::coordinator::{GenerationCoordinator, GenerationHandle};
use crate::pipeline::messages::RecognitionEvent;
use crate::pipeline::turns::{TurnAggregator, TurnDecision};
use crate::stt::{RecognitionHandle, RecognitionSink};
use crate::transport::ClientSender;
use crate::transport::protocol::{ClientMessage, Inbound, ServerMessage};

use self::engines::{EngineFactory, MISSING_STT_KEY};
use self::history::SharedHistory;

/// Status text sent once recognition is connected.
pub const STT_CONNECTED_STATUS: &str = "Connected to transcription service.";

/// Error text sent when the recognition stream ends mid-session.
pub const STT_CLOSED_MESSAGE: &str =
    "transcription service closed the stream; send a config message to reconnect";

/// State owned by one client connection.
pub struct Session {
    id: String,
    config: Arc<RelayConfig>,
    factory: Arc<dyn EngineFactory>,
    credentials: EngineCredentials,
    client: ClientSender,
    history: SharedHistory,
    turns: TurnAggregator,
    coordinator: Option<GenerationCoordinator>,
    active: Option<GenerationHandle>,
    recognition: Option<RecognitionHandle>,
    sink: RecognitionSink,
    events: mpsc::UnboundedReceiver<RecognitionEvent>,
    dropped_audio: u64,
}

impl Session {
    /// Create a session starting from `credentials` (usually the server's).
    pub fn new(
        config: Arc<RelayConfig>,
        factory: Arc<dyn EngineFactory>,
        credentials: EngineCredentials,
        client: ClientSender,
    ) -> Self {
        let (sink, events) = RecognitionSink::channel();
        let turns = TurnAggregator::new(config.stt.format_turns);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            factory,
            credentials,
            client,
            history: SharedHistory::new(),
            turns,
            coordinator: None,
            active: None,
            recognition: None,
            sink,
            events,
            dropped_audio: 0,
        }
    }

    /// Session id, for logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle to the conversation log.
    pub fn history(&self) -> SharedHistory {
        self.history.clone()
    }

    /// Run until the client's inbound queue closes, then release everything.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        info!(session_id = %self.id, "session started");
        self.refresh_reply_engines();
        self.connect_recognition().await;

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(Inbound::Audio(pcm)) => self.push_audio(pcm),
                    Some(Inbound::Text(text)) => self.handle_text(&text).await,
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_recognition(event).await,
            }
        }

        self.shutdown().await;
    }

    fn send(&self, message: ServerMessage) {
        if self.client.send(message).is_err() {
            debug!(session_id = %self.id, "client gone, dropping message");
        }
    }

    fn push_audio(&mut self, pcm: Bytes) {
        if let Some(recognition) = &self.recognition {
            if recognition.push_audio(pcm) {
                return;
            }
            // Driver exited; a later config message may reconnect.
            self.recognition = None;
        }
        self.dropped_audio += 1;
        if self.dropped_audio == 1 {
            debug!(session_id = %self.id, "no recognition stream, dropping audio");
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(session_id = %self.id, "ignoring client message: {e}");
                return;
            }
        };

        match message {
            ClientMessage::Ping => self.send(ServerMessage::Pong),
            ClientMessage::Config { keys } => {
                let changed = self.credentials.merge(keys.into_credentials());
                info!(session_id = %self.id, changed, "client provided credentials");
                self.send(ServerMessage::status("Configuration updated."));
                if changed {
                    self.refresh_reply_engines();
                }
                if self.recognition.is_none() {
                    self.connect_recognition().await;
                }
            }
        }
    }

    async fn connect_recognition(&mut self) {
        if self.credentials.stt.is_none() {
            warn!(session_id = %self.id, "{MISSING_STT_KEY}");
            self.send(ServerMessage::error(MISSING_STT_KEY));
            return;
        }

        let connected = match self.factory.recognition(&self.credentials) {
            Ok(engine) => engine.connect(self.sink.clone()).await,
            Err(e) => Err(e),
        };
        match connected {
            Ok(handle) => {
                self.recognition = Some(handle);
                self.dropped_audio = 0;
                info!(session_id = %self.id, "recognition connected");
                self.send(ServerMessage::status(STT_CONNECTED_STATUS));
            }
            Err(e) => {
                warn!(session_id = %self.id, "recognition unavailable: {e}");
                self.send(ServerMessage::error(format!(
                    "speech recognition unavailable: {e}"
                )));
            }
        }
    }

    fn refresh_reply_engines(&mut self) {
        match self.factory.reply(&self.credentials) {
            Ok(engines) => match &mut self.coordinator {
                Some(coordinator) => coordinator.set_engines(engines),
                None => {
                    self.coordinator = Some(GenerationCoordinator::new(
                        &self.config,
                        engines,
                        self.client.clone(),
                        self.history.clone(),
                    ));
                }
            },
            Err(e) => debug!(session_id = %self.id, "reply engines not ready: {e}"),
        }
    }

    async fn handle_recognition(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Begin { id } => {
                info!(session_id = %self.id, recognition_id = %id, "recognition stream began");
            }
            RecognitionEvent::Turn(turn) => match self.turns.observe(&turn) {
                TurnDecision::Accept(text) => self.accept_turn(text).await,
                TurnDecision::Interim(text) => {
                    if self.config.stt.forward_interim {
                        self.send(ServerMessage::Transcription {
                            text,
                            end_of_turn: false,
                        });
                    }
                }
                TurnDecision::Duplicate(text) => {
                    debug!(session_id = %self.id, "ignoring repeated turn: {text}");
                }
                TurnDecision::Ignore => {}
            },
            RecognitionEvent::Termination => {
                info!(session_id = %self.id, "recognition stream terminated");
                if self.release_recognition().await {
                    self.send(ServerMessage::error(STT_CLOSED_MESSAGE));
                }
            }
            RecognitionEvent::Error { message } => {
                warn!(session_id = %self.id, "recognition error: {message}");
                self.send(ServerMessage::error(format!(
                    "speech recognition error: {message}"
                )));
                if self.recognition.as_ref().is_some_and(|r| !r.is_alive()) {
                    self.release_recognition().await;
                }
            }
        }
    }

    /// Close the recognition stream. Returns `false` if none was open.
    async fn release_recognition(&mut self) -> bool {
        let Some(recognition) = self.recognition.take() else {
            return false;
        };
        recognition.close(self.config.session.cancel_grace()).await;
        true
    }

    /// Supersede any running reply and answer `text`.
    async fn accept_turn(&mut self, text: String) {
        info!(session_id = %self.id, "finalized turn: {text}");

        if let Some(active) = self.active.take() {
            if active.is_running() {
                if active.interrupt_audio() {
                    info!(session_id = %self.id, task_id = %active.id(), "barge-in, interrupting reply");
                }
                let state = active.cancel(self.config.session.cancel_grace()).await;
                debug!(session_id = %self.id, ?state, "previous reply stopped");
            }
        }

        let prior = self
            .history
            .recent(self.config.llm.history_exchanges.saturating_mul(2));
        self.history.push_user(text.clone());
        self.send(ServerMessage::Transcription {
            text: text.clone(),
            end_of_turn: true,
        });

        match &self.coordinator {
            Some(coordinator) => self.active = Some(coordinator.start(text, prior)),
            None => {
                let reason = self
                    .factory
                    .reply(&self.credentials)
                    .err()
                    .map_or_else(|| "reply engines unavailable".to_owned(), |e| e.to_string());
                warn!(session_id = %self.id, "cannot reply: {reason}");
                self.send(ServerMessage::error(reason));
            }
        }
    }

    async fn shutdown(&mut self) {
        let grace = self.config.session.cancel_grace();
        if let Some(active) = self.active.take() {
            active.interrupt_audio();
            active.cancel(grace).await;
        }
        self.release_recognition().await;
        info!(
            session_id = %self.id,
            turns = self.turns.accepted(),
            repeated = self.turns.duplicates(),
            "session closed"
        );
    }
}
