//! Generation coordinator: one cancellable "respond to this turn" task.
//!
//! A task opens a synthesis context, optionally fetches background
//! information, streams the model's reply to the client as `llm_chunk`
//! messages while feeding it sentence by sentence into synthesis, records
//! the reply in chat history and then waits for the trailing audio. If the
//! synthesis context cannot be opened within the connect timeout, the
//! reply goes out as text only.
//!
//! Cancellation is cooperative through a [`CancellationToken`]; the owner
//! waits a bounded grace period before aborting the task outright. Every
//! task closes its audio stream with exactly one `audio_end` or
//! `audio_interrupt` through its [`AudioGate`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{LlmConfig, LookupConfig, RelayConfig, SessionConfig};
use crate::error::{RelayError, Result};
use crate::llm::fallback::{ReplySource, recover_reply};
use crate::llm::{GenerationEngine, build_prompt};
use crate::lookup::{ContextLookup, gather_context};
use crate::pipeline::messages::{ChatMessage, TaskState};
use crate::pipeline::segmenter::SentenceSegmenter;
use crate::session::history::SharedHistory;
use crate::transport::ClientSender;
use crate::transport::protocol::ServerMessage;
use crate::tts::{AudioGate, SynthesisEngine, SynthesisRelay, VoiceConfig};

/// Engines a reply is produced with.
#[derive(Clone)]
pub struct ReplyEngines {
    /// Text generation.
    pub llm: Arc<dyn GenerationEngine>,
    /// Voice synthesis.
    pub tts: Arc<dyn SynthesisEngine>,
    /// Optional background lookup.
    pub lookup: Option<Arc<dyn ContextLookup>>,
}

impl std::fmt::Debug for ReplyEngines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyEngines")
            .field("llm", &self.llm.name())
            .field("tts", &self.tts.name())
            .field("lookup", &self.lookup.is_some())
            .finish()
    }
}

struct TaskSettings {
    llm: LlmConfig,
    voice: VoiceConfig,
    synthesis_connect: Duration,
    lookup: LookupConfig,
    session: SessionConfig,
}

/// Starts generation tasks for one session.
pub struct GenerationCoordinator {
    settings: Arc<TaskSettings>,
    engines: ReplyEngines,
    client: ClientSender,
    history: SharedHistory,
}

impl GenerationCoordinator {
    /// Create a coordinator writing to `client` and recording into `history`.
    pub fn new(
        config: &RelayConfig,
        engines: ReplyEngines,
        client: ClientSender,
        history: SharedHistory,
    ) -> Self {
        Self {
            settings: Arc::new(TaskSettings {
                llm: config.llm.clone(),
                voice: VoiceConfig::from(&config.tts),
                synthesis_connect: config.tts.connect_timeout(),
                lookup: config.lookup.clone(),
                session: config.session.clone(),
            }),
            engines,
            client,
            history,
        }
    }

    /// Swap the engines used by tasks started from now on.
    pub fn set_engines(&mut self, engines: ReplyEngines) {
        self.engines = engines;
    }

    /// Spawn a task answering `transcript`.
    ///
    /// `prior` is the conversation before this turn; the caller records the
    /// user message itself.
    pub fn start(&self, transcript: String, prior: Vec<ChatMessage>) -> GenerationHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let gate = AudioGate::new(self.client.clone());
        let (state_tx, state_rx) = watch::channel(TaskState::Running);

        let task = ReplyTask {
            id: id.clone(),
            settings: Arc::clone(&self.settings),
            engines: self.engines.clone(),
            client: self.client.clone(),
            history: self.history.clone(),
            gate: gate.clone(),
            cancel: cancel.clone(),
        };
        info!(task_id = %id, "starting reply");
        let join = tokio::spawn(task.run(transcript, prior, state_tx));

        GenerationHandle {
            id,
            cancel,
            gate,
            state: state_rx,
            join: Some(join),
        }
    }
}

/// Owner's view of one running task.
#[derive(Debug)]
pub struct GenerationHandle {
    id: String,
    cancel: CancellationToken,
    gate: AudioGate,
    state: watch::Receiver<TaskState>,
    join: Option<JoinHandle<()>>,
}

impl GenerationHandle {
    /// Task id, for logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest state.
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Send `audio_interrupt` unless the audio stream already ended.
    ///
    /// Returns `true` if this call sent it.
    pub fn interrupt_audio(&self) -> bool {
        self.gate.interrupt()
    }

    /// Wait for the task to reach a terminal state.
    pub async fn wait(&mut self) -> TaskState {
        match self.state.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            // Sender gone without a terminal state: the task was aborted.
            Err(_) => TaskState::Cancelled,
        }
    }

    /// Cancel the task, give it `grace` to stop, then abort it.
    ///
    /// Returns the final state.
    pub async fn cancel(mut self, grace: Duration) -> TaskState {
        self.cancel.cancel();
        if let Some(mut join) = self.join.take()
            && tokio::time::timeout(grace, &mut join).await.is_err()
        {
            warn!(task_id = %self.id, "reply task ignored cancellation, aborting");
            join.abort();
            self.gate.interrupt();
            return TaskState::Cancelled;
        }
        match self.state() {
            TaskState::Running => TaskState::Cancelled,
            state => state,
        }
    }
}

struct ReplyTask {
    id: String,
    settings: Arc<TaskSettings>,
    engines: ReplyEngines,
    client: ClientSender,
    history: SharedHistory,
    gate: AudioGate,
    cancel: CancellationToken,
}

impl ReplyTask {
    async fn run(
        self,
        transcript: String,
        prior: Vec<ChatMessage>,
        state_tx: watch::Sender<TaskState>,
    ) {
        let ceiling = self.settings.session.response_ceiling();
        let mut relay: Option<SynthesisRelay> = None;

        let state = tokio::select! {
            biased;
            () = self.cancel.cancelled() => TaskState::Cancelled,
            outcome = tokio::time::timeout(ceiling, self.respond(&transcript, &prior, &mut relay)) => {
                match outcome {
                    Ok(state) => state,
                    Err(_) => {
                        warn!(task_id = %self.id, "reply exceeded {ceiling:?}, giving up");
                        TaskState::Failed
                    }
                }
            }
        };

        if let Some(relay) = relay.take() {
            relay.shutdown(self.settings.session.cancel_grace()).await;
        }
        if state == TaskState::Cancelled {
            self.gate.interrupt();
        } else {
            self.gate.end();
        }

        info!(task_id = %self.id, ?state, "reply finished");
        state_tx.send_replace(state);
    }

    async fn respond(
        &self,
        transcript: &str,
        prior: &[ChatMessage],
        relay_slot: &mut Option<SynthesisRelay>,
    ) -> TaskState {
        let context_id = format!("voxrelay-{}", uuid::Uuid::new_v4());
        let connect = self.settings.synthesis_connect;
        let opened = tokio::time::timeout(
            connect,
            SynthesisRelay::open(
                self.engines.tts.as_ref(),
                self.settings.voice.clone(),
                context_id,
                self.gate.clone(),
                self.cancel.child_token(),
            ),
        )
        .await
        .unwrap_or_else(|_| Err(RelayError::Tts(format!("connect timed out after {connect:?}"))));
        match opened {
            Ok(relay) => *relay_slot = Some(relay),
            Err(e) => {
                warn!(task_id = %self.id, "synthesis unavailable, replying with text only: {e}");
                self.gate.end();
            }
        }

        let background = match &self.engines.lookup {
            Some(lookup) => gather_context(lookup.as_ref(), &self.settings.lookup, transcript).await,
            None => None,
        };
        let llm = &self.settings.llm;
        let prompt = build_prompt(
            &llm.persona,
            prior,
            llm.history_exchanges,
            transcript,
            background.as_deref(),
        );

        let mut segmenter = SentenceSegmenter::new();
        let (reply, state) = match self.stream_reply(&prompt, &mut segmenter, relay_slot).await {
            Ok(reply) => {
                let rest = segmenter.flush();
                if let Some(relay) = relay_slot.as_mut() {
                    relay.send_final(&rest).await;
                }
                (reply, TaskState::Completed)
            }
            Err(e) => {
                if e.is_upstream() {
                    warn!(task_id = %self.id, "streaming reply failed: {e}");
                } else {
                    error!(task_id = %self.id, "streaming reply failed: {e}");
                }
                let dropped = segmenter.discard();
                if dropped > 0 {
                    debug!(task_id = %self.id, dropped, "discarded unfinished sentence");
                }
                let recovered = recover_reply(
                    self.engines.llm.as_ref(),
                    &prompt,
                    llm.fallback_timeout(),
                    &llm.fallback_utterance,
                )
                .await;
                if recovered.source == ReplySource::Apology {
                    info!(task_id = %self.id, "speaking fallback apology");
                }
                self.send_client(ServerMessage::LlmChunk {
                    data: recovered.text.clone(),
                });
                self.speak_whole(&recovered.text, relay_slot).await;
                (recovered.text, TaskState::Failed)
            }
        };

        self.history.push_assistant(reply);

        if let Some(relay) = relay_slot.as_mut() {
            relay.wait_for_audio(self.settings.session.audio_drain()).await;
        }
        state
    }

    /// Stream the reply, forwarding fragments and dispatching sentences.
    ///
    /// Returns the full reply text. An empty reply counts as a failure.
    async fn stream_reply(
        &self,
        prompt: &[ChatMessage],
        segmenter: &mut SentenceSegmenter,
        relay_slot: &mut Option<SynthesisRelay>,
    ) -> Result<String> {
        let mut tokens = self.engines.llm.stream(prompt).await?;
        let mut reply = String::new();

        while let Some(token) = tokens.next().await {
            let token = token?;
            if token.is_empty() {
                continue;
            }
            reply.push_str(&token);
            self.send_client(ServerMessage::LlmChunk {
                data: token.clone(),
            });
            for sentence in segmenter.feed(&token) {
                if let Some(relay) = relay_slot.as_mut() {
                    relay.send_sentence(&sentence).await;
                }
            }
        }

        if reply.trim().is_empty() {
            return Err(RelayError::Llm("model returned an empty reply".into()));
        }
        Ok(reply.trim().to_owned())
    }

    /// Segment a complete text and send it as one synthesis context.
    async fn speak_whole(&self, text: &str, relay_slot: &mut Option<SynthesisRelay>) {
        let Some(relay) = relay_slot.as_mut() else {
            return;
        };
        let mut segmenter = SentenceSegmenter::new();
        for sentence in segmenter.feed(text) {
            relay.send_sentence(&sentence).await;
        }
        relay.send_final(&segmenter.flush()).await;
    }

    fn send_client(&self, message: ServerMessage) {
        if self.client.send(message).is_err() {
            debug!(task_id = %self.id, "client gone, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::llm::TokenStream;
    use crate::pipeline::messages::ChatRole;
    use crate::tts::{SynthesisConnection, SynthesisFrame, SynthesisRequest, SynthesisSink};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Streams fixed fragments, optionally failing after some of them.
    struct ScriptedLlm {
        fragments: Vec<&'static str>,
        fail_after: Option<usize>,
        complete: Option<&'static str>,
        hang: bool,
    }

    impl ScriptedLlm {
        fn replying(fragments: Vec<&'static str>) -> Self {
            Self {
                fragments,
                fail_after: None,
                complete: None,
                hang: false,
            }
        }
    }

    #[async_trait]
    impl GenerationEngine for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream> {
            let mut items: Vec<Result<String>> = self
                .fragments
                .iter()
                .map(|f| Ok((*f).to_owned()))
                .collect();
            if let Some(n) = self.fail_after {
                items.truncate(n);
                items.push(Err(RelayError::Llm("connection reset".into())));
            }
            let stream = futures_util::stream::iter(items);
            if self.hang {
                return Ok(Box::pin(stream.chain(futures_util::stream::pending())));
            }
            Ok(Box::pin(stream))
        }

        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            self.complete
                .map(str::to_owned)
                .ok_or_else(|| RelayError::Llm("unavailable".into()))
        }
    }

    /// Answers every text with one audio frame, final on `end` unless
    /// `final_frames` is off.
    struct EchoTts {
        sent: Arc<Mutex<Vec<SynthesisRequest>>>,
        closes: Arc<AtomicUsize>,
        final_frames: bool,
    }

    struct EchoSink {
        sent: Arc<Mutex<Vec<SynthesisRequest>>>,
        closes: Arc<AtomicUsize>,
        frames: mpsc::UnboundedSender<Result<SynthesisFrame>>,
        final_frames: bool,
    }

    #[async_trait]
    impl SynthesisSink for EchoSink {
        async fn send(&mut self, request: SynthesisRequest) -> Result<()> {
            if let SynthesisRequest::Text { end, .. } = &request {
                let _ = self.frames.send(Ok(SynthesisFrame {
                    audio: Some(Bytes::from_static(b"mp3")),
                    is_final: *end && self.final_frames,
                }));
            }
            self.sent.lock().unwrap().push(request);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl SynthesisEngine for EchoTts {
        fn name(&self) -> &str {
            "echo"
        }

        async fn open(&self) -> Result<SynthesisConnection> {
            let (tx, rx) = mpsc::unbounded_channel();
            Ok(SynthesisConnection {
                sink: Box::new(EchoSink {
                    sent: Arc::clone(&self.sent),
                    closes: Arc::clone(&self.closes),
                    frames: tx,
                    final_frames: self.final_frames,
                }),
                frames: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
            })
        }
    }

    /// Never finishes opening a connection.
    struct StalledTts;

    #[async_trait]
    impl SynthesisEngine for StalledTts {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn open(&self) -> Result<SynthesisConnection> {
            std::future::pending().await
        }
    }

    struct Fixture {
        coordinator: GenerationCoordinator,
        client_rx: mpsc::UnboundedReceiver<ServerMessage>,
        history: SharedHistory,
        sent: Arc<Mutex<Vec<SynthesisRequest>>>,
        closes: Arc<AtomicUsize>,
    }

    fn fixture(llm: ScriptedLlm) -> Fixture {
        fixture_with(llm, None, true, |_| {})
    }

    fn fixture_with(
        llm: ScriptedLlm,
        tts: Option<Arc<dyn SynthesisEngine>>,
        final_frames: bool,
        tune: impl FnOnce(&mut RelayConfig),
    ) -> Fixture {
        let (client, client_rx) = mpsc::unbounded_channel();
        let history = SharedHistory::new();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));
        let tts = tts.unwrap_or_else(|| {
            Arc::new(EchoTts {
                sent: Arc::clone(&sent),
                closes: Arc::clone(&closes),
                final_frames,
            })
        });
        let engines = ReplyEngines {
            llm: Arc::new(llm),
            tts,
            lookup: None,
        };
        let mut config = RelayConfig::default();
        config.session.audio_drain_secs = 1;
        config.llm.fallback_utterance = "Sorry, please try again.".into();
        tune(&mut config);
        Fixture {
            coordinator: GenerationCoordinator::new(&config, engines, client, history.clone()),
            client_rx,
            history,
            sent,
            closes,
        }
    }

    fn llm_text(msgs: &[ServerMessage]) -> String {
        msgs.iter()
            .filter_map(|m| match m {
                ServerMessage::LlmChunk { data } => Some(data.as_str()),
                _ => None,
            })
            .collect()
    }

    fn count(msgs: &[ServerMessage], wanted: &ServerMessage) -> usize {
        msgs.iter().filter(|m| *m == wanted).count()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn texts(sent: &Arc<Mutex<Vec<SynthesisRequest>>>) -> Vec<(String, bool)> {
        sent.lock()
            .unwrap()
            .iter()
            .filter_map(|r| match r {
                SynthesisRequest::Text { text, end, .. } => Some((text.clone(), *end)),
                SynthesisRequest::Configure { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn completed_reply_is_spoken_and_recorded() {
        let mut fx = fixture(ScriptedLlm::replying(vec!["It is sun", "ny. Enjoy", " it"]));
        let mut handle = fx.coordinator.start("Weather?".into(), Vec::new());

        assert_eq!(handle.wait().await, TaskState::Completed);
        assert_eq!(
            texts(&fx.sent),
            vec![
                ("It is sunny.".to_owned(), false),
                ("Enjoy it".to_owned(), true)
            ]
        );

        let history = fx.history.snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, ChatRole::Assistant);
        assert_eq!(history[0].content, "It is sunny. Enjoy it");

        let msgs = drain(&mut fx.client_rx);
        let chunks: String = msgs
            .iter()
            .filter_map(|m| match m {
                ServerMessage::LlmChunk { data } => Some(data.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, "It is sunny. Enjoy it");
        assert_eq!(msgs.iter().filter(|m| **m == ServerMessage::AudioStart).count(), 1);
        assert_eq!(msgs.last(), Some(&ServerMessage::AudioEnd));
        assert!(!msgs.contains(&ServerMessage::AudioInterrupt));
    }

    #[tokio::test]
    async fn mid_stream_failure_speaks_and_records_fallback() {
        let mut fx = fixture(ScriptedLlm {
            fragments: vec!["Let me ", "check that"],
            fail_after: Some(2),
            complete: None,
            hang: false,
        });
        let mut handle = fx.coordinator.start("Hi".into(), Vec::new());

        assert_eq!(handle.wait().await, TaskState::Failed);
        let history = fx.history.snapshot();
        assert_eq!(history[0].content, "Sorry, please try again.");
        // The unfinished "Let me check that" is dropped, never spoken.
        assert_eq!(
            texts(&fx.sent),
            vec![("Sorry, please try again.".to_owned(), true)]
        );
        let msgs = drain(&mut fx.client_rx);
        assert_eq!(
            msgs.iter().filter(|m| m.is_audio_terminator()).count(),
            1
        );
    }

    #[tokio::test]
    async fn retry_reply_replaces_failed_stream() {
        let fx = fixture(ScriptedLlm {
            fragments: vec![],
            fail_after: Some(0),
            complete: Some("Here you go. All done."),
            hang: false,
        });
        let mut handle = fx.coordinator.start("Hi".into(), Vec::new());
        assert_eq!(handle.wait().await, TaskState::Failed);
        assert_eq!(fx.history.snapshot()[0].content, "Here you go. All done.");
        assert_eq!(
            texts(&fx.sent),
            vec![
                ("Here you go.".to_owned(), false),
                ("All done.".to_owned(), true)
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_task_interrupts_and_records_nothing() {
        let mut fx = fixture(ScriptedLlm {
            fragments: vec!["Thinking"],
            fail_after: None,
            complete: None,
            hang: true,
        });
        let handle = fx.coordinator.start("Hi".into(), Vec::new());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handle.interrupt_audio());
        let state = handle.cancel(Duration::from_secs(1)).await;
        assert_eq!(state, TaskState::Cancelled);
        assert!(fx.history.is_empty());

        let msgs = drain(&mut fx.client_rx);
        assert_eq!(
            msgs.iter().filter(|m| **m == ServerMessage::AudioInterrupt).count(),
            1
        );
        assert!(!msgs.contains(&ServerMessage::AudioEnd));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_synthesis_connect_replies_with_text_only() {
        let mut fx = fixture_with(
            ScriptedLlm::replying(vec!["Hello there. ", "Nice day."]),
            Some(Arc::new(StalledTts)),
            true,
            |config| config.tts.connect_timeout_secs = 5,
        );
        let started = tokio::time::Instant::now();
        let mut handle = fx.coordinator.start("Hi".into(), Vec::new());

        assert_eq!(handle.wait().await, TaskState::Completed);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));

        let msgs = drain(&mut fx.client_rx);
        assert_eq!(llm_text(&msgs), "Hello there. Nice day.");
        assert_eq!(msgs.first(), Some(&ServerMessage::AudioEnd));
        assert_eq!(count(&msgs, &ServerMessage::AudioEnd), 1);
        assert_eq!(count(&msgs, &ServerMessage::AudioStart), 0);
        assert_eq!(fx.history.snapshot()[0].content, "Hello there. Nice day.");
    }

    #[tokio::test(start_paused = true)]
    async fn response_ceiling_fails_task_and_ends_audio_once() {
        let mut fx = fixture_with(
            ScriptedLlm {
                fragments: vec!["First part. ", "and then"],
                fail_after: None,
                complete: None,
                hang: true,
            },
            None,
            true,
            |config| config.session.response_ceiling_secs = 30,
        );
        let started = tokio::time::Instant::now();
        let mut handle = fx.coordinator.start("Tell me everything".into(), Vec::new());

        assert_eq!(handle.wait().await, TaskState::Failed);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(fx.closes.load(Ordering::SeqCst), 1);
        assert!(fx.history.is_empty());

        let msgs = drain(&mut fx.client_rx);
        assert_eq!(count(&msgs, &ServerMessage::AudioStart), 1);
        assert_eq!(count(&msgs, &ServerMessage::AudioEnd), 1);
        assert_eq!(count(&msgs, &ServerMessage::AudioInterrupt), 0);
        assert_eq!(msgs.last(), Some(&ServerMessage::AudioEnd));
        // The unfinished fragment never reached synthesis.
        assert_eq!(texts(&fx.sent), vec![("First part.".to_owned(), false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_final_frame_ends_audio_after_drain() {
        let mut fx = fixture_with(
            ScriptedLlm::replying(vec!["Short answer."]),
            None,
            false,
            |config| config.session.audio_drain_secs = 4,
        );
        let started = tokio::time::Instant::now();
        let mut handle = fx.coordinator.start("Quick question".into(), Vec::new());

        assert_eq!(handle.wait().await, TaskState::Completed);
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(fx.closes.load(Ordering::SeqCst), 1);
        assert_eq!(fx.history.snapshot()[0].content, "Short answer.");

        let msgs = drain(&mut fx.client_rx);
        assert_eq!(count(&msgs, &ServerMessage::AudioStart), 1);
        assert_eq!(count(&msgs, &ServerMessage::audio(b"mp3")), 1);
        assert_eq!(count(&msgs, &ServerMessage::AudioEnd), 1);
        assert_eq!(msgs.last(), Some(&ServerMessage::AudioEnd));
    }
}
