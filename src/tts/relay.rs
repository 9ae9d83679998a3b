//! Per-reply synthesis relay and the client-facing audio gate.
//!
//! [`SynthesisRelay`] owns one synthesis connection for the lifetime of a
//! reply. It sends the voice configuration, then sentences as they become
//! available, while a background receive loop forwards audio frames to the
//! client. All client-visible audio signals go through one [`AudioGate`],
//! which guarantees that a reply's audio stream:
//!
//! - starts with exactly one `audio_start`, emitted just before the first chunk,
//! - ends with exactly one of `audio_end` or `audio_interrupt`,
//! - carries no audio after that terminator.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::transport::ClientSender;
use crate::transport::protocol::ServerMessage;
use crate::tts::{
    FrameStream, SynthesisConnection, SynthesisEngine, SynthesisRequest, SynthesisSink,
    VoiceConfig,
};

/// Where a reply's audio stream currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No audio sent yet.
    Idle,
    /// `audio_start` sent, chunks flowing.
    Streaming,
    /// Closed with `audio_end`.
    Ended,
    /// Closed with `audio_interrupt`.
    Interrupted,
}

impl GateState {
    /// Whether a terminator has been sent.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Interrupted)
    }
}

struct GateInner {
    state: GateState,
    client: ClientSender,
    chunks: u64,
}

impl GateInner {
    fn emit(&self, message: ServerMessage) {
        if self.client.send(message).is_err() {
            debug!("client channel closed, dropping audio signal");
        }
    }
}

/// Serialises one reply's audio signals to the client.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct AudioGate {
    inner: Arc<Mutex<GateInner>>,
}

impl std::fmt::Debug for AudioGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioGate")
            .field("state", &self.state())
            .finish()
    }
}

impl AudioGate {
    /// Create a gate writing to `client`.
    pub fn new(client: ClientSender) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                state: GateState::Idle,
                client,
                chunks: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Forward one audio chunk, preceded by `audio_start` if it is the first.
    ///
    /// Returns `false` once the stream is terminated; the chunk is dropped.
    pub fn audio(&self, bytes: &[u8]) -> bool {
        let mut inner = self.lock();
        match inner.state {
            GateState::Ended | GateState::Interrupted => return false,
            GateState::Idle => {
                inner.state = GateState::Streaming;
                inner.emit(ServerMessage::AudioStart);
            }
            GateState::Streaming => {}
        }
        inner.chunks += 1;
        inner.emit(ServerMessage::audio(bytes));
        true
    }

    /// Close the stream normally. Returns `true` if this call sent `audio_end`.
    pub fn end(&self) -> bool {
        self.terminate(GateState::Ended, ServerMessage::AudioEnd)
    }

    /// Cut the stream off. Returns `true` if this call sent `audio_interrupt`.
    pub fn interrupt(&self) -> bool {
        self.terminate(GateState::Interrupted, ServerMessage::AudioInterrupt)
    }

    fn terminate(&self, next: GateState, message: ServerMessage) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = next;
        inner.emit(message);
        true
    }

    /// Current state.
    pub fn state(&self) -> GateState {
        self.lock().state
    }

    /// Number of audio chunks forwarded so far.
    pub fn chunks_sent(&self) -> u64 {
        self.lock().chunks
    }
}

/// Drives one synthesis connection for one reply.
pub struct SynthesisRelay {
    context_id: String,
    sink: Box<dyn SynthesisSink>,
    receiver: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    gate: AudioGate,
    sink_failed: bool,
    sentences_sent: usize,
}

impl SynthesisRelay {
    /// Open a connection, send the voice configuration and start forwarding audio.
    ///
    /// `cancel` stops the receive loop without sending a terminator; pass a
    /// child of the owning task's token so barge-in reaches it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the configuration message fails.
    pub async fn open(
        engine: &dyn SynthesisEngine,
        voice: VoiceConfig,
        context_id: String,
        gate: AudioGate,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let SynthesisConnection { mut sink, frames } = engine.open().await?;
        if let Err(e) = sink
            .send(SynthesisRequest::Configure {
                voice_config: voice,
                context_id: context_id.clone(),
            })
            .await
        {
            let _ = sink.close().await;
            return Err(e);
        }
        info!(engine = engine.name(), context_id = %context_id, "synthesis context opened");

        let receiver = tokio::spawn(receive_loop(
            frames,
            gate.clone(),
            cancel.clone(),
            context_id.clone(),
        ));

        Ok(Self {
            context_id,
            sink,
            receiver: Some(receiver),
            cancel,
            gate,
            sink_failed: false,
            sentences_sent: 0,
        })
    }

    /// Send a completed sentence. Returns `false` if it could not be sent.
    pub async fn send_sentence(&mut self, text: &str) -> bool {
        self.send_text(text, false).await
    }

    /// Send the last text of the reply (possibly empty) with `end: true`.
    pub async fn send_final(&mut self, text: &str) -> bool {
        self.send_text(text, true).await
    }

    async fn send_text(&mut self, text: &str, end: bool) -> bool {
        if self.sink_failed {
            return false;
        }
        let request = SynthesisRequest::Text {
            text: text.to_owned(),
            end,
            context_id: self.context_id.clone(),
        };
        match self.sink.send(request).await {
            Ok(()) => {
                self.sentences_sent += 1;
                true
            }
            Err(e) => {
                warn!(context_id = %self.context_id, "synthesis send failed, continuing without audio: {e}");
                self.sink_failed = true;
                self.gate.end();
                false
            }
        }
    }

    /// Wait for the engine to deliver its final frame.
    ///
    /// Returns `false` if `timeout` elapsed first; the loop keeps running
    /// until [`shutdown`](Self::shutdown).
    pub async fn wait_for_audio(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.receiver.as_mut() else {
            return true;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    warn!(context_id = %self.context_id, "synthesis receive loop failed: {e}");
                }
                self.receiver = None;
                true
            }
            Err(_) => {
                warn!(context_id = %self.context_id, "no final audio frame within {timeout:?}");
                false
            }
        }
    }

    /// Stop the receive loop and close the connection.
    ///
    /// The loop gets `grace` to observe cancellation before it is aborted.
    /// Never sends a terminator; the owner decides between end and interrupt.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        if let Some(mut handle) = self.receiver.take()
            && tokio::time::timeout(grace, &mut handle).await.is_err()
        {
            warn!(context_id = %self.context_id, "receive loop ignored cancellation, aborting");
            handle.abort();
        }
        if let Err(e) = self.sink.close().await {
            debug!(context_id = %self.context_id, "closing synthesis connection: {e}");
        }
        debug!(
            context_id = %self.context_id,
            sentences = self.sentences_sent,
            degraded = self.sink_failed,
            "synthesis context closed"
        );
    }
}

async fn receive_loop(
    mut frames: FrameStream,
    gate: AudioGate,
    cancel: CancellationToken,
    context_id: String,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(context_id = %context_id, "receive loop cancelled");
                return;
            }
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    if let Some(audio) = frame.audio.as_deref()
                        && !audio.is_empty()
                        && !gate.audio(audio)
                    {
                        debug!(context_id = %context_id, "audio stream already terminated");
                        return;
                    }
                    if frame.is_final {
                        info!(context_id = %context_id, chunks = gate.chunks_sent(), "final audio frame received");
                        gate.end();
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(context_id = %context_id, "synthesis stream failed: {e}");
                    gate.end();
                    return;
                }
                None => {
                    warn!(context_id = %context_id, "synthesis connection closed before final frame");
                    gate.end();
                    return;
                }
            }
        }
    }
}
