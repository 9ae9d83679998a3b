//! Streaming speech-to-text.
//!
//! A [`RecognitionEngine`] opens a long-lived recognition stream for one
//! session. Audio is pushed through the returned [`RecognitionHandle`]
//! without blocking; events are produced on the engine's own driver task
//! and handed to the session through a [`RecognitionSink`].

pub mod assemblyai;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::pipeline::messages::RecognitionEvent;

/// Thread-safe hand-off of recognition events to the owning session.
///
/// Cloneable; emitting never blocks and never fails loudly, so it may be
/// called from any task or thread.
#[derive(Debug, Clone)]
pub struct RecognitionSink {
    tx: mpsc::UnboundedSender<RecognitionEvent>,
}

impl RecognitionSink {
    /// Create a sink and the receiver the session consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RecognitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Returns `false` once the session has gone away.
    pub fn emit(&self, event: RecognitionEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Control handle for one open recognition stream.
#[derive(Debug)]
pub struct RecognitionHandle {
    audio: Option<mpsc::UnboundedSender<Bytes>>,
    driver: Option<JoinHandle<()>>,
}

impl RecognitionHandle {
    /// Wrap a driver task that consumes audio from the paired receiver.
    ///
    /// The driver must treat the end of the audio channel as a request to
    /// terminate the stream.
    pub fn new(audio: mpsc::UnboundedSender<Bytes>, driver: JoinHandle<()>) -> Self {
        Self {
            audio: Some(audio),
            driver: Some(driver),
        }
    }

    /// Queue PCM audio for the engine. Returns `false` if the stream is gone.
    pub fn push_audio(&self, pcm: Bytes) -> bool {
        self.audio.as_ref().is_some_and(|tx| tx.send(pcm).is_ok())
    }

    /// Whether the driver task is still running.
    pub fn is_alive(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| !d.is_finished())
    }

    /// Terminate the stream and wait up to `grace` for the driver to finish.
    pub async fn close(mut self, grace: Duration) {
        // Dropping the sender asks the driver to send its terminate message.
        self.audio.take();
        if let Some(mut driver) = self.driver.take() {
            match tokio::time::timeout(grace, &mut driver).await {
                Ok(Ok(())) => debug!("recognition stream closed"),
                Ok(Err(e)) => warn!("recognition driver failed: {e}"),
                Err(_) => {
                    warn!("recognition driver did not stop within {grace:?}, aborting");
                    driver.abort();
                }
            }
        }
    }
}

impl Drop for RecognitionHandle {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Factory for per-session recognition streams.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &str;

    /// Open a stream whose events are delivered to `sink`.
    async fn connect(&self, sink: RecognitionSink) -> Result<RecognitionHandle>;
}
