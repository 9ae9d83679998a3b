//! Voxrelay: real-time duplex voice relay.
//!
//! A client streams microphone audio over a websocket. The relay forwards
//! it to a streaming speech recognizer, answers each finalized turn with a
//! streaming language model, cuts the reply into sentences and streams
//! them to a speech synthesizer whose audio is relayed back to the client.
//!
//! # Architecture
//!
//! - **Transport**: axum websocket endpoint, one [`session::Session`] per socket
//! - **STT**: streaming recognition, events handed to the session loop
//! - **Turns**: finalization rules and duplicate suppression
//! - **LLM**: OpenAI-compatible streaming chat completions with fallback
//! - **Segmenter**: sentence boundaries over the token stream
//! - **TTS**: streaming synthesis relay with a per-reply audio gate
//!
//! A new finalized turn always interrupts the reply in flight (barge-in).

pub mod config;
pub mod credentials;
pub mod error;
pub mod llm;
pub mod lookup;
pub mod pipeline;
pub mod session;
pub mod stt;
pub mod transport;
pub mod tts;

pub use config::RelayConfig;
pub use credentials::EngineCredentials;
pub use error::{RelayError, Result};
pub use pipeline::coordinator::{GenerationCoordinator, GenerationHandle};
pub use session::Session;
pub use transport::server::{AppState, RelayServer};
