//! Recovery chain used when a streaming reply fails.
//!
//! After a stream error the relay makes one bounded, non-streaming attempt
//! with the same prompt. If that also fails or times out, a fixed apology is
//! spoken instead, so every accepted turn gets an audible answer.
//!
//! ```rust,no_run
//! # use voxrelay::llm::fallback::{recover_reply, ReplySource};
//! # use voxrelay::llm::GenerationEngine;
//! # async fn demo(engine: &dyn GenerationEngine) {
//! let prompt = [voxrelay::pipeline::messages::ChatMessage::user("Hi")];
//! let reply = recover_reply(
//!     engine,
//!     &prompt,
//!     std::time::Duration::from_secs(15),
//!     "Sorry, something went wrong.",
//! )
//! .await;
//! if reply.source == ReplySource::Apology {
//!     tracing::warn!("speaking apology");
//! }
//! # }
//! ```

use std::time::Duration;

use tracing::{info, warn};

use crate::llm::GenerationEngine;
use crate::pipeline::messages::ChatMessage;

/// Where a recovered reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    /// The non-streaming retry succeeded.
    Retry,
    /// Both attempts failed; the configured apology is used.
    Apology,
}

/// A reply produced by [`recover_reply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredReply {
    /// Text to speak and record.
    pub text: String,
    /// How it was obtained.
    pub source: ReplySource,
}

/// Run the recovery chain for a failed stream.
///
/// Never fails: the apology is the last resort.
pub async fn recover_reply(
    engine: &dyn GenerationEngine,
    prompt: &[ChatMessage],
    timeout: Duration,
    apology: &str,
) -> RecoveredReply {
    match tokio::time::timeout(timeout, engine.complete(prompt)).await {
        Ok(Ok(text)) if !text.trim().is_empty() => {
            info!(engine = engine.name(), "non-streaming retry succeeded");
            RecoveredReply {
                text: text.trim().to_owned(),
                source: ReplySource::Retry,
            }
        }
        Ok(Ok(_)) => {
            warn!(engine = engine.name(), "non-streaming retry returned no text");
            apology_reply(apology)
        }
        Ok(Err(e)) => {
            warn!(engine = engine.name(), "non-streaming retry failed: {e}");
            apology_reply(apology)
        }
        Err(_) => {
            warn!(
                engine = engine.name(),
                "non-streaming retry timed out after {timeout:?}"
            );
            apology_reply(apology)
        }
    }
}

fn apology_reply(apology: &str) -> RecoveredReply {
    RecoveredReply {
        text: apology.to_owned(),
        source: ReplySource::Apology,
    }
}
