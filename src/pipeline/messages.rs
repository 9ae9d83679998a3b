//! Message types passed between relay stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recognized utterance reported by the speech recognition engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// Transcript text as delivered (untrimmed).
    pub transcript: String,
    /// Engine signalled the end of the speaker's turn.
    pub end_of_turn: bool,
    /// Transcript has been punctuated/cased by the engine.
    pub turn_is_formatted: bool,
    /// Arrival order within the session, starting at 0.
    pub order: u64,
}

/// Event raised by the recognition engine's driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Recognition session opened.
    Begin {
        /// Engine-assigned session id.
        id: String,
    },
    /// A partial or finalized turn.
    Turn(Turn),
    /// Recognition session ended.
    Termination,
    /// Engine reported an error. The stream may or may not continue.
    Error {
        /// Human-readable description.
        message: String,
    },
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions for the model. Only ever appears in prompts.
    System,
    /// The person speaking.
    User,
    /// The relay's reply.
    Assistant,
}

impl ChatRole {
    /// Wire name used by OpenAI-compatible APIs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One immutable entry of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author.
    pub role: ChatRole,
    /// Message text.
    pub content: String,
    /// When the message was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a message stamped with the current time.
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// System prompt message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    /// Assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// Lifecycle of one response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Generating and/or speaking.
    Running,
    /// Reply generated, recorded, and its audio stream closed.
    Completed,
    /// Superseded by a newer turn or torn down with the session.
    Cancelled,
    /// Generation failed upstream or hit the response ceiling.
    ///
    /// A fallback reply is still spoken and recorded whenever possible.
    Failed,
}

impl TaskState {
    /// Whether the task has reached a final state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}
