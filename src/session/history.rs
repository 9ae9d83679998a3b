//! Per-session conversation log.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::pipeline::messages::{ChatMessage, ChatRole};

/// Ordered, append-only list of user and assistant messages.
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. System messages are never stored.
    pub fn push(&mut self, message: ChatMessage) {
        if message.role == ChatRole::System {
            tracing::debug!("refusing to store system message in chat history");
            return;
        }
        self.messages.push(message);
    }

    /// All messages, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..].to_vec()
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing has been said yet.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// History shared between a session and its generation tasks.
#[derive(Debug, Clone, Default)]
pub struct SharedHistory {
    inner: Arc<Mutex<ChatHistory>>,
}

impl SharedHistory {
    /// Create an empty shared history.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChatHistory> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append a user message.
    pub fn push_user(&self, content: impl Into<String>) {
        self.lock().push(ChatMessage::user(content));
    }

    /// Append an assistant message.
    pub fn push_assistant(&self, content: impl Into<String>) {
        self.lock().push(ChatMessage::assistant(content));
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ChatMessage> {
        self.lock().recent(n)
    }

    /// Copy of the whole log.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.lock().messages().to_vec()
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been said yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
