//! Streaming text generation.
//!
//! A [`GenerationEngine`] turns a prompt into a stream of text fragments.
//! The relay ships an OpenAI-compatible engine ([`openai`]); tests plug in
//! scripted engines through the same trait.

pub mod fallback;
pub mod openai;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::Result;
use crate::pipeline::messages::{ChatMessage, ChatRole};

/// Ordered text fragments of one reply. An `Err` item ends the reply.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A streaming chat model.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &str;

    /// Start a streaming reply. Errors before the first fragment are
    /// returned directly; later ones arrive as stream items.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream>;

    /// Produce a whole reply in one request.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Assemble the prompt for one turn.
///
/// The prompt is the persona, at most `exchanges` prior user/assistant
/// exchanges from `history` (oldest first), then the new user turn. When
/// `context` is given it is attached to the user turn as background.
///
/// `history` must not already contain the new turn.
pub fn build_prompt(
    persona: &str,
    history: &[ChatMessage],
    exchanges: usize,
    user_text: &str,
    context: Option<&str>,
) -> Vec<ChatMessage> {
    let mut prompt = Vec::with_capacity(exchanges * 2 + 2);
    if !persona.trim().is_empty() {
        prompt.push(ChatMessage::system(persona.trim()));
    }

    let window = exchanges.saturating_mul(2);
    let mut start = history.len().saturating_sub(window);
    // Never open the window on a dangling assistant reply.
    while start < history.len() && history[start].role == ChatRole::Assistant {
        start += 1;
    }
    prompt.extend(
        history[start..]
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .cloned(),
    );

    let content = match context {
        Some(context) if !context.trim().is_empty() => format!(
            "{user_text}\n\nUse this background information if it is relevant:\n{}",
            context.trim()
        ),
        _ => user_text.to_owned(),
    };
    prompt.push(ChatMessage::user(content));
    prompt
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn exchange(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .flat_map(|i| {
                [
                    ChatMessage::user(format!("q{i}")),
                    ChatMessage::assistant(format!("a{i}")),
                ]
            })
            .collect()
    }

    fn contents(prompt: &[ChatMessage]) -> Vec<&str> {
        prompt.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn prompt_starts_with_persona_and_ends_with_turn() {
        let prompt = build_prompt("Be brief.", &exchange(1), 6, "What now?", None);
        assert_eq!(prompt[0].role, ChatRole::System);
        assert_eq!(contents(&prompt), vec!["Be brief.", "q0", "a0", "What now?"]);
        assert_eq!(prompt.last().unwrap().role, ChatRole::User);
    }

    #[test]
    fn history_is_bounded_to_recent_exchanges() {
        let prompt = build_prompt("P", &exchange(5), 2, "next", None);
        assert_eq!(contents(&prompt), vec!["P", "q3", "a3", "q4", "a4", "next"]);
    }

    #[test]
    fn window_skips_leading_assistant_message() {
        // A cancelled turn leaves a user message without a reply.
        let mut history = exchange(2);
        history.push(ChatMessage::user("interrupted"));
        let prompt = build_prompt("P", &history, 1, "next", None);
        assert_eq!(contents(&prompt), vec!["P", "interrupted", "next"]);
    }

    #[test]
    fn zero_exchanges_sends_only_the_turn() {
        let prompt = build_prompt("", &exchange(3), 0, "hi", None);
        assert_eq!(contents(&prompt), vec!["hi"]);
    }

    #[test]
    fn context_is_attached_to_user_turn() {
        let prompt = build_prompt("P", &[], 3, "Weather today?", Some("Sunny, 21C."));
        let last = &prompt.last().unwrap().content;
        assert!(last.starts_with("Weather today?"));
        assert!(last.contains("Sunny, 21C."));
    }
}
