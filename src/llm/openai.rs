//! OpenAI-compatible chat completions engine.
//!
//! Talks to any endpoint implementing `POST {base_url}/chat/completions`,
//! including Gemini's OpenAI compatibility layer. Streaming replies are
//! read as SSE and reduced to plain text fragments from
//! `choices[].delta.content`.
//!
//! ```rust,no_run
//! use voxrelay::llm::openai::{OpenAiCompatConfig, OpenAiCompatEngine};
//! use voxrelay::llm::GenerationEngine;
//! use voxrelay::pipeline::messages::ChatMessage;
//! use futures_util::StreamExt;
//!
//! # async fn example() -> voxrelay::error::Result<()> {
//! let engine = OpenAiCompatEngine::new(OpenAiCompatConfig::new("key", "gemini-1.5-flash"));
//! let mut tokens = engine.stream(&[ChatMessage::user("Hello")]).await?;
//! while let Some(token) = tokens.next().await {
//!     print!("{}", token?);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::config::LlmConfig;
use crate::error::{RelayError, Result};
use crate::llm::sse::SseLineParser;
use crate::llm::{GenerationEngine, TokenStream};
use crate::pipeline::messages::ChatMessage;

/// Connection and sampling settings for [`OpenAiCompatEngine`].
#[derive(Clone)]
pub struct OpenAiCompatConfig {
    /// Bearer token.
    pub api_key: String,
    /// Base URL including the version segment, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum tokens per reply.
    pub max_tokens: u32,
}

impl std::fmt::Debug for OpenAiCompatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl OpenAiCompatConfig {
    /// Create a config using the default endpoint and sampling settings.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let defaults = LlmConfig::default();
        Self {
            api_key: api_key.into(),
            base_url: defaults.base_url,
            model: model.into(),
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
        }
    }

    /// Build from the relay's LLM section and a session key.
    pub fn from_llm_config(config: &LlmConfig, api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Override the base URL (for proxies and tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Build the JSON request body for the Chat Completions API.
pub fn build_completions_request(
    config: &OpenAiCompatConfig,
    messages: &[ChatMessage],
    stream: bool,
) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
        .collect();
    serde_json::json!({
        "model": config.model,
        "messages": messages,
        "stream": stream,
        "temperature": config.temperature,
        "max_tokens": config.max_tokens,
    })
}

/// Extract text deltas from one streamed chunk.
///
/// An in-band `error` object becomes an [`RelayError::Llm`]. Payloads that
/// are not JSON are skipped.
pub fn parse_completions_chunk(data: &str) -> Result<Vec<String>> {
    let parsed: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("skipping non-JSON completion chunk: {e}");
            return Ok(Vec::new());
        }
    };

    if let Some(error) = parsed.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map_or_else(|| error.to_string(), String::from);
        return Err(RelayError::Llm(format!("stream error: {message}")));
    }

    let mut fragments = Vec::new();
    if let Some(choices) = parsed.get("choices").and_then(|c| c.as_array()) {
        for choice in choices {
            if let Some(content) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
                && !content.is_empty()
            {
                fragments.push(content.to_owned());
            }
        }
    }
    Ok(fragments)
}

/// Pull the full reply out of a non-streaming response body.
pub fn parse_completion_response(body: &serde_json::Value) -> Result<String> {
    body.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RelayError::Llm("completion response had no content".into()))
}

fn map_http_error(status: reqwest::StatusCode, body: &str) -> RelayError {
    let message = extract_error_message(body);
    match status.as_u16() {
        401 | 403 => RelayError::Llm(format!("authentication failed: {message}")),
        429 => RelayError::Llm(format!("rate limited: {message}")),
        code => RelayError::Llm(format!("HTTP {code}: {message}")),
    }
}

/// Extract an error message from an OpenAI-style error body.
///
/// Gemini wraps errors in a one-element array, so both shapes are accepted.
fn extract_error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let root = match parsed.as_ref() {
        Some(serde_json::Value::Array(items)) => items.first(),
        other => other,
    };
    root.and_then(|v| v.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map_or_else(|| body.to_owned(), String::from)
}

/// Streaming engine for OpenAI-compatible chat completion APIs.
pub struct OpenAiCompatEngine {
    config: OpenAiCompatConfig,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatEngine")
            .field("model", &self.config.model)
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

impl OpenAiCompatEngine {
    /// Create an engine with a fresh HTTP client.
    pub fn new(config: OpenAiCompatConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let body = build_completions_request(&self.config, messages, stream);
        let response = self
            .client
            .post(self.config.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationEngine for OpenAiCompatEngine {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        let response = self.post(messages, true).await?;
        tracing::debug!(model = %self.config.model, "completion stream opened");
        Ok(Box::pin(token_stream(response.bytes_stream())))
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let response = self.post(messages, false).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RelayError::Llm(format!("invalid completion body: {e}")))?;
        parse_completion_response(&body)
    }
}

struct StreamState<S> {
    byte_stream: std::pin::Pin<Box<S>>,
    parser: SseLineParser,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl<S> StreamState<S> {
    /// Queue the fragments of one SSE payload. Returns `true` once the
    /// stream is over (`[DONE]` or an in-band error).
    fn absorb(&mut self, data: &str, is_done: bool) -> bool {
        if is_done {
            return true;
        }
        match parse_completions_chunk(data) {
            Ok(fragments) => {
                self.pending.extend(fragments.into_iter().map(Ok));
                false
            }
            Err(e) => {
                self.pending.push_back(Err(e));
                true
            }
        }
    }
}

/// Turn an SSE byte stream into a stream of text fragments.
///
/// The stream ends after `[DONE]`, after the first error, or when the
/// body ends.
fn token_stream<S>(byte_stream: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    futures_util::stream::unfold(
        StreamState {
            byte_stream: Box::pin(byte_stream),
            parser: SseLineParser::new(),
            pending: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        for event in state.parser.push(&chunk) {
                            if state.absorb(&event.data, event.is_done()) {
                                state.finished = true;
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((
                            Err(RelayError::Llm(format!("stream read error: {e}"))),
                            state,
                        ));
                    }
                    None => {
                        state.finished = true;
                        if let Some(event) = state.parser.flush() {
                            state.absorb(&event.data, event.is_done());
                        }
                    }
                }
            }
        },
    )
}
