//! Optional web lookup that grounds replies about current events.
//!
//! A lookup only runs when a lookup key is configured and the transcript
//! mentions one of the configured trigger words (`weather`, `news`, ...).
//! Results are condensed into a short background block for the prompt.
//! Lookup failures never fail the turn; the prompt carries a short note
//! instead so the model can hedge.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::LookupConfig;
use crate::error::{RelayError, Result};

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LookupResult {
    /// Page title.
    #[serde(default)]
    pub title: String,
    /// Page URL.
    #[serde(default)]
    pub url: String,
    /// Extracted page text.
    #[serde(default)]
    pub content: String,
}

/// A source of background information for a user turn.
#[async_trait]
pub trait ContextLookup: Send + Sync {
    /// Search for `query`, returning at most the configured number of results.
    async fn search(&self, query: &str) -> Result<Vec<LookupResult>>;
}

/// Background attached to the prompt when a triggered lookup fails.
pub const LOOKUP_UNAVAILABLE_NOTE: &str =
    "Live information could not be retrieved right now. Answer from general knowledge \
     and mention that it may be out of date.";

/// Whether `transcript` mentions any trigger word (case-insensitive, whole words).
pub fn should_lookup(transcript: &str, keywords: &[String]) -> bool {
    transcript
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .any(|word| keywords.iter().any(|k| word.eq_ignore_ascii_case(k)))
}

/// Render results as a prompt block, truncating each body to `snippet_chars`.
///
/// Returns `None` when there is nothing to add.
pub fn format_context(results: &[LookupResult], snippet_chars: usize) -> Option<String> {
    let blocks: Vec<String> = results
        .iter()
        .filter(|r| !r.content.trim().is_empty())
        .map(|r| {
            let snippet: String = r.content.trim().chars().take(snippet_chars).collect();
            let title = if r.title.is_empty() { "Untitled" } else { &r.title };
            format!("Title: {title}\nContent: {snippet}\nSource: {}", r.url)
        })
        .collect();
    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n\n"))
    }
}

/// Run a lookup for `transcript` when it mentions a trigger word.
///
/// Returns the prompt background, or `None` when no lookup was needed or
/// nothing relevant was found.
pub async fn gather_context(
    lookup: &dyn ContextLookup,
    config: &LookupConfig,
    transcript: &str,
) -> Option<String> {
    if !config.enabled || !should_lookup(transcript, &config.keywords) {
        return None;
    }
    let timeout = config.timeout();
    match tokio::time::timeout(timeout, lookup.search(transcript)).await {
        Ok(Ok(results)) => {
            let context = format_context(&results, config.snippet_chars);
            tracing::info!(found = context.is_some(), "lookup completed");
            context
        }
        Ok(Err(e)) => {
            tracing::warn!("lookup failed, continuing without results: {e}");
            Some(LOOKUP_UNAVAILABLE_NOTE.to_owned())
        }
        Err(_) => {
            tracing::warn!("lookup timed out after {timeout:?}, continuing without results");
            Some(LOOKUP_UNAVAILABLE_NOTE.to_owned())
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<LookupResult>,
}

/// Tavily search API client.
pub struct TavilyLookup {
    api_key: String,
    url: String,
    max_results: usize,
    client: reqwest::Client,
}

impl std::fmt::Debug for TavilyLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TavilyLookup")
            .field("url", &self.url)
            .field("max_results", &self.max_results)
            .finish_non_exhaustive()
    }
}

impl TavilyLookup {
    /// Create a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Lookup`] if the HTTP client cannot be constructed.
    pub fn new(config: &LookupConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RelayError::Lookup(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            url: config.url.clone(),
            max_results: config.max_results,
            client,
        })
    }
}

#[async_trait]
impl ContextLookup for TavilyLookup {
    async fn search(&self, query: &str) -> Result<Vec<LookupResult>> {
        let body = serde_json::json!({
            "query": query,
            "max_results": self.max_results,
            "search_depth": "basic",
        });
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Lookup(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RelayError::Lookup(format!("HTTP {}: {text}", status.as_u16())));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Lookup(format!("invalid response: {e}")))?;
        let mut results = parsed.results;
        results.truncate(self.max_results);
        tracing::debug!(count = results.len(), "lookup returned results");
        Ok(results)
    }
}
