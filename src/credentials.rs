//! Engine credentials supplied per session.
//!
//! The server starts every session from the credentials found in its
//! environment; a client may then provision its own keys over the socket.
//! Credentials live on the session and are handed to engine constructors,
//! never stored in process-wide state.

use std::fmt;

/// Environment variable holding the speech recognition key.
pub const STT_KEY_ENV: &str = "ASSEMBLYAI_API_KEY";
/// Environment variable holding the text generation key.
pub const LLM_KEY_ENV: &str = "GEMINI_API_KEY";
/// Environment variable holding the voice synthesis key.
pub const TTS_KEY_ENV: &str = "MURF_API_KEY";
/// Environment variable holding the web lookup key.
pub const LOOKUP_KEY_ENV: &str = "TAVILY_API_KEY";

/// An API key whose value never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a raw key. Returns `None` for blank input.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    /// The raw key, for building upstream requests.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Keys for the upstream engines of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineCredentials {
    /// Speech recognition.
    pub stt: Option<ApiKey>,
    /// Text generation.
    pub llm: Option<ApiKey>,
    /// Voice synthesis.
    pub tts: Option<ApiKey>,
    /// Optional web lookup.
    pub lookup: Option<ApiKey>,
}

impl EngineCredentials {
    /// Read the server default credentials from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build credentials from an arbitrary variable source.
    pub fn from_lookup(mut get: impl FnMut(&str) -> Option<String>) -> Self {
        Self {
            stt: get(STT_KEY_ENV).and_then(ApiKey::new),
            llm: get(LLM_KEY_ENV).and_then(ApiKey::new),
            tts: get(TTS_KEY_ENV).and_then(ApiKey::new),
            lookup: get(LOOKUP_KEY_ENV).and_then(ApiKey::new),
        }
    }

    /// Overlay every key present in `other`, keeping existing keys otherwise.
    ///
    /// Returns `true` when anything changed.
    pub fn merge(&mut self, other: EngineCredentials) -> bool {
        let mut changed = false;
        for (slot, incoming) in [
            (&mut self.stt, other.stt),
            (&mut self.llm, other.llm),
            (&mut self.tts, other.tts),
            (&mut self.lookup, other.lookup),
        ] {
            if let Some(key) = incoming
                && slot.as_ref() != Some(&key)
            {
                *slot = Some(key);
                changed = true;
            }
        }
        changed
    }

    /// Names of the required engines that still lack a key.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.stt.is_none() {
            missing.push("speech recognition");
        }
        if self.llm.is_none() {
            missing.push("text generation");
        }
        if self.tts.is_none() {
            missing.push("voice synthesis");
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::collections::HashMap;

    #[test]
    fn blank_keys_are_rejected() {
        assert!(ApiKey::new("").is_none());
        assert!(ApiKey::new("   ").is_none());
        assert_eq!(ApiKey::new(" abc ").unwrap().expose(), "abc");
    }

    #[test]
    fn debug_output_redacts_key() {
        let creds = EngineCredentials {
            stt: ApiKey::new("super-secret"),
            ..Default::default()
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn from_lookup_reads_known_variables() {
        let vars: HashMap<&str, &str> = [(STT_KEY_ENV, "stt"), (TTS_KEY_ENV, "tts")]
            .into_iter()
            .collect();
        let creds = EngineCredentials::from_lookup(|k| vars.get(k).map(|v| (*v).to_owned()));
        assert_eq!(creds.stt.unwrap().expose(), "stt");
        assert_eq!(creds.tts.unwrap().expose(), "tts");
        assert!(creds.llm.is_none());
        assert!(creds.lookup.is_none());
    }

    #[test]
    fn merge_overlays_present_keys_only() {
        let mut base = EngineCredentials {
            stt: ApiKey::new("stt-old"),
            llm: ApiKey::new("llm-old"),
            ..Default::default()
        };
        let changed = base.merge(EngineCredentials {
            llm: ApiKey::new("llm-new"),
            tts: ApiKey::new("tts-new"),
            ..Default::default()
        });
        assert!(changed);
        assert_eq!(base.stt.as_ref().unwrap().expose(), "stt-old");
        assert_eq!(base.llm.as_ref().unwrap().expose(), "llm-new");
        assert_eq!(base.tts.as_ref().unwrap().expose(), "tts-new");
    }

    #[test]
    fn merge_with_identical_keys_reports_no_change() {
        let mut base = EngineCredentials {
            stt: ApiKey::new("same"),
            ..Default::default()
        };
        assert!(!base.merge(EngineCredentials {
            stt: ApiKey::new("same"),
            ..Default::default()
        }));
    }

    #[test]
    fn missing_required_ignores_lookup() {
        let creds = EngineCredentials {
            stt: ApiKey::new("a"),
            ..Default::default()
        };
        assert_eq!(
            creds.missing_required(),
            vec!["text generation", "voice synthesis"]
        );
    }
}
