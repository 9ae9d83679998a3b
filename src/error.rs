//! Error types for the voice relay.

/// Top-level error type for the duplex voice relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Client connection or socket failure. Ends the session.
    #[error("transport error: {0}")]
    Transport(String),

    /// Speech recognition engine error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Text generation engine error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Voice synthesis engine error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Context lookup (web search) error.
    #[error("lookup error: {0}")]
    Lookup(String),

    /// Malformed inbound client message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Missing or unusable engine credentials.
    #[error("credentials error: {0}")]
    Credentials(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether this error came from one of the upstream engines.
    ///
    /// Upstream failures degrade the current turn but never end the session.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::Stt(_) | Self::Llm(_) | Self::Tts(_) | Self::Lookup(_)
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_are_upstream() {
        for err in [
            RelayError::Stt("x".into()),
            RelayError::Llm("x".into()),
            RelayError::Tts("x".into()),
            RelayError::Lookup("x".into()),
        ] {
            assert!(err.is_upstream());
        }
    }

    #[test]
    fn local_errors_are_not_upstream() {
        assert!(!RelayError::Transport("socket reset".into()).is_upstream());
        assert!(!RelayError::Protocol("bad json".into()).is_upstream());
        assert!(!RelayError::Credentials("missing".into()).is_upstream());
    }

    #[test]
    fn display_includes_concern_prefix() {
        let err = RelayError::Tts("connection reset".into());
        assert_eq!(err.to_string(), "TTS error: connection reset");
    }
}
