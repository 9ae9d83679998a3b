//! Building upstream engines from a session's credentials.

use std::sync::Arc;

use tracing::warn;

use crate::config::RelayConfig;
use crate::credentials::EngineCredentials;
use crate::error::{RelayError, Result};
use crate::llm::openai::{OpenAiCompatConfig, OpenAiCompatEngine};
use crate::lookup::{ContextLookup, TavilyLookup};
use crate::pipeline::coordinator::ReplyEngines;
use crate::stt::RecognitionEngine;
use crate::stt::assemblyai::AssemblyAiEngine;
use crate::tts::murf::MurfEngine;

/// Message sent to the client when no recognition key is available.
pub const MISSING_STT_KEY: &str = "speech recognition API key not configured";

/// Creates engines for a session. Swapped for fakes in tests.
pub trait EngineFactory: Send + Sync {
    /// Engine for the session's recognition stream.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Credentials`] when the key is missing.
    fn recognition(&self, credentials: &EngineCredentials) -> Result<Arc<dyn RecognitionEngine>>;

    /// Engines for generating and speaking replies.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Credentials`] when a required key is missing.
    fn reply(&self, credentials: &EngineCredentials) -> Result<ReplyEngines>;
}

/// Factory for the hosted engines: AssemblyAI, an OpenAI-compatible chat
/// API, Murf and Tavily.
#[derive(Debug, Clone)]
pub struct VendorEngineFactory {
    config: Arc<RelayConfig>,
}

impl VendorEngineFactory {
    /// Create a factory using `config` for every engine it builds.
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self { config }
    }
}

impl EngineFactory for VendorEngineFactory {
    fn recognition(&self, credentials: &EngineCredentials) -> Result<Arc<dyn RecognitionEngine>> {
        let key = credentials
            .stt
            .as_ref()
            .ok_or_else(|| RelayError::Credentials(MISSING_STT_KEY.into()))?;
        Ok(Arc::new(AssemblyAiEngine::new(
            self.config.stt.clone(),
            key.expose(),
        )))
    }

    fn reply(&self, credentials: &EngineCredentials) -> Result<ReplyEngines> {
        let missing: Vec<&str> = credentials
            .missing_required()
            .into_iter()
            .filter(|name| *name != "speech recognition")
            .collect();
        let (Some(llm_key), Some(tts_key)) = (&credentials.llm, &credentials.tts) else {
            return Err(RelayError::Credentials(format!(
                "{} API key not configured",
                missing.join(" and ")
            )));
        };

        let llm = OpenAiCompatEngine::new(OpenAiCompatConfig::from_llm_config(
            &self.config.llm,
            llm_key.expose(),
        ));
        let tts = MurfEngine::new(self.config.tts.clone(), tts_key.expose());
        let lookup = match &credentials.lookup {
            Some(key) if self.config.lookup.enabled => {
                match TavilyLookup::new(&self.config.lookup, key.expose()) {
                    Ok(lookup) => Some(Arc::new(lookup) as Arc<dyn ContextLookup>),
                    Err(e) => {
                        warn!("lookup disabled for this session: {e}");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(ReplyEngines {
            llm: Arc::new(llm),
            tts: Arc::new(tts),
            lookup,
        })
    }
}
