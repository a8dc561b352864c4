pub mod anthropic;
pub mod codex_cli;
pub mod openai;

use crate::config::{AiProviderKind, Config};
use crate::error::{ProviderError, RouterExhausted};
use async_trait::async_trait;
use std::sync::Arc;

/// One backend leg. Completions return the raw model text; JSON parsing and
/// salvage live with the caller so a sloppy-but-recoverable response is not
/// lost at the transport layer.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Completion steered toward a JSON object response.
    async fn complete_json(&self, system: &str, user: &str) -> Result<String, ProviderError>;

    async fn complete_text(
        &self,
        system: Option<&str>,
        user: &str,
    ) -> Result<String, ProviderError>;

    /// Speech-to-text on an opaque audio blob.
    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<String, ProviderError>;

    /// Minimal probe proving the leg is reachable and authorized.
    async fn preflight(&self) -> Result<(), ProviderError>;
}

/// An ordered provider chain; the first leg to succeed terminates it.
#[derive(Clone, Default)]
pub struct Agent {
    legs: Vec<Arc<dyn Provider>>,
}

impl Agent {
    pub fn new(legs: Vec<Arc<dyn Provider>>) -> Self {
        Self { legs }
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }

    pub fn legs(&self) -> &[Arc<dyn Provider>] {
        &self.legs
    }

    pub async fn complete_json(
        &self,
        system: &str,
        user: &str,
    ) -> Result<(&'static str, String), RouterExhausted> {
        let mut errors = Vec::new();
        for leg in &self.legs {
            match leg.complete_json(system, user).await {
                Ok(text) if !text.trim().is_empty() => return Ok((leg.name(), text)),
                Ok(_) => errors.push(ProviderError::Empty {
                    provider: leg.name(),
                }),
                Err(err) => {
                    tracing::warn!(provider = leg.name(), error = %err, "provider leg failed");
                    errors.push(err);
                }
            }
        }
        Err(RouterExhausted::from_errors(&errors))
    }

    pub async fn preflight(&self) -> Result<&'static str, RouterExhausted> {
        let mut errors = Vec::new();
        for leg in &self.legs {
            match leg.preflight().await {
                Ok(()) => return Ok(leg.name()),
                Err(err) => errors.push(err),
            }
        }
        Err(RouterExhausted::from_errors(&errors))
    }
}

/// Build the generation chain the configuration asks for. `auto` prefers
/// anthropic, then the codex CLI, then openai; legs without credentials are
/// left out rather than failing at call time.
pub fn resolve_agent(config: &Config) -> Agent {
    let openai = config
        .ai
        .openai_api_key
        .as_deref()
        .map(|key| -> Arc<dyn Provider> {
            Arc::new(openai::OpenAiProvider::new(
                key,
                &config.ai.openai_model,
                &config.ai.openai_transcription_model,
            ))
        });
    let anthropic = config
        .ai
        .anthropic_api_key
        .as_deref()
        .map(|key| -> Arc<dyn Provider> {
            Arc::new(anthropic::AnthropicProvider::new(
                key,
                &config.ai.anthropic_model,
            ))
        });
    let codex: Arc<dyn Provider> = Arc::new(codex_cli::CodexCliProvider::new(&config.ai.codex_model));

    let legs: Vec<Arc<dyn Provider>> = match config.ai.provider {
        AiProviderKind::Deterministic => Vec::new(),
        AiProviderKind::Openai => openai.into_iter().collect(),
        AiProviderKind::Anthropic => anthropic.into_iter().collect(),
        AiProviderKind::CodexCli => vec![codex],
        AiProviderKind::Auto => {
            let mut legs: Vec<Arc<dyn Provider>> = Vec::new();
            legs.extend(anthropic);
            legs.push(codex);
            legs.extend(openai);
            legs
        }
    };
    Agent::new(legs)
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Scripted provider for engine tests: pops canned responses in order,
    /// errors once the script runs dry.
    pub struct MockProvider {
        name: &'static str,
        responses: Mutex<Vec<Result<String, ()>>>,
        pub transcript_text: Option<String>,
    }

    impl MockProvider {
        pub fn scripted(responses: Vec<Result<String, ()>>) -> Self {
            Self {
                name: "mock",
                responses: Mutex::new(responses),
                transcript_text: None,
            }
        }

        pub fn transcribing(text: &str) -> Self {
            Self {
                name: "mock",
                responses: Mutex::new(Vec::new()),
                transcript_text: Some(text.to_string()),
            }
        }

        fn next(&self) -> Result<String, ProviderError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ProviderError::Empty {
                    provider: self.name,
                });
            }
            responses.remove(0).map_err(|()| ProviderError::Http {
                provider: self.name,
                status: 500,
                body: "scripted failure".into(),
            })
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn complete_json(&self, _: &str, _: &str) -> Result<String, ProviderError> {
            self.next()
        }

        async fn complete_text(
            &self,
            _: Option<&str>,
            _: &str,
        ) -> Result<String, ProviderError> {
            self.next()
        }

        async fn transcribe(&self, _: &[u8], _: &str) -> Result<String, ProviderError> {
            match &self.transcript_text {
                Some(text) => Ok(text.clone()),
                None => self.next(),
            }
        }

        async fn preflight(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }
}
