//! Ordered multi-provider speech-to-text: Whisper first, Anthropic next,
//! the Codex CLI last (unless disabled by env). First non-empty transcript
//! wins; a failed leg only adds its reason to the error trail.

use crate::config::{codex_transcribe_enabled, Config};
use crate::error::{ProviderError, RouterExhausted};
use crate::metrics::metrics;
use crate::providers::{anthropic::AnthropicProvider, codex_cli::CodexCliProvider, openai::OpenAiProvider, Provider};
use std::sync::Arc;

/// Normalize an incoming MIME type to the handful the providers accept.
pub fn normalize_mime(raw: &str) -> &'static str {
    let base = raw.split(';').next().unwrap_or("").trim().to_lowercase();
    match base.as_str() {
        "audio/ogg" | "application/ogg" | "audio/opus" => "audio/ogg",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "audio/wav",
        "audio/mpeg" | "audio/mp3" => "audio/mpeg",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "audio/mp4",
        _ => "audio/webm",
    }
}

pub struct TranscriptionRouter {
    legs: Vec<Arc<dyn Provider>>,
}

impl TranscriptionRouter {
    pub fn new(legs: Vec<Arc<dyn Provider>>) -> Self {
        Self { legs }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut legs: Vec<Arc<dyn Provider>> = Vec::new();
        if let Some(key) = config.ai.openai_api_key.as_deref() {
            legs.push(Arc::new(OpenAiProvider::new(
                key,
                &config.ai.openai_model,
                &config.ai.openai_transcription_model,
            )));
        }
        if let Some(key) = config.ai.anthropic_api_key.as_deref() {
            legs.push(Arc::new(AnthropicProvider::new(
                key,
                &config.ai.anthropic_model,
            )));
        }
        if codex_transcribe_enabled() {
            legs.push(Arc::new(CodexCliProvider::new(&config.ai.codex_model)));
        }
        Self { legs }
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }

    /// Route a blob through the chain. Returns the transcript and the leg
    /// that produced it.
    pub async fn transcribe(
        &self,
        audio: &[u8],
        mime: &str,
    ) -> Result<(String, &'static str), RouterExhausted> {
        if audio.is_empty() {
            return Err(RouterExhausted {
                joined: "empty audio blob".into(),
            });
        }
        let mime = normalize_mime(mime);

        let mut errors = Vec::new();
        for leg in &self.legs {
            match leg.transcribe(audio, mime).await {
                Ok(text) => {
                    let trimmed = text.trim().to_string();
                    if trimmed.is_empty() {
                        metrics()
                            .transcriptions_total
                            .with_label_values(&[leg.name(), "empty"])
                            .inc();
                        errors.push(ProviderError::Empty {
                            provider: leg.name(),
                        });
                        continue;
                    }
                    metrics()
                        .transcriptions_total
                        .with_label_values(&[leg.name(), "ok"])
                        .inc();
                    return Ok((trimmed, leg.name()));
                }
                Err(err) => {
                    metrics()
                        .transcriptions_total
                        .with_label_values(&[leg.name(), "error"])
                        .inc();
                    tracing::warn!(provider = leg.name(), error = %err, "transcription leg failed");
                    errors.push(err);
                }
            }
        }
        Err(RouterExhausted::from_errors(&errors))
    }

    /// Probe legs in chain order; the first healthy one wins.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;

    #[test]
    fn mime_normalization_folds_aliases() {
        assert_eq!(normalize_mime("audio/x-wav"), "audio/wav");
        assert_eq!(normalize_mime("audio/mp3"), "audio/mpeg");
        assert_eq!(normalize_mime("audio/webm;codecs=opus"), "audio/webm");
        assert_eq!(normalize_mime("video/quicktime"), "audio/webm");
    }

    #[tokio::test]
    async fn empty_blob_is_rejected() {
        let router = TranscriptionRouter::new(vec![Arc::new(MockProvider::transcribing("hi"))]);
        let err = router.transcribe(&[], "audio/wav").await.unwrap_err();
        assert!(err.joined.contains("empty audio blob"));
    }

    #[tokio::test]
    async fn first_success_terminates_the_chain() {
        let router = TranscriptionRouter::new(vec![
            Arc::new(MockProvider::scripted(vec![Err(())])),
            Arc::new(MockProvider::transcribing("hello from whisper")),
        ]);
        let (text, provider) = router.transcribe(&[1, 2, 3], "audio/wav").await.unwrap();
        assert_eq!(text, "hello from whisper");
        assert_eq!(provider, "mock");
    }

    #[tokio::test]
    async fn whitespace_only_transcripts_advance_the_chain() {
        let router = TranscriptionRouter::new(vec![
            Arc::new(MockProvider::transcribing("   ")),
            Arc::new(MockProvider::transcribing("real words")),
        ]);
        let (text, _) = router.transcribe(&[1], "audio/webm").await.unwrap();
        assert_eq!(text, "real words");
    }

    #[tokio::test]
    async fn exhausted_chain_joins_reasons() {
        let router = TranscriptionRouter::new(vec![
            Arc::new(MockProvider::scripted(vec![])),
            Arc::new(MockProvider::scripted(vec![])),
        ]);
        let err = router.transcribe(&[1], "audio/webm").await.unwrap_err();
        assert!(err.joined.contains(" | "));
    }
}
