use super::Provider;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const HTTP_TIMEOUT_SECS: u64 = 60;

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    transcription_model: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatRequestMessage<'a>>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatRequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, model: &str, transcription_model: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            transcription_model: transcription_model.to_string(),
            base_url: OPENAI_API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    async fn chat(
        &self,
        system: Option<&str>,
        user: &str,
        json_mode: bool,
    ) -> Result<String, ProviderError> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatRequestMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatRequestMessage {
            role: "user",
            content: user,
        });

        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: 0.2,
            response_format: json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|source| ProviderError::Network {
                provider: "openai",
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                provider: "openai",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::Parse {
                    provider: "openai",
                    detail: e.to_string(),
                })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(ProviderError::Empty { provider: "openai" })
    }
}

/// Pick a multipart filename extension for a normalized MIME type.
pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/wav" => "wav",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "mp4",
        _ => "webm",
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete_json(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        self.chat(Some(system), user, true).await
    }

    async fn complete_text(
        &self,
        system: Option<&str>,
        user: &str,
    ) -> Result<String, ProviderError> {
        self.chat(system, user, false).await
    }

    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<String, ProviderError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(format!("audio.{}", extension_for_mime(mime)))
            .mime_str(mime)
            .map_err(|e| ProviderError::Parse {
                provider: "openai",
                detail: e.to_string(),
            })?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.transcription_model.clone())
            .text("response_format", "json")
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|source| ProviderError::Network {
                provider: "openai",
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                provider: "openai",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TranscriptionResponse =
            response.json().await.map_err(|e| ProviderError::Parse {
                provider: "openai",
                detail: e.to_string(),
            })?;
        Ok(parsed.text)
    }

    /// Whisper probe: model metadata lookup.
    async fn preflight(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(format!(
                "{}/models/{}",
                self.base_url, self.transcription_model
            ))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|source| ProviderError::Network {
                provider: "openai",
                source,
            })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProviderError::Http {
                provider: "openai",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}
