use super::Provider;
use crate::error::ProviderError;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const HTTP_TIMEOUT_SECS: u64 = 60;
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: ANTHROPIC_API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    async fn messages(
        &self,
        system: Option<&str>,
        content: serde_json::Value,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": [{ "role": "user", "content": content }],
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Network {
                provider: "anthropic",
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                provider: "anthropic",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse =
            response.json().await.map_err(|e| ProviderError::Parse {
                provider: "anthropic",
                detail: e.to_string(),
            })?;
        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            Err(ProviderError::Empty {
                provider: "anthropic",
            })
        } else {
            Ok(text)
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn complete_json(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        // JSON discipline is carried by the system prompt; the response is
        // salvaged downstream if the model wraps it in prose.
        self.messages(Some(system), json!(user), MAX_TOKENS).await
    }

    async fn complete_text(
        &self,
        system: Option<&str>,
        user: &str,
    ) -> Result<String, ProviderError> {
        self.messages(system, json!(user), MAX_TOKENS).await
    }

    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<String, ProviderError> {
        let data = base64::engine::general_purpose::STANDARD.encode(audio);
        let content = json!([
            {
                "type": "input_audio",
                "source": { "type": "base64", "media_type": mime, "data": data }
            },
            {
                "type": "text",
                "text": "Transcribe this audio verbatim. Reply with the spoken words only."
            }
        ]);
        self.messages(None, content, 1024).await
    }

    /// Tiny text round-trip.
    async fn preflight(&self) -> Result<(), ProviderError> {
        self.messages(None, json!("ping"), 8).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_joins_text_blocks_only() {
        let raw = r#"{"content":[
            {"type":"text","text":"hello "},
            {"type":"tool_use"},
            {"type":"text","text":"world"}
        ]}"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        let text: String = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect();
        assert_eq!(text, "hello world");
    }
}
