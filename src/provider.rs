use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub api_key: String,
    pub system: String,
    pub user: String,
}

/// Black-box text-completion service. The engine treats any error the same
/// way: no answer, fall back.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError>;
}

/// Chat-completions provider speaking the OpenAI wire shape. The base URL is
/// configurable so tests and self-hosted gateways can stand in.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, base_url: &str) -> OpenAiProvider {
        OpenAiProvider {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError> {
        if request.api_key.trim().is_empty() {
            return Err(ProviderError::NotConfigured(
                "no API key for owner".to_string(),
            ));
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(request.api_key.trim())
            .json(&json!({
                "model": request.model,
                "messages": [
                    { "role": "system", "content": request.system },
                    { "role": "user", "content": request.user }
                ],
                "temperature": 0.1
            }))
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| ProviderError::Request(format!("parse failed: {err}")))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(ProviderError::EmptyCompletion);
        }
        Ok(text)
    }
}
