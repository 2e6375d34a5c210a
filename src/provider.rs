//! The opaque model-completion capability.
//!
//! Everything the core needs from the hosted model is "given a system prompt
//! and message history, return text". `ModelProvider` is the dyn-compatible
//! seam; `HttpModelProvider` is the production implementation over a
//! chat-completions style endpoint. Retry policy lives with callers of the
//! provider, never inside the core (the Router surfaces a single retryable
//! error).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ChatMessage;

/// Errors from the model-call capability.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Model call timed out after {0} seconds")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Model endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Could not parse model response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Timeouts, network faults, and server-side errors are worth retrying;
    /// client-side rejections (4xx) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Parse(_) => false,
        }
    }
}

/// The black-box completion capability consumed by every handler.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<String, ProviderError>;
}

/// HTTP implementation speaking the common chat-completions JSON shape.
pub struct HttpModelProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

impl HttpModelProvider {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs,
        }
    }
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<String, ProviderError> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(WireMessage {
            role: "system",
            content: system_prompt,
        });
        for msg in messages {
            wire.push(WireMessage {
                role: msg.role.as_str(),
                content: &msg.content,
            });
        }

        let body = CompletionRequest {
            model: &self.model,
            messages: wire,
        };

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::time::timeout(Duration::from_secs(self.timeout_secs), request)
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout_secs))?
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Parse("response contained no choices".to_string()))
    }
}
