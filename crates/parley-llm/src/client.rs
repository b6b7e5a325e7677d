use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use parley_core::messages::ChatMessage;

use crate::models::{ChatCompletionRequest, ChatCompletionResponse};

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Why a completion call produced no model content.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("no API credential configured")]
    NoCredential,
    #[error("upstream returned {status} {status_text}")]
    Http {
        status: u16,
        status_text: String,
        body: String,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned no content")]
    Empty,
}

/// The seam between the reply pipeline and whatever produces assistant
/// text: the real OpenRouter client in production, a scripted mock in tests.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, CompletionError>;
}

pub struct OpenRouterClient {
    client: Client,
    api_key: Option<SecretString>,
    base_url: String,
}

impl OpenRouterClient {
    /// A client without a key still constructs; every call then reports
    /// `NoCredential` so callers can degrade to a canned reply.
    pub fn new(api_key: Option<SecretString>) -> Self {
        Self::with_base_url(api_key, OPENROUTER_BASE_URL)
    }

    /// Point the client at a different endpoint. Tests use this to stand up
    /// a local stand-in for the real service.
    pub fn with_base_url(api_key: Option<SecretString>, base_url: impl Into<String>) -> Self {
        Self::with_timeouts(api_key, base_url, CONNECT_TIMEOUT, REQUEST_TIMEOUT)
    }

    /// Override the transport timeouts. A call that exceeds them reports
    /// `Network`, the same as an unreachable host.
    pub fn with_timeouts(
        api_key: Option<SecretString>,
        base_url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(connect_timeout)
                .timeout(request_timeout)
                .build()
                .expect("failed to build HTTP client"),
            api_key,
            base_url: base_url.into(),
        }
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl CompletionClient for OpenRouterClient {
    #[instrument(skip(self, messages), fields(model = %model, message_count = messages.len()))]
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, CompletionError> {
        let Some(key) = &self.api_key else {
            return Err(CompletionError::NoCredential);
        };

        let body = ChatCompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Http {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                body,
            });
        }

        // An unparseable body reads as an empty response, not a hard error.
        let parsed: ChatCompletionResponse = resp.json().await.unwrap_or_default();
        match parsed.content() {
            Some(content) => Ok(content.to_string()),
            None => Err(CompletionError::Empty),
        }
    }
}
