//! OpenAI-compatible chat completion client.

use super::{ChatMessage, CompletionClient, CompletionError};
use crate::credential::{Credential, CredentialValidator};
use async_trait::async_trait;
use relay_common::config::CompletionConfig;
use relay_common::util::{sanitize_for_log, truncate_with_ellipsis};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Longest slice of an upstream error body kept in error messages.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Client for `/v1/chat/completions` on OpenAI or a compatible server.
///
/// The API key is supplied per call, so one client serves every chat.
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: Option<i64>,
    temperature: Option<f64>,
}

impl OpenAiClient {
    pub fn new(config: &CompletionConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Map a non-success HTTP status onto the completion failure classes.
    fn classify(status: StatusCode, body: &str) -> CompletionError {
        let detail = truncate_with_ellipsis(&sanitize_for_log(body), MAX_ERROR_BODY_CHARS);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                CompletionError::Auth(format!("HTTP {status}: {detail}"))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                CompletionError::RateLimit(format!("HTTP {status}: {detail}"))
            }
            _ => CompletionError::Other(format!("HTTP {status}: {detail}")),
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(
        &self,
        credential: &Credential,
        messages: &[ChatMessage],
    ) -> Result<String, CompletionError> {
        let start = Instant::now();
        let request = OpenAIRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(self.url("/v1/chat/completions"))
            .bearer_auth(credential.expose())
            .json(&request)
            .send()
            .await
            .map_err(|e| CompletionError::Other(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, &body));
        }

        let parsed: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Other(format!("Failed to parse response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| CompletionError::Other("Response contained no content".into()))?;

        tracing::debug!(
            model = %self.model,
            latency_ms = start.elapsed().as_millis() as u64,
            total_tokens = parsed.usage.map(|u| u.total_tokens).unwrap_or_default(),
            "Completion received"
        );

        Ok(content)
    }
}

#[async_trait]
impl CredentialValidator for OpenAiClient {
    async fn validate(&self, credential: &Credential) -> bool {
        let result = self
            .client
            .get(self.url("/v1/models"))
            .bearer_auth(credential.expose())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::info!(status = %resp.status(), "Credential rejected by completion API");
                false
            }
            Err(e) => {
                // Transient failures count as rejection; the user can paste the key again.
                tracing::warn!(error = %e, "Credential validation request failed");
                false
            }
        }
    }
}

// ============================================================================
// OpenAI API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    total_tokens: i64,
}
