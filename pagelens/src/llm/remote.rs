//! OpenAI-compatible remote provider.
//!
//! Speaks the chat-completions wire format over HTTP and classifies
//! transport and API failures into the pipeline error taxonomy, so the
//! router can decide retry vs failover without inspecting messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CompletionRequest, CompletionResponse, LlmProvider};
use crate::error::{PipelineError, Result};

/// Remote LLM provider using an OpenAI-compatible HTTP API.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    client: reqwest::Client,
    default_timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            models: Vec::new(),
            client: reqwest::Client::new(),
            default_timeout: Duration::from_secs(30),
        }
    }

    /// Restrict the provider to a set of model ids. Empty means "any".
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Derive the models listing endpoint from the chat endpoint,
    /// e.g. .../v1/chat/completions -> .../v1/models
    fn models_url(&self) -> String {
        if self.base_url.ends_with("/chat/completions") {
            self.base_url.replace("/chat/completions", "/models")
        } else if self.base_url.ends_with("/v1") {
            format!("{}/models", self.base_url)
        } else {
            format!("{}/models", self.base_url.trim_end_matches('/'))
        }
    }

    /// Map an unsuccessful HTTP response to a classified error.
    fn classify_status(&self, status: reqwest::StatusCode, body: &str) -> PipelineError {
        let code = status.as_u16();
        match code {
            429 => PipelineError::RateLimited(format!("{}: rate limited by API", self.name)),
            401 | 403 => PipelineError::ProviderUnavailable(format!(
                "{}: credentials rejected ({code})",
                self.name
            )),
            400 | 413 if is_context_overflow(body) => PipelineError::ContentTooLong {
                estimated: 0,
                limit: 0,
            },
            code if code >= 500 => PipelineError::UpstreamModel {
                message: format!("{}: server error {code}: {body}", self.name),
                transient: true,
            },
            _ => PipelineError::UpstreamModel {
                message: format!("{}: API error {code}: {body}", self.name),
                transient: false,
            },
        }
    }
}

fn is_context_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context_length") || lower.contains("maximum context") || lower.contains("too long")
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let req_body = ChatRequest {
            model: request.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
        };

        let timeout = if request.timeout.is_zero() {
            self.default_timeout
        } else {
            request.timeout
        };

        let response = tokio::time::timeout(
            timeout,
            self.client
                .post(&self.base_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&req_body)
                .send(),
        )
        .await
        .map_err(|_| {
            PipelineError::Network(format!(
                "{}: model call timed out after {}ms",
                self.name,
                timeout.as_millis()
            ))
        })??;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, &body));
        }

        let resp_body: ChatResponse = response.json().await.map_err(|e| {
            PipelineError::UpstreamModel {
                message: format!("{}: failed to parse completion response: {e}", self.name),
                transient: false,
            }
        })?;

        let choice = resp_body
            .choices
            .first()
            .ok_or_else(|| PipelineError::UpstreamModel {
                message: format!("{}: completion response has no choices", self.name),
                transient: false,
            })?;

        Ok(CompletionResponse {
            content: choice.message.content.clone(),
            model: resp_body.model.unwrap_or_else(|| request.model.clone()),
            tokens_in: resp_body.usage.prompt_tokens.unwrap_or(0),
            tokens_out: resp_body.usage.completion_tokens.unwrap_or(0),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    async fn health_check(&self) -> bool {
        let url = self.models_url();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            self.client
                .get(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .send(),
        )
        .await;

        match result {
            Ok(Ok(response)) => {
                let healthy = response.status().is_success();
                debug!(provider = %self.name, healthy, "health check completed");
                healthy
            }
            _ => {
                debug!(provider = %self.name, "health check failed to reach endpoint");
                false
            }
        }
    }
}

// OpenAI chat-completions wire structures
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
}
