//! LLM provider abstraction: the provider trait, wire types, model
//! metadata, and the summary request/result shapes shared by the
//! router and the orchestrator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod remote;
pub mod router;

/// Core trait for pluggable summarization backends.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Execute a chat completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Provider name used in logs, metadata, and accounting.
    fn name(&self) -> &str;

    /// Whether this provider serves the given model.
    fn supports_model(&self, model: &str) -> bool;

    /// Lightweight synthetic check that the provider is reachable.
    async fn health_check(&self) -> bool;
}

/// Request for a single model call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub timeout: Duration,
}

/// Response from a model call.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: usize,
    pub tokens_out: usize,
}

/// Summarization options, carried from the inbound request.
#[derive(Debug, Clone)]
pub struct SummaryOptions {
    pub style: String,
    pub target_language: String,
    pub max_output_tokens: usize,
    pub custom_prompt: Option<String>,
    pub model: Option<String>,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            style: "concise".to_string(),
            target_language: "auto".to_string(),
            max_output_tokens: 500,
            custom_prompt: None,
            model: None,
        }
    }
}

/// Metadata attached to every summary result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryMetadata {
    pub provider_name: String,
    pub model_id: String,
    pub tokens_in: usize,
    pub tokens_out: usize,
    pub cost_estimate: f64,
    pub processing_time_ms: u64,
    pub confidence_score: f64,
    pub compression_ratio: f64,
}

/// Structured summarization outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    pub summary: String,
    pub key_points: Vec<String>,
    pub metadata: SummaryMetadata,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Lifecycle of a summarization job: pending → processing →
/// {completed | failed}. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether a transition to `next` is legal.
    pub fn can_advance(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, JobState::Processing) => true,
            (JobState::Processing, JobState::Completed | JobState::Failed) => true,
            _ => false,
        }
    }
}

/// Static model metadata: pricing per 1k tokens (USD) and the safe
/// context window used by the pre-flight guard.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub id: &'static str,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    pub context_window: usize,
}

const MODEL_SPECS: &[ModelSpec] = &[
    ModelSpec {
        id: "gpt-4o-mini",
        input_cost_per_1k: 0.000_15,
        output_cost_per_1k: 0.000_6,
        context_window: 128_000,
    },
    ModelSpec {
        id: "gpt-4o",
        input_cost_per_1k: 0.002_5,
        output_cost_per_1k: 0.01,
        context_window: 128_000,
    },
    ModelSpec {
        id: "gpt-3.5-turbo",
        input_cost_per_1k: 0.000_5,
        output_cost_per_1k: 0.001_5,
        context_window: 16_000,
    },
    ModelSpec {
        id: "claude-3-haiku",
        input_cost_per_1k: 0.000_25,
        output_cost_per_1k: 0.001_25,
        context_window: 200_000,
    },
];

/// Conservative default for models not in the table.
const FALLBACK_SPEC: ModelSpec = ModelSpec {
    id: "unknown",
    input_cost_per_1k: 0.001,
    output_cost_per_1k: 0.002,
    context_window: 16_000,
};

pub fn model_spec(model: &str) -> ModelSpec {
    MODEL_SPECS
        .iter()
        .find(|spec| spec.id == model)
        .cloned()
        .unwrap_or(FALLBACK_SPEC)
}

/// Rough token estimate: ~4 chars per token for alphabetic scripts,
/// ~2 chars per token for CJK-heavy text.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    let cjk = text
        .chars()
        .filter(|c| matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3040}'..='\u{30FF}' | '\u{AC00}'..='\u{D7AF}'))
        .count();
    if cjk * 2 > chars {
        chars / 2 + 1
    } else {
        chars / 4 + 1
    }
}

/// Estimated cost in USD for a call with the given token counts.
pub fn estimate_cost(model: &str, tokens_in: usize, tokens_out: usize) -> f64 {
    let spec = model_spec(model);
    (tokens_in as f64 / 1000.0) * spec.input_cost_per_1k
        + (tokens_out as f64 / 1000.0) * spec.output_cost_per_1k
}

/// Helper to extract JSON from text that might contain markdown
/// backticks or preamble.
pub fn extract_json_from_text(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return Some(text[start..=end].to_string());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_transitions() {
        assert!(JobState::Pending.can_advance(JobState::Processing));
        assert!(JobState::Processing.can_advance(JobState::Completed));
        assert!(JobState::Processing.can_advance(JobState::Failed));
        // Terminal states are final
        assert!(!JobState::Completed.can_advance(JobState::Processing));
        assert!(!JobState::Failed.can_advance(JobState::Pending));
        assert!(!JobState::Pending.can_advance(JobState::Completed));
    }

    #[test]
    fn token_estimate_scales_with_script() {
        assert_eq!(estimate_tokens(""), 0);
        let latin = "a".repeat(400);
        assert_eq!(estimate_tokens(&latin), 101);
        let cjk = "字".repeat(400);
        assert_eq!(estimate_tokens(&cjk), 201);
    }

    #[test]
    fn cost_estimate_uses_model_pricing() {
        let cost = estimate_cost("gpt-4o-mini", 1000, 1000);
        assert!((cost - 0.000_75).abs() < 1e-9);
        // Unknown models use the conservative fallback
        let fallback = estimate_cost("mystery-model", 1000, 0);
        assert!((fallback - 0.001).abs() < 1e-9);
    }

    #[test]
    fn extracts_json_from_fenced_block() {
        let text = "Here you go:\n```json\n{\"summary\": \"ok\"}\n```";
        assert_eq!(extract_json_from_text(text).as_deref(), Some("{\"summary\": \"ok\"}"));

        let bare = "prefix {\"a\": 1} suffix";
        assert_eq!(extract_json_from_text(bare).as_deref(), Some("{\"a\": 1}"));

        assert!(extract_json_from_text("no json here").is_none());
    }
}
