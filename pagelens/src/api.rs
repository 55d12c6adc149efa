//! Inbound request types and the uniform response envelope.
//!
//! Every entry point returns `Envelope<T>`: success flag, data or a
//! structured error with a machine-checkable kind, and timing
//! metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorKind, PipelineError};
use crate::llm::SummaryMetadata;

/// Options for a single-URL parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    /// Prompt style id (see the template registry)
    pub style: String,
    /// "auto" keeps the source language; anything else instructs the
    /// model explicitly
    pub target_language: String,
    pub max_output_tokens: usize,
    /// Bypasses the template engine entirely when set
    pub custom_prompt: Option<String>,
    /// Model override; the configured default applies otherwise
    pub model: Option<String>,
    /// Extra template variables (validated against the template)
    pub template_variables: HashMap<String, Value>,
    /// Force the browser-automation fetch strategy
    pub render_js: bool,
    pub require_network_idle: bool,
    pub wait_for_selector: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Re-summarize even when the fingerprint is already in history
    pub allow_refresh: bool,
    /// Fall back to an extractive summary when the model layer fails
    pub extractive_fallback: bool,
    /// Fail instead of queueing when fetch capacity is saturated
    pub reject_on_saturation: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            style: "concise".to_string(),
            target_language: "auto".to_string(),
            max_output_tokens: 500,
            custom_prompt: None,
            model: None,
            template_variables: HashMap::new(),
            render_js: false,
            require_network_idle: false,
            wait_for_selector: None,
            timeout_ms: None,
            allow_refresh: false,
            extractive_fallback: false,
            reject_on_saturation: false,
        }
    }
}

/// Single-URL parse request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseRequest {
    pub url: String,
    #[serde(default)]
    pub options: ParseOptions,
}

impl ParseRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: ParseOptions::default(),
        }
    }
}

/// Batch behavior options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Report failed items and keep going instead of aborting the batch
    pub continue_on_error: bool,
    /// Reorder results to match input order after all work completes
    pub preserve_order: bool,
    /// Overrides the configured batch concurrency when set
    pub concurrency: Option<usize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            preserve_order: false,
            concurrency: None,
        }
    }
}

/// Batch request: explicit items or configured crawl sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchRequest {
    pub items: Vec<ParseRequest>,
    pub source_ids: Vec<String>,
    pub options: BatchOptions,
}

/// Structured error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for ErrorBody {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub request_id: Uuid,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Uniform response envelope for all entry points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
    pub metadata: EnvelopeMeta,
}

impl<T> Envelope<T> {
    pub fn ok(data: T, processing_time_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: EnvelopeMeta {
                request_id: Uuid::new_v4(),
                processing_time_ms,
                timestamp: Utc::now(),
            },
        }
    }

    pub fn fail(err: &PipelineError, processing_time_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody::from(err)),
            metadata: EnvelopeMeta {
                request_id: Uuid::new_v4(),
                processing_time_ms,
                timestamp: Utc::now(),
            },
        }
    }
}

/// Result payload of a single-URL parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseData {
    pub url: String,
    pub final_url: String,
    pub title: String,
    pub language: String,
    pub word_count: usize,
    pub reading_time_minutes: u32,
    pub keywords: Vec<String>,
    pub fingerprint: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub summary_metadata: SummaryMetadata,
    /// True when served from the result cache
    pub cached: bool,
}

/// One item's outcome within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub url: String,
    pub success: bool,
    pub data: Option<ParseData>,
    pub error: Option<ErrorBody>,
}

/// Batch payload: totals always accompany per-item results so partial
/// failures never mask successes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchData {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BatchItemResult>,
}

/// Per-source crawl accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub found: usize,
    pub new: usize,
    pub saved: usize,
    pub errored: usize,
    pub errors: Vec<ErrorBody>,
}

/// Crawl payload across all requested sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlData {
    pub sources: Vec<SourceReport>,
    pub total_found: usize,
    pub total_new: usize,
    pub total_saved: usize,
    pub total_errored: usize,
}
