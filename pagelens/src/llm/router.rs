//! Provider selection, failover, retries, health tracking, and
//! cost/usage accounting.
//!
//! The router owns the only mutable cross-request state in the LLM
//! layer: per-provider health and running usage totals. Both live
//! behind async locks and every increment-and-check happens under a
//! single write acquisition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{
    estimate_cost, estimate_tokens, extract_json_from_text, model_spec, CompletionRequest,
    CompletionResponse, JobState, LlmProvider, SummaryMetadata, SummaryOptions, SummaryResult,
};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::fetch::backoff_delay;
use crate::prompt::BuiltPrompt;

/// Provider health, driven by consecutive-error thresholds and
/// periodic checks: Available → Degraded (≥3) → Unavailable (≥5) →
/// Available (successful call or health check).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Available,
    Degraded,
    Unavailable,
}

const DEGRADED_THRESHOLD: u32 = 3;
const UNAVAILABLE_THRESHOLD: u32 = 5;

/// Per-provider state. Mutated only by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderState {
    pub health: ProviderHealth,
    pub consecutive_errors: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            health: ProviderHealth::Available,
            consecutive_errors: 0,
            total_requests: 0,
            successful_requests: 0,
        }
    }
}

/// Running totals for one model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

/// Usage snapshot returned by `usage_report`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageReport {
    pub by_model: HashMap<String, ModelUsage>,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    pub cost_today: f64,
}

struct UsageInner {
    by_model: HashMap<String, ModelUsage>,
    errors_by_kind: HashMap<ErrorKind, u64>,
    day: NaiveDate,
    cost_today: f64,
}

impl UsageInner {
    fn new() -> Self {
        Self {
            by_model: HashMap::new(),
            errors_by_kind: HashMap::new(),
            day: Utc::now().date_naive(),
            cost_today: 0.0,
        }
    }

    /// Daily spend resets at UTC midnight.
    fn roll_day(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.day {
            self.day = today;
            self.cost_today = 0.0;
        }
    }
}

/// Overall service health aggregated from per-provider checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthEntry {
    pub name: String,
    pub reachable: bool,
    pub state: ProviderState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: OverallHealth,
    pub providers: Vec<ProviderHealthEntry>,
}

/// Router tunables, taken from the named configuration object.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_provider: String,
    pub default_model: String,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub per_request_cost_ceiling: f64,
    pub per_day_cost_ceiling: f64,
}

impl From<&common::LlmConfig> for RouterConfig {
    fn from(cfg: &common::LlmConfig) -> Self {
        Self {
            default_provider: cfg.default_provider.clone(),
            default_model: cfg.default_model.clone(),
            max_retries: cfg.max_retries,
            backoff_base_ms: cfg.backoff_base_ms,
            per_request_cost_ceiling: cfg.per_request_cost_ceiling,
            per_day_cost_ceiling: cfg.per_day_cost_ceiling,
        }
    }
}

/// Routes summarization requests across providers.
///
/// Constructed explicitly and passed by reference to call sites, so
/// tests build isolated instances with their own state.
pub struct ProviderRouter {
    providers: Vec<Arc<dyn LlmProvider>>,
    states: RwLock<HashMap<String, ProviderState>>,
    usage: RwLock<UsageInner>,
    config: RouterConfig,
}

impl ProviderRouter {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, config: RouterConfig) -> Self {
        Self {
            providers,
            states: RwLock::new(HashMap::new()),
            usage: RwLock::new(UsageInner::new()),
            config,
        }
    }

    /// Summarize content with an already-built prompt.
    ///
    /// Pre-flight guards run before any network call; retryable errors
    /// are retried per provider with exponential backoff; exhausted or
    /// provider-level failures fail over to the next candidate.
    pub async fn summarize(
        &self,
        content: &str,
        prompt: &BuiltPrompt,
        options: &SummaryOptions,
    ) -> Result<SummaryResult> {
        let started = Instant::now();
        let mut job = JobState::Pending;
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());

        self.preflight(&model, prompt, options).await?;

        debug_assert!(job.can_advance(JobState::Processing));
        job = JobState::Processing;

        let candidates = self.candidates(&model).await;
        if candidates.is_empty() {
            self.count_error(ErrorKind::ProviderUnavailable).await;
            return Err(PipelineError::ProviderUnavailable(
                "no provider available".to_string(),
            ));
        }

        let mut last_err = None;
        for (provider, model_id) in candidates {
            match self
                .call_with_retries(provider.as_ref(), &model_id, prompt, options)
                .await
            {
                Ok(response) => {
                    self.record_success(provider.name(), &response).await;
                    debug_assert!(job.can_advance(JobState::Completed));
                    job = JobState::Completed;
                    debug_assert!(job.is_terminal());
                    let mut result = build_summary_result(response, content, started);
                    result.metadata.provider_name = provider.name().to_string();
                    return Ok(result);
                }
                Err(err) => {
                    self.record_failure(provider.name(), &err).await;
                    // Errors caused by the request itself will fail on
                    // every provider; do not fail over.
                    if matches!(
                        err.kind(),
                        ErrorKind::ContentTooLong | ErrorKind::QuotaExceeded | ErrorKind::InvalidInput
                    ) {
                        return Err(err);
                    }
                    warn!(
                        provider = provider.name(),
                        error = %err,
                        "provider failed, trying next candidate"
                    );
                    last_err = Some(err);
                }
            }
        }

        debug_assert!(job.can_advance(JobState::Failed));
        Err(last_err
            .unwrap_or_else(|| PipelineError::ProviderUnavailable("no provider available".into())))
    }

    /// Cost and context-window guards. Rejections here make zero
    /// network calls.
    async fn preflight(
        &self,
        model: &str,
        prompt: &BuiltPrompt,
        options: &SummaryOptions,
    ) -> Result<()> {
        let spec = model_spec(model);
        let estimated_in =
            estimate_tokens(&prompt.system_prompt) + estimate_tokens(&prompt.user_prompt);

        if estimated_in + options.max_output_tokens > spec.context_window {
            self.count_error(ErrorKind::ContentTooLong).await;
            return Err(PipelineError::ContentTooLong {
                estimated: estimated_in + options.max_output_tokens,
                limit: spec.context_window,
            });
        }

        let estimated_cost = estimate_cost(model, estimated_in, options.max_output_tokens);
        if estimated_cost > self.config.per_request_cost_ceiling {
            self.count_error(ErrorKind::QuotaExceeded).await;
            return Err(PipelineError::QuotaExceeded(format!(
                "estimated cost ${estimated_cost:.4} exceeds per-request ceiling ${:.4}",
                self.config.per_request_cost_ceiling
            )));
        }

        let mut usage = self.usage.write().await;
        usage.roll_day();
        if usage.cost_today + estimated_cost > self.config.per_day_cost_ceiling {
            usage
                .errors_by_kind
                .entry(ErrorKind::QuotaExceeded)
                .and_modify(|c| *c += 1)
                .or_insert(1);
            return Err(PipelineError::QuotaExceeded(format!(
                "daily spend ${:.4} + request ${estimated_cost:.4} exceeds ceiling ${:.4}",
                usage.cost_today, self.config.per_day_cost_ceiling
            )));
        }
        Ok(())
    }

    /// Ordered candidate list in registration order: providers that
    /// are not Unavailable and support the requested model (Degraded
    /// providers stay selectable), falling back to the default
    /// provider/model pair.
    async fn candidates(&self, model: &str) -> Vec<(Arc<dyn LlmProvider>, String)> {
        let states = self.states.read().await;
        let health_of = |name: &str| {
            states
                .get(name)
                .map(|s| s.health)
                .unwrap_or(ProviderHealth::Available)
        };

        let mut out: Vec<(Arc<dyn LlmProvider>, String)> = Vec::new();
        for provider in &self.providers {
            if health_of(provider.name()) == ProviderHealth::Unavailable {
                continue;
            }
            if provider.supports_model(model) {
                out.push((provider.clone(), model.to_string()));
            }
        }

        if out.is_empty() {
            for provider in &self.providers {
                if provider.name() == self.config.default_provider
                    && health_of(provider.name()) != ProviderHealth::Unavailable
                    && provider.supports_model(&self.config.default_model)
                {
                    out.push((provider.clone(), self.config.default_model.clone()));
                }
            }
        }

        out
    }

    async fn call_with_retries(
        &self,
        provider: &dyn LlmProvider,
        model: &str,
        prompt: &BuiltPrompt,
        options: &SummaryOptions,
    ) -> Result<CompletionResponse> {
        let request = CompletionRequest {
            system: prompt.system_prompt.clone(),
            user: prompt.user_prompt.clone(),
            model: model.to_string(),
            max_tokens: options.max_output_tokens,
            temperature: 0.5,
            timeout: std::time::Duration::ZERO,
        };

        let mut attempt = 0u32;
        loop {
            match provider.complete(&request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(self.config.backoff_base_ms, attempt);
                    warn!(
                        provider = provider.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable model error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn record_success(&self, provider_name: &str, response: &CompletionResponse) {
        {
            let mut states = self.states.write().await;
            let state = states.entry(provider_name.to_string()).or_default();
            state.total_requests += 1;
            state.successful_requests += 1;
            state.consecutive_errors = 0;
            if state.health != ProviderHealth::Available {
                info!(provider = provider_name, "provider restored to available");
                state.health = ProviderHealth::Available;
            }
        }

        let mut usage = self.usage.write().await;
        usage.roll_day();
        let cost = estimate_cost(&response.model, response.tokens_in, response.tokens_out);
        let entry = usage.by_model.entry(response.model.clone()).or_default();
        entry.requests += 1;
        entry.tokens_in += response.tokens_in as u64;
        entry.tokens_out += response.tokens_out as u64;
        entry.cost += cost;
        usage.cost_today += cost;
    }

    async fn record_failure(&self, provider_name: &str, err: &PipelineError) {
        self.count_error(err.kind()).await;

        // Request-shaped errors are not evidence against the provider.
        if matches!(
            err.kind(),
            ErrorKind::ContentTooLong | ErrorKind::QuotaExceeded | ErrorKind::InvalidInput
        ) {
            return;
        }

        let mut states = self.states.write().await;
        let state = states.entry(provider_name.to_string()).or_default();
        state.total_requests += 1;
        state.consecutive_errors += 1;
        let new_health = if state.consecutive_errors >= UNAVAILABLE_THRESHOLD {
            ProviderHealth::Unavailable
        } else if state.consecutive_errors >= DEGRADED_THRESHOLD {
            ProviderHealth::Degraded
        } else {
            ProviderHealth::Available
        };
        if new_health != state.health {
            warn!(
                provider = provider_name,
                consecutive_errors = state.consecutive_errors,
                ?new_health,
                "provider health transition"
            );
            state.health = new_health;
        }
    }

    async fn count_error(&self, kind: ErrorKind) {
        let mut usage = self.usage.write().await;
        usage
            .errors_by_kind
            .entry(kind)
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    /// Run the synthetic health check on every provider and aggregate.
    /// A passing check restores an Unavailable provider.
    pub async fn run_health_checks(&self) -> HealthReport {
        let mut entries = Vec::new();
        let mut reachable_count = 0usize;

        for provider in &self.providers {
            let reachable = provider.health_check().await;
            let mut states = self.states.write().await;
            let state = states.entry(provider.name().to_string()).or_default();
            if reachable {
                reachable_count += 1;
                if state.health == ProviderHealth::Unavailable {
                    info!(provider = provider.name(), "health check restored provider");
                    state.health = ProviderHealth::Available;
                    state.consecutive_errors = 0;
                }
            } else {
                state.health = ProviderHealth::Unavailable;
            }
            entries.push(ProviderHealthEntry {
                name: provider.name().to_string(),
                reachable,
                state: state.clone(),
            });
        }

        let status = if entries.is_empty() || reachable_count == 0 {
            OverallHealth::Unhealthy
        } else if reachable_count == entries.len() {
            OverallHealth::Healthy
        } else {
            OverallHealth::Degraded
        };

        HealthReport {
            status,
            providers: entries,
        }
    }

    /// Snapshot of per-provider state.
    pub async fn provider_states(&self) -> HashMap<String, ProviderState> {
        self.states.read().await.clone()
    }

    /// Snapshot of usage totals and error counters.
    pub async fn usage_report(&self) -> UsageReport {
        let usage = self.usage.read().await;
        UsageReport {
            by_model: usage.by_model.clone(),
            errors_by_kind: usage.errors_by_kind.clone(),
            cost_today: usage.cost_today,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryJson {
    summary: String,
    #[serde(default)]
    key_points: Vec<String>,
}

/// Turn a raw completion into the structured summary result, parsing
/// the strict-JSON payload with a tolerant fallback.
fn build_summary_result(
    response: CompletionResponse,
    source_content: &str,
    started: Instant,
) -> SummaryResult {
    let parsed = extract_json_from_text(&response.content)
        .and_then(|json| serde_json::from_str::<SummaryJson>(&json).ok());

    let (summary, key_points, confidence) = match parsed {
        Some(data) => {
            let confidence = if data.key_points.is_empty() { 0.7 } else { 0.9 };
            (data.summary, data.key_points, confidence)
        }
        None => {
            warn!("model output was not valid summary JSON, using raw text");
            (response.content.trim().to_string(), Vec::new(), 0.3)
        }
    };

    let tokens_in = if response.tokens_in > 0 {
        response.tokens_in
    } else {
        estimate_tokens(source_content)
    };
    let tokens_out = if response.tokens_out > 0 {
        response.tokens_out
    } else {
        estimate_tokens(&summary)
    };

    let source_chars = source_content.chars().count().max(1);
    let compression_ratio = summary.chars().count() as f64 / source_chars as f64;

    SummaryResult {
        summary,
        key_points,
        metadata: SummaryMetadata {
            provider_name: String::new(),
            model_id: response.model.clone(),
            tokens_in,
            tokens_out,
            cost_estimate: estimate_cost(&response.model, tokens_in, tokens_out),
            processing_time_ms: started.elapsed().as_millis() as u64,
            confidence_score: confidence,
            compression_ratio,
        },
        success: true,
        error_message: None,
    }
}
