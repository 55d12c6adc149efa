//! Orchestration: the single-URL parse path and batch parsing.
//!
//! The pipeline owns no business state of its own; it wires the
//! fetcher, cleaner, prompt engine, and provider router together and
//! talks to the persistence and quota collaborators through their
//! contracts. All services are constructed explicitly and injected, so
//! tests build isolated instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::api::{
    BatchData, BatchItemResult, BatchOptions, BatchRequest, Envelope, ErrorBody, ParseData,
    ParseOptions, ParseRequest,
};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::extract::{self, ExtractedContent};
use crate::fetch::{FetchOptions, Fetcher};
use crate::fingerprint::fingerprint;
use crate::limiter::{FetchSlots, OriginGate, TtlCache};
use crate::llm::router::{HealthReport, ProviderRouter, RouterConfig};
use crate::llm::{LlmProvider, SummaryMetadata, SummaryOptions, SummaryResult};
use crate::prompt::{BuiltPrompt, TemplateRegistry};
use crate::storage::{ArticleRecord, ArticleStore, QuotaGate, RecordStatus};

pub struct Pipeline {
    pub(crate) fetcher: Arc<Fetcher>,
    pub(crate) templates: Arc<TemplateRegistry>,
    pub(crate) router: Arc<ProviderRouter>,
    pub(crate) store: Arc<dyn ArticleStore>,
    pub(crate) quota: Arc<dyn QuotaGate>,
    pub(crate) cache: Arc<TtlCache<ParseData>>,
    pub(crate) config: Arc<common::Config>,
}

impl Pipeline {
    /// Wire a pipeline from configuration and injected collaborators.
    pub fn new(
        config: common::Config,
        providers: Vec<Arc<dyn LlmProvider>>,
        store: Arc<dyn ArticleStore>,
        quota: Arc<dyn QuotaGate>,
    ) -> Result<Self> {
        let gate = Arc::new(OriginGate::new(
            config.limiter.min_delay_ms,
            config.limiter.requests_per_minute,
        ));
        let slots = Arc::new(FetchSlots::new(config.limiter.max_concurrent_fetches));
        let fetcher = Arc::new(Fetcher::new(
            config.fetch.clone(),
            config.browser.clone(),
            gate,
            slots,
        )?);
        let router = Arc::new(ProviderRouter::new(
            providers,
            RouterConfig::from(&config.llm),
        ));
        let cache = Arc::new(TtlCache::new(
            config.limiter.cache_ttl_secs,
            config.limiter.cache_max_entries,
        ));

        Ok(Self {
            fetcher,
            templates: Arc::new(TemplateRegistry::builtin()),
            router,
            store,
            quota,
            cache,
            config: Arc::new(config),
        })
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    /// Parse a single URL: fetch, clean, fingerprint, summarize,
    /// persist. Returns the uniform envelope.
    pub async fn parse_url(&self, request: &ParseRequest) -> Envelope<ParseData> {
        let started = Instant::now();
        match self.parse_inner(request).await {
            Ok(data) => Envelope::ok(data, started.elapsed().as_millis() as u64),
            Err(err) => {
                warn!(url = %request.url, kind = err.kind().as_str(), "parse failed: {}", err);
                Envelope::fail(&err, started.elapsed().as_millis() as u64)
            }
        }
    }

    pub(crate) async fn parse_inner(&self, request: &ParseRequest) -> Result<ParseData> {
        let options = &request.options;

        if !self.quota.check_and_increment().await? {
            return Err(PipelineError::QuotaExceeded("parse quota exhausted".into()));
        }

        let cache_key = request.url.trim().to_string();
        if !options.allow_refresh {
            if let Some(mut hit) = self.cache.get(&cache_key) {
                info!(url = %request.url, "serving parse result from cache");
                hit.cached = true;
                return Ok(hit);
            }
        }

        let fetched = self
            .fetcher
            .fetch(&request.url, &fetch_options_from(options))
            .await?;

        // Fail fast on thin pages; the model layer is never invoked.
        let min_chars = self.config.fetch.min_content_chars;
        let raw_chars = fetched.raw_html.trim().chars().count();
        if raw_chars < min_chars {
            return Err(PipelineError::ContentTooShort {
                got: raw_chars,
                min: min_chars,
            });
        }

        let base_url = Url::parse(&fetched.final_url).ok();
        let content = extract::clean_with_url(&fetched.raw_html, base_url.as_ref());
        let cleaned_chars = content.cleaned_text.chars().count();
        if cleaned_chars < min_chars {
            return Err(PipelineError::ContentTooShort {
                got: cleaned_chars,
                min: min_chars,
            });
        }

        let print = fingerprint(&content.title, &content.cleaned_text);
        if !options.allow_refresh && self.store.fingerprint_exists(&print).await? {
            return Err(PipelineError::Duplicate(print));
        }

        let prompt = self.build_prompt(options, &content)?;
        let summary_options = summary_options_from(options);

        let summary = match self
            .router
            .summarize(&content.cleaned_text, &prompt, &summary_options)
            .await
        {
            Ok(result) => result,
            Err(err)
                if options.extractive_fallback && err.kind() != ErrorKind::QuotaExceeded =>
            {
                warn!(
                    url = %request.url,
                    kind = err.kind().as_str(),
                    "model summarization failed, using extractive fallback"
                );
                extractive_result(&content)
            }
            Err(err) => return Err(err),
        };

        let record = ArticleRecord {
            id: Uuid::new_v4(),
            url: fetched.final_url.clone(),
            title: content.title.clone(),
            content: content.cleaned_text.clone(),
            summary: summary.summary.clone(),
            key_points: summary.key_points.clone(),
            tags: Vec::new(),
            language: content.language.clone(),
            tokens_in: summary.metadata.tokens_in,
            tokens_out: summary.metadata.tokens_out,
            cost_estimate: summary.metadata.cost_estimate,
            status: RecordStatus::Completed,
            fingerprint: print.clone(),
            created_at: fetched.fetched_at,
        };
        self.store.upsert(record).await?;

        let data = ParseData {
            url: request.url.clone(),
            final_url: fetched.final_url,
            title: content.title,
            language: content.language,
            word_count: content.word_count,
            reading_time_minutes: content.reading_time_minutes,
            keywords: content.keywords,
            fingerprint: print,
            summary: summary.summary,
            key_points: summary.key_points,
            summary_metadata: summary.metadata,
            cached: false,
        };
        self.cache.insert(&cache_key, data.clone());
        Ok(data)
    }

    fn build_prompt(&self, options: &ParseOptions, content: &ExtractedContent) -> Result<BuiltPrompt> {
        if let Some(custom) = &options.custom_prompt {
            return Ok(TemplateRegistry::custom(
                custom,
                &content.cleaned_text,
                &options.target_language,
            ));
        }

        let mut variables: HashMap<String, Value> = options.template_variables.clone();
        variables.insert("content".to_string(), Value::from(content.cleaned_text.as_str()));
        self.templates
            .build(&options.style, &variables, &options.target_language)
    }

    /// Parse a batch of items with bounded concurrency.
    ///
    /// Items run under an independently sized semaphore. With
    /// `preserve_order`, results are reordered to input order after all
    /// work completes; otherwise they arrive in completion order. With
    /// `continue_on_error`, a failed item is reported and the batch
    /// proceeds; otherwise in-flight work is cancelled while completed
    /// sibling results are kept.
    pub async fn parse_batch(&self, request: &BatchRequest) -> Envelope<BatchData> {
        let started = Instant::now();
        let data = self.run_batch(&request.items, &request.options).await;
        Envelope::ok(data, started.elapsed().as_millis() as u64)
    }

    pub(crate) async fn run_batch(
        &self,
        items: &[ParseRequest],
        options: &BatchOptions,
    ) -> BatchData {
        let concurrency = options
            .concurrency
            .unwrap_or(self.config.llm.batch_concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let mut in_flight = FuturesUnordered::new();
        for (index, item) in items.iter().enumerate() {
            let semaphore = semaphore.clone();
            in_flight.push(async move {
                let _permit = semaphore.acquire().await;
                let outcome = self.parse_inner(item).await;
                (index, item.url.clone(), outcome)
            });
        }

        let mut completed: Vec<(usize, BatchItemResult)> = Vec::new();
        while let Some((index, url, outcome)) = in_flight.next().await {
            let item_result = match outcome {
                Ok(data) => BatchItemResult {
                    url,
                    success: true,
                    data: Some(data),
                    error: None,
                },
                Err(err) => {
                    warn!(url = %url, kind = err.kind().as_str(), "batch item failed: {}", err);
                    BatchItemResult {
                        url,
                        success: false,
                        data: None,
                        error: Some(ErrorBody::from(&err)),
                    }
                }
            };
            let failed = !item_result.success;
            completed.push((index, item_result));

            if failed && !options.continue_on_error {
                // Dropping the stream aborts in-flight items; their
                // permits and fetch slots release on drop. Completed
                // sibling results stay.
                drop(in_flight);
                break;
            }
        }

        if options.preserve_order {
            completed.sort_by_key(|(index, _)| *index);
        }

        let results: Vec<BatchItemResult> =
            completed.into_iter().map(|(_, result)| result).collect();
        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;

        BatchData {
            total: items.len(),
            successful,
            failed,
            results,
        }
    }

    /// Run provider health checks and aggregate the report.
    pub async fn health(&self) -> Envelope<HealthReport> {
        let started = Instant::now();
        let report = self.router.run_health_checks().await;
        Envelope::ok(report, started.elapsed().as_millis() as u64)
    }
}

pub(crate) fn fetch_options_from(options: &ParseOptions) -> FetchOptions {
    FetchOptions {
        timeout_ms: options.timeout_ms,
        user_agent: None,
        render_js: options.render_js,
        viewport: None,
        blocked_resource_types: Vec::new(),
        require_network_idle: options.require_network_idle,
        wait_for_selector: options.wait_for_selector.clone(),
        reject_on_saturation: options.reject_on_saturation,
    }
}

pub(crate) fn summary_options_from(options: &ParseOptions) -> SummaryOptions {
    SummaryOptions {
        style: options.style.clone(),
        target_language: options.target_language.clone(),
        max_output_tokens: options.max_output_tokens,
        custom_prompt: options.custom_prompt.clone(),
        model: options.model.clone(),
    }
}

/// Extractive fallback: selected sentences stand in for the model
/// summary when the provider layer fails and the caller opted in.
pub(crate) fn extractive_result(content: &ExtractedContent) -> SummaryResult {
    let sentences = extract::extractive_summary(&content.cleaned_text, &content.keywords, 5);
    let summary = sentences.join(" ");
    let source_chars = content.cleaned_text.chars().count().max(1);
    let compression_ratio = summary.chars().count() as f64 / source_chars as f64;

    SummaryResult {
        summary,
        key_points: sentences,
        metadata: SummaryMetadata {
            provider_name: "extractive".to_string(),
            model_id: "extractive".to_string(),
            tokens_in: 0,
            tokens_out: 0,
            cost_estimate: 0.0,
            processing_time_ms: 0,
            confidence_score: 0.4,
            compression_ratio,
        },
        success: true,
        error_message: None,
    }
}
