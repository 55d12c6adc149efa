//! Page retrieval.
//!
//! Two strategies: a lightweight no-script HTTP path and a
//! browser-automation path for pages that need client-side rendering.
//! Transient failures retry with bounded exponential backoff; invalid
//! URLs, blocked domains and non-429 4xx responses fail immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::BrowserRenderer;
use crate::error::{PipelineError, Result};
use crate::limiter::{origin_of, FetchSlots, OriginGate};

/// Result of one fetch. Immutable, created once per fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub url: String,
    /// URL after redirects; distinct from the requested URL.
    pub final_url: String,
    pub status_code: u16,
    pub raw_html: String,
    pub response_headers: HashMap<String, String>,
    pub fetched_at: DateTime<Utc>,
}

/// Per-request fetch options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Overrides the configured timeout when set
    pub timeout_ms: Option<u64>,
    /// Overrides the configured User-Agent when set
    pub user_agent: Option<String>,
    /// Force the browser-automation strategy
    pub render_js: bool,
    /// Requested viewport; honored at browser launch, a differing
    /// per-request value is ignored (the browser instance is shared)
    pub viewport: Option<(u32, u32)>,
    /// Resource types to skip while rendering ("image" is honored)
    pub blocked_resource_types: Vec<String>,
    /// Wait for network idle before reading the rendered page
    pub require_network_idle: bool,
    /// Wait until this CSS selector appears before reading the page
    pub wait_for_selector: Option<String>,
    /// Fail with RateLimited instead of queueing when fetch capacity
    /// is saturated
    pub reject_on_saturation: bool,
}

impl FetchOptions {
    fn wants_browser(&self) -> bool {
        self.render_js || self.require_network_idle || self.wait_for_selector.is_some()
    }
}

/// Exponential backoff with jitter: base * 2^attempt plus up to half
/// the base, capped at 30s.
pub(crate) fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let base = base_ms.max(1);
    let exp = base.saturating_mul(1u64 << attempt.min(16));
    let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
    Duration::from_millis(exp.saturating_add(jitter).min(30_000))
}

/// Page fetcher with per-origin politeness and a global concurrency
/// bound. Construct once and share; the reqwest client pools
/// connections internally.
pub struct Fetcher {
    client: Client,
    gate: Arc<OriginGate>,
    slots: Arc<FetchSlots>,
    browser: Arc<BrowserRenderer>,
    config: common::FetchConfig,
}

impl Fetcher {
    pub fn new(
        config: common::FetchConfig,
        browser_config: common::BrowserConfig,
        gate: Arc<OriginGate>,
        slots: Arc<FetchSlots>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PipelineError::Internal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            gate,
            slots,
            browser: Arc::new(BrowserRenderer::new(browser_config)),
            config,
        })
    }

    /// Fetch a page, choosing the HTTP or browser strategy from the
    /// options. Holds a global fetch slot for the duration; the slot
    /// is released on every exit path including cancellation.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult> {
        let parsed = self.validate_url(url)?;
        let origin = origin_of(&parsed);

        let _permit = if options.reject_on_saturation {
            self.slots.try_acquire()?
        } else {
            self.slots.acquire().await?
        };

        let max_retries = self.config.max_retries;
        let mut last_error: Option<PipelineError> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = backoff_delay(self.config.backoff_base_ms, attempt - 1);
                info!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
                tokio::time::sleep(delay).await;
            }

            self.gate.wait_and_reserve(&origin).await;

            let result = if options.wants_browser() {
                self.browser.fetch_rendered(url, options).await
            } else {
                self.http_fetch(&parsed, options).await
            };

            match result {
                Ok(fetched) => return Ok(fetched),
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    warn!(url, attempt, error = %err, "transient fetch failure");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error
            .unwrap_or_else(|| PipelineError::Network(format!("fetch failed for {url}"))))
    }

    /// Typed extraction contract for rendered pages: CSS selectors in,
    /// text fields out. No arbitrary script evaluation.
    pub async fn extract_rendered_fields(
        &self,
        url: &str,
        selectors: &[String],
        options: &FetchOptions,
    ) -> Result<HashMap<String, String>> {
        let parsed = self.validate_url(url)?;
        let origin = origin_of(&parsed);
        let _permit = self.slots.acquire().await?;
        self.gate.wait_and_reserve(&origin).await;
        self.browser.extract_fields(url, selectors, options).await
    }

    fn validate_url(&self, url: &str) -> Result<Url> {
        let parsed = Url::parse(url)
            .map_err(|e| PipelineError::InvalidInput(format!("invalid URL '{url}': {e}")))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PipelineError::InvalidInput(format!(
                "unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| PipelineError::InvalidInput(format!("URL '{url}' has no host")))?;

        for blocked in &self.config.blocked_domains {
            if host == blocked || host.ends_with(&format!(".{blocked}")) {
                return Err(PipelineError::InvalidInput(format!(
                    "domain '{host}' is blocked"
                )));
            }
        }

        Ok(parsed)
    }

    async fn http_fetch(&self, url: &Url, options: &FetchOptions) -> Result<FetchResult> {
        let mut request = self.client.get(url.clone());
        if let Some(timeout_ms) = options.timeout_ms {
            request = request.timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(agent) = &options.user_agent {
            request = request.header(reqwest::header::USER_AGENT, agent.clone());
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let code = status.as_u16();
            return Err(match code {
                429 => PipelineError::RateLimited(format!("{url} answered 429")),
                code if (400..500).contains(&code) => {
                    PipelineError::InvalidInput(format!("{url} answered client error {code}"))
                }
                _ => PipelineError::Network(format!("{url} answered server error {code}")),
            });
        }

        if let Some(length) = response.content_length() {
            if length > self.config.max_response_bytes {
                return Err(PipelineError::InvalidInput(format!(
                    "response of {length} bytes exceeds limit {}",
                    self.config.max_response_bytes
                )));
            }
        }

        let final_url = response.url().to_string();
        let response_headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let body = response.text().await?;
        if body.len() as u64 > self.config.max_response_bytes {
            return Err(PipelineError::InvalidInput(format!(
                "response body of {} bytes exceeds limit {}",
                body.len(),
                self.config.max_response_bytes
            )));
        }

        debug!(url = %url, %final_url, status = status.as_u16(), bytes = body.len(), "fetched page");
        Ok(FetchResult {
            url: url.to_string(),
            final_url,
            status_code: status.as_u16(),
            raw_html: body,
            response_headers,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fetcher(blocked: Vec<String>) -> Fetcher {
        let config = common::FetchConfig {
            blocked_domains: blocked,
            ..common::FetchConfig::default()
        };
        Fetcher::new(
            config,
            common::BrowserConfig::default(),
            Arc::new(OriginGate::new(0, 1000)),
            Arc::new(FetchSlots::new(4)),
        )
        .expect("build fetcher")
    }

    #[test]
    fn rejects_invalid_urls_without_retry() {
        let fetcher = test_fetcher(Vec::new());
        let err = fetcher.validate_url("not a url").expect_err("invalid");
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);

        let err = fetcher.validate_url("ftp://example.com/file").expect_err("scheme");
        assert!(err.to_string().contains("scheme"));
    }

    #[test]
    fn rejects_blocked_domains_and_subdomains() {
        let fetcher = test_fetcher(vec!["blocked.example".to_string()]);
        assert!(fetcher.validate_url("https://blocked.example/page").is_err());
        assert!(fetcher.validate_url("https://www.blocked.example/page").is_err());
        assert!(fetcher.validate_url("https://fine.example/page").is_ok());
    }

    #[test]
    fn browser_strategy_selection() {
        let opts = FetchOptions::default();
        assert!(!opts.wants_browser());

        let opts = FetchOptions {
            render_js: true,
            ..FetchOptions::default()
        };
        assert!(opts.wants_browser());

        let opts = FetchOptions {
            wait_for_selector: Some(".content".to_string()),
            ..FetchOptions::default()
        };
        assert!(opts.wants_browser());
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let first = backoff_delay(100, 0);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(151));

        let late = backoff_delay(1000, 20);
        assert_eq!(late, Duration::from_millis(30_000));
    }
}
