/*!
common/src/lib.rs

Shared configuration types for Pagelens.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader for a TOML config file with default/override merging

All tunables of the pipeline live here: fetch politeness, rate-limit
ceilings, cache TTL, model defaults, cost ceilings, and crawl sources.
Nothing in the pipeline crate hard-codes these values.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fetching configuration: timeouts, retries, and input validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// User-Agent header sent on every request
    pub user_agent: String,
    /// Maximum retry attempts for transient failures
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (doubled per attempt, with jitter)
    pub backoff_base_ms: u64,
    /// Response bodies larger than this are rejected
    pub max_response_bytes: u64,
    /// Domains that fail immediately with an invalid-input error
    pub blocked_domains: Vec<String>,
    /// Fetched pages shorter than this (in characters) are rejected
    /// before any model call
    pub min_content_chars: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            user_agent: "Pagelens/0.1.0".to_string(),
            max_retries: 3,
            backoff_base_ms: 500,
            max_response_bytes: 5 * 1024 * 1024,
            blocked_domains: Vec::new(),
            min_content_chars: 200,
        }
    }
}

/// Browser-automation configuration for script-rendered pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Whether the browser strategy may be used at all
    pub enabled: bool,
    /// Window size applied at browser launch
    pub window_width: u32,
    pub window_height: u32,
    /// Navigation deadline in milliseconds
    pub nav_timeout_ms: u64,
    /// Resource types disabled at launch (currently "image" is honored)
    pub blocked_resource_types: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_width: 1280,
            window_height: 800,
            nav_timeout_ms: 30_000,
            blocked_resource_types: Vec::new(),
        }
    }
}

/// Rate limiting and caching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Minimum delay between two requests to the same origin, in ms
    pub min_delay_ms: u64,
    /// Rolling per-minute request ceiling per origin
    pub requests_per_minute: u32,
    /// Global fetch concurrency ceiling
    pub max_concurrent_fetches: usize,
    /// Result-cache time-to-live in seconds
    pub cache_ttl_secs: u64,
    /// Result-cache capacity; overflow evicts in insertion order
    pub cache_max_entries: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 250,
            requests_per_minute: 30,
            max_concurrent_fetches: 8,
            cache_ttl_secs: 3600,
            cache_max_entries: 512,
        }
    }
}

/// A single LLM provider endpoint (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name used in logs, metadata and health reports
    pub name: String,
    /// Chat-completions endpoint URL
    pub api_url: String,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    /// Models this provider serves; empty means "any"
    #[serde(default)]
    pub models: Vec<String>,
}

/// LLM configuration: providers, model defaults, cost ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Configured providers, in selection order
    pub providers: Vec<ProviderConfig>,
    /// Fallback provider name when no provider supports the requested model
    pub default_provider: String,
    /// Model used when a request does not name one
    pub default_model: String,
    /// Maximum retry attempts per provider for retryable errors
    pub max_retries: u32,
    /// Base backoff delay in milliseconds
    pub backoff_base_ms: u64,
    /// Requests with an estimated cost above this are rejected up front (USD)
    pub per_request_cost_ceiling: f64,
    /// Accumulated daily spend above this rejects further requests (USD)
    pub per_day_cost_ceiling: f64,
    /// Concurrency ceiling for batch summarization
    pub batch_concurrency: usize,
    /// Default output token budget for summaries
    pub default_max_output_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            default_provider: "openai".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            max_retries: 3,
            backoff_base_ms: 500,
            per_request_cost_ceiling: 0.25,
            per_day_cost_ceiling: 10.0,
            batch_concurrency: 3,
            default_max_output_tokens: 500,
        }
    }
}

/// A crawl source: a feed or listing page that yields candidate articles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable identifier used in crawl requests
    pub id: String,
    /// Human-readable name
    pub name: Option<String>,
    /// Feed or listing-page URL
    pub url: String,
    /// "feed" (RSS/Atom) or "page" (HTML listing)
    #[serde(default = "default_source_kind")]
    pub kind: String,
    /// CSS selector for candidate links on listing pages
    pub item_selector: Option<String>,
    /// Prompt style used for this source's summaries
    pub style: Option<String>,
    /// Tags attached to every record saved from this source
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_source_kind() -> String {
    "feed".to_string()
}

/// Crawl configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Configured sources
    pub sources: Vec<SourceConfig>,
    /// Delay between consecutive item fetches within a source, in ms
    pub inter_item_delay_ms: u64,
    /// Maximum candidate items examined per source per crawl
    pub max_items_per_source: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            inter_item_delay_ms: 500,
            max_items_per_source: 10,
        }
    }
}

/// Top-level application configuration (deserialized from config.toml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fetch: FetchConfig,
    pub browser: BrowserConfig,
    pub limiter: LimiterConfig,
    pub llm: LlmConfig,
    pub crawl: CrawlConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse default configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse override configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    /// Find a crawl source by its identifier.
    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.crawl.sources.iter().find(|s| s.id == id)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}
