/*
pagelens - CLI binary
Parses single URLs, batches, or configured crawl sources and prints the
JSON result envelope. The CLI wires in-memory persistence and quota
collaborators; deployments embed the library and inject their own.
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::Config;
use pagelens::api::{BatchOptions, BatchRequest, ParseOptions, ParseRequest};
use pagelens::llm::remote::OpenAiCompatProvider;
use pagelens::llm::LlmProvider;
use pagelens::storage::{MemoryStore, UnlimitedQuota};
use pagelens::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "pagelens", about = "Web-page acquisition and AI summarization pipeline")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and summarize a single URL
    Parse {
        url: String,

        /// Prompt style (concise, detailed, bullet_points, analytical)
        #[arg(long, default_value = "concise")]
        style: String,

        /// Target language for the summary ("auto" keeps the original)
        #[arg(long, default_value = "auto")]
        language: String,

        /// Custom prompt, bypassing the template engine
        #[arg(long)]
        custom_prompt: Option<String>,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        /// Render the page in a headless browser first
        #[arg(long)]
        render_js: bool,

        /// Fall back to an extractive summary if the model layer fails
        #[arg(long)]
        extractive_fallback: bool,
    },

    /// Parse several URLs as a batch
    Batch {
        urls: Vec<String>,

        /// Reorder results to match input order
        #[arg(long)]
        preserve_order: bool,

        /// Abort the batch on the first failed item
        #[arg(long)]
        fail_fast: bool,

        /// Concurrency override for batch summarization
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Crawl configured sources (all of them when none given)
    Crawl {
        /// Source ids to crawl
        #[arg(long = "source")]
        sources: Vec<String>,
    },

    /// Check provider health
    Health,
}

/// Build providers from configuration, resolving API keys from the
/// environment. Providers with a missing key are skipped with a
/// warning rather than failing startup.
fn build_providers(config: &Config) -> Vec<Arc<dyn LlmProvider>> {
    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();
    for provider_cfg in &config.llm.providers {
        let api_key = match &provider_cfg.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) => key,
                Err(_) => {
                    warn!(
                        provider = %provider_cfg.name,
                        env = var.as_str(),
                        "API key environment variable not set, skipping provider"
                    );
                    continue;
                }
            },
            None => String::new(),
        };

        let provider = OpenAiCompatProvider::new(
            provider_cfg.name.clone(),
            provider_cfg.api_url.clone(),
            api_key,
        )
        .with_models(provider_cfg.models.clone())
        .with_timeout(Duration::from_secs(60));
        providers.push(Arc::new(provider));
    }
    providers
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize result")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths: defaults file plus optional override
    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;

    let providers = build_providers(&config);
    if providers.is_empty() {
        warn!("no LLM providers configured; summarization requests will fail");
    }

    let store = Arc::new(MemoryStore::new());
    let quota = Arc::new(UnlimitedQuota);
    let pipeline = Pipeline::new(config, providers, store, quota)
        .map_err(|e| anyhow::anyhow!("failed to build pipeline: {e}"))?;

    match args.command {
        Command::Parse {
            url,
            style,
            language,
            custom_prompt,
            model,
            render_js,
            extractive_fallback,
        } => {
            let request = ParseRequest {
                url,
                options: ParseOptions {
                    style,
                    target_language: language,
                    custom_prompt,
                    model,
                    render_js,
                    extractive_fallback,
                    ..ParseOptions::default()
                },
            };
            let envelope = pipeline.parse_url(&request).await;
            print_json(&envelope)?;
        }

        Command::Batch {
            urls,
            preserve_order,
            fail_fast,
            concurrency,
        } => {
            if urls.is_empty() {
                return Err(anyhow::anyhow!("batch requires at least one URL"));
            }
            let request = BatchRequest {
                items: urls.into_iter().map(ParseRequest::new).collect(),
                source_ids: Vec::new(),
                options: BatchOptions {
                    continue_on_error: !fail_fast,
                    preserve_order,
                    concurrency,
                },
            };
            let envelope = pipeline.parse_batch(&request).await;
            if let Some(data) = &envelope.data {
                info!(
                    total = data.total,
                    successful = data.successful,
                    failed = data.failed,
                    "batch finished"
                );
            }
            print_json(&envelope)?;
        }

        Command::Crawl { sources } => {
            let envelope = pipeline
                .crawl_sources(&sources, &BatchOptions::default())
                .await;
            print_json(&envelope)?;
        }

        Command::Health => {
            let envelope = pipeline.health().await;
            print_json(&envelope)?;
        }
    }

    Ok(())
}
