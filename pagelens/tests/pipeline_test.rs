use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use pagelens::api::{BatchOptions, BatchRequest, ParseOptions, ParseRequest};
use pagelens::error::{ErrorKind, PipelineError, Result};
use pagelens::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use pagelens::storage::{FixedQuota, MemoryStore, QuotaGate, UnlimitedQuota};
use pagelens::Pipeline;

const SUMMARY_JSON: &str =
    r#"{"summary": "A faithful summary of the article.", "key_points": ["first point", "second point"]}"#;

/// Mock provider that can stagger latency per article (keyed by marker
/// words in the prompt) or fail outright.
struct ScriptedProvider {
    calls: AtomicUsize,
    delays: Vec<(&'static str, Duration)>,
    fail: bool,
}

impl ScriptedProvider {
    fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delays: Vec::new(),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delays: Vec::new(),
            fail: true,
        }
    }

    fn with_delays(delays: Vec<(&'static str, Duration)>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delays,
            fail: false,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for (marker, delay) in &self.delays {
            if request.user.contains(marker) {
                tokio::time::sleep(*delay).await;
                break;
            }
        }
        if self.fail {
            return Err(PipelineError::Network("mock: connection reset".into()));
        }
        Ok(CompletionResponse {
            content: SUMMARY_JSON.to_string(),
            model: request.model.clone(),
            tokens_in: 120,
            tokens_out: 30,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    async fn health_check(&self) -> bool {
        !self.fail
    }
}

fn test_config() -> common::Config {
    let mut config = common::Config::default();
    config.fetch.max_retries = 0;
    config.fetch.backoff_base_ms = 1;
    config.fetch.timeout_ms = 5_000;
    config.limiter.min_delay_ms = 0;
    config.limiter.requests_per_minute = 100_000;
    config.llm.max_retries = 0;
    config.llm.backoff_base_ms = 1;
    config.crawl.inter_item_delay_ms = 1;
    config
}

fn build_pipeline(
    config: common::Config,
    provider: Arc<ScriptedProvider>,
    quota: Arc<dyn QuotaGate>,
) -> (Pipeline, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(config, vec![provider], store.clone(), quota)
        .expect("build pipeline");
    (pipeline, store)
}

/// An article page with enough substance to clear the minimum content
/// threshold, carrying a marker word for latency scripting.
fn article_html(title: &str, marker: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>{title}</title></head>
<body>
<article>
<h1>{title}</h1>
<p>The {marker} investigation describes how the engineering team rebuilt their data
pipeline over six months, replacing a brittle collection of scheduled scripts with a
supervised streaming system that recovers from failures automatically.</p>
<p>Along the way the {marker} team documented every incident, measured recovery times
before and after the migration, and published the tooling they built so that other
organizations facing the same scaling problems could reuse the work.</p>
<p>The writeup closes with practical advice on migration sequencing, capacity planning,
and the organizational changes required to operate the new {marker} platform reliably
over the long term.</p>
</article>
</body>
</html>"#
    )
}

#[tokio::test]
async fn parse_url_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let _page = server
        .mock("GET", "/article")
        .with_status(200)
        .with_body(article_html("Pipeline Rebuild", "alpha"))
        .create_async()
        .await;

    let provider = Arc::new(ScriptedProvider::ok());
    let (pipeline, store) =
        build_pipeline(test_config(), provider.clone(), Arc::new(UnlimitedQuota));

    let request = ParseRequest::new(format!("{}/article", server.url()));
    let envelope = pipeline.parse_url(&request).await;

    assert!(envelope.success, "error: {:?}", envelope.error);
    let data = envelope.data.expect("data");
    assert_eq!(data.title, "Pipeline Rebuild");
    assert_eq!(data.language, "en");
    assert_eq!(data.summary, "A faithful summary of the article.");
    assert_eq!(data.key_points.len(), 2);
    assert_eq!(data.fingerprint.len(), 16);
    assert!(data.word_count > 50);
    assert!(!data.cached);
    assert_eq!(data.summary_metadata.provider_name, "scripted");
    assert_eq!(provider.calls(), 1);

    // Record handed to the persistence collaborator
    assert_eq!(store.len().await, 1);
    let record = store.get(&data.fingerprint).await.expect("stored");
    assert_eq!(record.title, "Pipeline Rebuild");
    assert_eq!(record.tokens_in, 120);
}

#[tokio::test]
async fn short_content_fails_fast_without_model_call() {
    let mut server = mockito::Server::new_async().await;
    let _page = server
        .mock("GET", "/stub")
        .with_status(200)
        .with_body("<html><body><p>tiny</p></body></html>")
        .create_async()
        .await;

    let provider = Arc::new(ScriptedProvider::ok());
    let (pipeline, store) =
        build_pipeline(test_config(), provider.clone(), Arc::new(UnlimitedQuota));

    let request = ParseRequest::new(format!("{}/stub", server.url()));
    let envelope = pipeline.parse_url(&request).await;

    assert!(!envelope.success);
    let error = envelope.error.expect("error body");
    assert_eq!(error.kind, ErrorKind::ContentTooShort);
    // The model layer is never invoked
    assert_eq!(provider.calls(), 0);
    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn repeated_parse_is_served_from_cache() {
    let mut server = mockito::Server::new_async().await;
    let _page = server
        .mock("GET", "/cached")
        .with_status(200)
        .with_body(article_html("Cache Me", "beta"))
        .create_async()
        .await;

    let provider = Arc::new(ScriptedProvider::ok());
    let (pipeline, _store) =
        build_pipeline(test_config(), provider.clone(), Arc::new(UnlimitedQuota));

    let request = ParseRequest::new(format!("{}/cached", server.url()));
    let first = pipeline.parse_url(&request).await;
    assert!(first.success);
    assert!(!first.data.expect("data").cached);

    let second = pipeline.parse_url(&request).await;
    assert!(second.success);
    assert!(second.data.expect("data").cached);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn identical_content_at_new_url_is_a_duplicate() {
    let mut server = mockito::Server::new_async().await;
    let body = article_html("Same Story", "gamma");
    let _first = server
        .mock("GET", "/mirror-a")
        .with_status(200)
        .with_body(&body)
        .create_async()
        .await;
    let _second = server
        .mock("GET", "/mirror-b")
        .with_status(200)
        .with_body(&body)
        .create_async()
        .await;

    let provider = Arc::new(ScriptedProvider::ok());
    let (pipeline, _store) =
        build_pipeline(test_config(), provider.clone(), Arc::new(UnlimitedQuota));

    let first = pipeline
        .parse_url(&ParseRequest::new(format!("{}/mirror-a", server.url())))
        .await;
    assert!(first.success);

    let second = pipeline
        .parse_url(&ParseRequest::new(format!("{}/mirror-b", server.url())))
        .await;
    assert!(!second.success);
    assert_eq!(second.error.expect("error").kind, ErrorKind::Duplicate);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn quota_gate_blocks_further_parses() {
    let mut server = mockito::Server::new_async().await;
    let _page = server
        .mock("GET", "/quota")
        .with_status(200)
        .with_body(article_html("Quota Test", "delta"))
        .create_async()
        .await;

    let provider = Arc::new(ScriptedProvider::ok());
    let (pipeline, _store) =
        build_pipeline(test_config(), provider.clone(), Arc::new(FixedQuota::new(1)));

    let request = ParseRequest {
        url: format!("{}/quota", server.url()),
        options: ParseOptions {
            allow_refresh: true,
            ..ParseOptions::default()
        },
    };
    let first = pipeline.parse_url(&request).await;
    assert!(first.success);

    let second = pipeline.parse_url(&request).await;
    assert!(!second.success);
    assert_eq!(second.error.expect("error").kind, ErrorKind::QuotaExceeded);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn extractive_fallback_covers_model_failure() {
    let mut server = mockito::Server::new_async().await;
    let _page = server
        .mock("GET", "/fallback")
        .with_status(200)
        .with_body(article_html("Fallback Story", "epsilon"))
        .create_async()
        .await;

    let provider = Arc::new(ScriptedProvider::failing());
    let (pipeline, store) =
        build_pipeline(test_config(), provider.clone(), Arc::new(UnlimitedQuota));

    let request = ParseRequest {
        url: format!("{}/fallback", server.url()),
        options: ParseOptions {
            extractive_fallback: true,
            ..ParseOptions::default()
        },
    };
    let envelope = pipeline.parse_url(&request).await;

    assert!(envelope.success, "error: {:?}", envelope.error);
    let data = envelope.data.expect("data");
    assert_eq!(data.summary_metadata.provider_name, "extractive");
    assert!(!data.summary.is_empty());
    assert!(!data.key_points.is_empty());
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn batch_continues_on_error_and_reports_counts() {
    let mut server = mockito::Server::new_async().await;
    let _ok_one = server
        .mock("GET", "/batch-1")
        .with_status(200)
        .with_body(article_html("Batch One", "alpha"))
        .create_async()
        .await;
    let _slow = server
        .mock("GET", "/batch-2")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(Duration::from_secs(2));
            w.write_all(b"too late")
        })
        .create_async()
        .await;
    let _ok_two = server
        .mock("GET", "/batch-3")
        .with_status(200)
        .with_body(article_html("Batch Three", "gamma"))
        .create_async()
        .await;

    let provider = Arc::new(ScriptedProvider::ok());
    let (pipeline, _store) =
        build_pipeline(test_config(), provider.clone(), Arc::new(UnlimitedQuota));

    let timeout_options = ParseOptions {
        timeout_ms: Some(300),
        ..ParseOptions::default()
    };
    let request = BatchRequest {
        items: vec![
            ParseRequest::new(format!("{}/batch-1", server.url())),
            ParseRequest {
                url: format!("{}/batch-2", server.url()),
                options: timeout_options,
            },
            ParseRequest::new(format!("{}/batch-3", server.url())),
        ],
        source_ids: Vec::new(),
        options: BatchOptions {
            continue_on_error: true,
            preserve_order: true,
            concurrency: None,
        },
    };

    let envelope = pipeline.parse_batch(&request).await;
    assert!(envelope.success);
    let data = envelope.data.expect("data");

    assert_eq!(data.total, 3);
    assert_eq!(data.successful, 2);
    assert_eq!(data.failed, 1);

    let failed_item = &data.results[1];
    assert!(!failed_item.success);
    assert!(failed_item.url.ends_with("/batch-2"));
    assert_eq!(
        failed_item.error.as_ref().expect("error").kind,
        ErrorKind::NetworkFailure
    );
}

#[tokio::test]
async fn preserve_order_matches_input_despite_staggered_latency() {
    let mut server = mockito::Server::new_async().await;
    let _a = server
        .mock("GET", "/order-a")
        .with_status(200)
        .with_body(article_html("Order A", "alpha"))
        .create_async()
        .await;
    let _b = server
        .mock("GET", "/order-b")
        .with_status(200)
        .with_body(article_html("Order B", "beta"))
        .create_async()
        .await;
    let _c = server
        .mock("GET", "/order-c")
        .with_status(200)
        .with_body(article_html("Order C", "gamma"))
        .create_async()
        .await;

    // The earliest input gets the longest model latency, so completion
    // order inverts input order.
    let provider = Arc::new(ScriptedProvider::with_delays(vec![
        ("alpha", Duration::from_millis(400)),
        ("beta", Duration::from_millis(150)),
        ("gamma", Duration::from_millis(0)),
    ]));
    let (pipeline, _store) =
        build_pipeline(test_config(), provider, Arc::new(UnlimitedQuota));

    let urls = [
        format!("{}/order-a", server.url()),
        format!("{}/order-b", server.url()),
        format!("{}/order-c", server.url()),
    ];
    let request = BatchRequest {
        items: urls.iter().map(|u| ParseRequest::new(u.as_str())).collect(),
        source_ids: Vec::new(),
        options: BatchOptions {
            continue_on_error: true,
            preserve_order: true,
            concurrency: Some(3),
        },
    };

    let envelope = pipeline.parse_batch(&request).await;
    let data = envelope.data.expect("data");
    assert_eq!(data.successful, 3);

    let result_urls: Vec<&str> = data.results.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(result_urls, urls.iter().map(String::as_str).collect::<Vec<_>>());
}

#[tokio::test]
async fn fail_fast_batch_stops_after_first_failure() {
    let mut server = mockito::Server::new_async().await;
    let _stub = server
        .mock("GET", "/tiny")
        .with_status(200)
        .with_body("<html><body><p>tiny</p></body></html>")
        .create_async()
        .await;
    let _page = server
        .mock("GET", "/fine")
        .with_status(200)
        .with_body(article_html("Fine Page", "beta"))
        .create_async()
        .await;

    let provider = Arc::new(ScriptedProvider::ok());
    let (pipeline, _store) =
        build_pipeline(test_config(), provider, Arc::new(UnlimitedQuota));

    let request = BatchRequest {
        items: vec![
            ParseRequest::new(format!("{}/tiny", server.url())),
            ParseRequest::new(format!("{}/fine", server.url())),
            ParseRequest::new(format!("{}/fine", server.url())),
        ],
        source_ids: Vec::new(),
        options: BatchOptions {
            continue_on_error: false,
            preserve_order: false,
            // One at a time makes the early stop deterministic
            concurrency: Some(1),
        },
    };

    let envelope = pipeline.parse_batch(&request).await;
    let data = envelope.data.expect("data");
    assert_eq!(data.total, 3);
    assert_eq!(data.failed, 1);
    assert_eq!(data.results.len(), 1);
    assert_eq!(
        data.results[0].error.as_ref().expect("error").kind,
        ErrorKind::ContentTooShort
    );
}

fn feed_xml(server_url: &str) -> String {
    let filler = "The report walks through the full migration in depth, covering the \
                  motivations, the failures encountered along the way, the metrics used to \
                  judge progress, and the lessons the team would hand to anyone attempting \
                  a similar project. It also includes interviews with the operators who ran \
                  the previous system and a frank accounting of what the rewrite cost in \
                  engineering time, infrastructure spend, and delayed product work across \
                  two quarters of sustained effort by the platform group."
        .repeat(2);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Test Source</title>
    <link>{server_url}</link>
    <item>
      <title>Streaming Migration Retrospective</title>
      <link>{server_url}/posts/1</link>
      <description>{filler}</description>
      <pubDate>Mon, 04 Mar 2024 09:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Capacity Planning Notes</title>
      <link>{server_url}/posts/2</link>
      <description>Completely different material about capacity planning. {filler}</description>
    </item>
  </channel>
</rss>"#
    )
}

#[tokio::test]
async fn crawl_summarizes_new_entries_and_skips_seen_fingerprints() {
    let mut server = mockito::Server::new_async().await;
    let feed_body = feed_xml(&server.url());
    let _feed = server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(&feed_body)
        .create_async()
        .await;

    let mut config = test_config();
    config.crawl.sources.push(common::SourceConfig {
        id: "test-source".to_string(),
        name: Some("Test Source".to_string()),
        url: format!("{}/feed.xml", server.url()),
        kind: "feed".to_string(),
        item_selector: None,
        style: None,
        tags: vec!["testing".to_string()],
    });

    let provider = Arc::new(ScriptedProvider::ok());
    let (pipeline, store) =
        build_pipeline(config, provider.clone(), Arc::new(UnlimitedQuota));

    let envelope = pipeline
        .crawl_sources(&["test-source".to_string()], &BatchOptions::default())
        .await;
    assert!(envelope.success);
    let data = envelope.data.expect("data");

    assert_eq!(data.sources.len(), 1);
    let report = &data.sources[0];
    assert_eq!(report.found, 2);
    assert_eq!(report.new, 2);
    assert_eq!(report.saved, 2);
    assert_eq!(report.errored, 0);
    assert_eq!(store.len().await, 2);
    assert_eq!(provider.calls(), 2);

    // A second crawl finds the same entries but all fingerprints are
    // already in history.
    let envelope = pipeline
        .crawl_sources(&["test-source".to_string()], &BatchOptions::default())
        .await;
    let data = envelope.data.expect("data");
    let report = &data.sources[0];
    assert_eq!(report.found, 2);
    assert_eq!(report.new, 0);
    assert_eq!(report.saved, 0);
    assert_eq!(provider.calls(), 2);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn crawl_reports_unknown_source_as_error() {
    let provider = Arc::new(ScriptedProvider::ok());
    let (pipeline, _store) =
        build_pipeline(test_config(), provider, Arc::new(UnlimitedQuota));

    let envelope = pipeline
        .crawl_sources(&["missing".to_string()], &BatchOptions::default())
        .await;
    let data = envelope.data.expect("data");
    assert_eq!(data.sources.len(), 1);
    assert_eq!(data.sources[0].errored, 1);
    assert_eq!(data.sources[0].errors[0].kind, ErrorKind::InvalidInput);
    assert_eq!(data.total_saved, 0);
}

#[tokio::test]
async fn health_envelope_reports_provider_status() {
    let provider = Arc::new(ScriptedProvider::ok());
    let (pipeline, _store) =
        build_pipeline(test_config(), provider, Arc::new(UnlimitedQuota));

    let envelope = pipeline.health().await;
    assert!(envelope.success);
    let report = envelope.data.expect("report");
    assert_eq!(report.providers.len(), 1);
    assert!(report.providers[0].reachable);
}
