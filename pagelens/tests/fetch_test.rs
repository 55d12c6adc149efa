use std::io::Write;
use std::sync::Arc;

use pagelens::error::ErrorKind;
use pagelens::fetch::{FetchOptions, Fetcher};
use pagelens::limiter::{FetchSlots, OriginGate};

fn fetcher(max_retries: u32) -> Fetcher {
    let config = common::FetchConfig {
        timeout_ms: 5_000,
        max_retries,
        backoff_base_ms: 1,
        ..common::FetchConfig::default()
    };
    Fetcher::new(
        config,
        common::BrowserConfig::default(),
        Arc::new(OriginGate::new(0, 100_000)),
        Arc::new(FetchSlots::new(8)),
    )
    .expect("build fetcher")
}

#[tokio::test]
async fn successful_fetch_reports_status_headers_and_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/page")
        .with_status(200)
        .with_header("content-type", "text/html; charset=utf-8")
        .with_body("<html><body><p>Hello there, reader.</p></body></html>")
        .create_async()
        .await;

    let fetcher = fetcher(0);
    let url = format!("{}/page", server.url());
    let result = fetcher.fetch(&url, &FetchOptions::default()).await.expect("fetch");

    assert_eq!(result.status_code, 200);
    assert_eq!(result.url, url);
    assert!(result.raw_html.contains("Hello there"));
    assert_eq!(
        result.response_headers.get("content-type").map(String::as_str),
        Some("text/html; charset=utf-8")
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn server_errors_retry_until_exhausted() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/flaky")
        .with_status(503)
        .with_body("unavailable")
        .expect(3)
        .create_async()
        .await;

    let fetcher = fetcher(2);
    let url = format!("{}/flaky", server.url());
    let err = fetcher
        .fetch(&url, &FetchOptions::default())
        .await
        .expect_err("exhausts retries");

    assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    mock.assert_async().await;
}

#[tokio::test]
async fn client_errors_fail_immediately_without_retry() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/gone")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let fetcher = fetcher(3);
    let url = format!("{}/gone", server.url());
    let err = fetcher
        .fetch(&url, &FetchOptions::default())
        .await
        .expect_err("404 is terminal");

    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    mock.assert_async().await;
}

#[tokio::test]
async fn too_many_requests_is_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/limited")
        .with_status(429)
        .expect(2)
        .create_async()
        .await;

    let fetcher = fetcher(1);
    let url = format!("{}/limited", server.url());
    let err = fetcher
        .fetch(&url, &FetchOptions::default())
        .await
        .expect_err("still limited after retry");

    assert_eq!(err.kind(), ErrorKind::RateLimited);
    mock.assert_async().await;
}

#[tokio::test]
async fn redirects_are_followed_and_final_url_reported() {
    let mut server = mockito::Server::new_async().await;
    let target_url = format!("{}/target", server.url());
    let _redirect = server
        .mock("GET", "/start")
        .with_status(302)
        .with_header("location", &target_url)
        .create_async()
        .await;
    let _target = server
        .mock("GET", "/target")
        .with_status(200)
        .with_body("<html><body><p>Landed.</p></body></html>")
        .create_async()
        .await;

    let fetcher = fetcher(0);
    let start_url = format!("{}/start", server.url());
    let result = fetcher
        .fetch(&start_url, &FetchOptions::default())
        .await
        .expect("fetch");

    assert_eq!(result.url, start_url);
    assert_eq!(result.final_url, target_url);
    assert!(result.raw_html.contains("Landed"));
}

#[tokio::test]
async fn per_request_timeout_is_classified_as_network_failure() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/slow")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_secs(2));
            w.write_all(b"too late")
        })
        .create_async()
        .await;

    let fetcher = fetcher(0);
    let url = format!("{}/slow", server.url());
    let options = FetchOptions {
        timeout_ms: Some(300),
        ..FetchOptions::default()
    };
    let err = fetcher.fetch(&url, &options).await.expect_err("times out");
    assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn saturation_rejects_when_opted_in() {
    let config = common::FetchConfig::default();
    let slots = Arc::new(FetchSlots::new(1));
    let fetcher = Fetcher::new(
        config,
        common::BrowserConfig::default(),
        Arc::new(OriginGate::new(0, 100_000)),
        slots.clone(),
    )
    .expect("build fetcher");

    // Hold the only slot so the fetch finds no capacity.
    let _held = slots.acquire().await.expect("hold slot");

    let options = FetchOptions {
        reject_on_saturation: true,
        ..FetchOptions::default()
    };
    let err = fetcher
        .fetch("https://example.com/page", &options)
        .await
        .expect_err("saturated");
    assert_eq!(err.kind(), ErrorKind::RateLimited);
}

#[tokio::test]
async fn oversized_responses_are_rejected() {
    let mut server = mockito::Server::new_async().await;
    let big = "x".repeat(4096);
    let _mock = server
        .mock("GET", "/big")
        .with_status(200)
        .with_body(&big)
        .create_async()
        .await;

    let config = common::FetchConfig {
        max_response_bytes: 1024,
        max_retries: 0,
        ..common::FetchConfig::default()
    };
    let fetcher = Fetcher::new(
        config,
        common::BrowserConfig::default(),
        Arc::new(OriginGate::new(0, 100_000)),
        Arc::new(FetchSlots::new(8)),
    )
    .expect("build fetcher");

    let url = format!("{}/big", server.url());
    let err = fetcher
        .fetch(&url, &FetchOptions::default())
        .await
        .expect_err("too large");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}
