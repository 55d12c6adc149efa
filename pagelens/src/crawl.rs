//! Multi-source crawl: discover candidate articles per source,
//! de-duplicate against history by fingerprint, summarize survivors,
//! and report per-source counts.
//!
//! Sources are processed sequentially with an inter-item delay so
//! origin-level throttling holds; summarization of independent
//! surviving items runs under the batch concurrency bound.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use scraper::{Html, Selector};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::api::{BatchOptions, CrawlData, Envelope, ErrorBody, SourceReport};
use crate::error::{PipelineError, Result};
use crate::extract;
use crate::fetch::FetchOptions;
use crate::fingerprint::fingerprint;
use crate::pipeline::Pipeline;
use crate::storage::{ArticleRecord, RecordStatus};

const DEFAULT_ITEM_SELECTOR: &str = "article a, h2 a, h3 a";
/// Feed entries shorter than this are re-fetched from their page.
const THIN_ENTRY_CHARS: usize = 500;

/// A candidate article discovered from a source.
#[derive(Debug)]
struct Candidate {
    title: String,
    url: String,
    content: String,
    published: Option<DateTime<Utc>>,
}

impl Pipeline {
    /// Crawl the given sources (all configured sources when empty) and
    /// return per-source found/new/saved/errored counts.
    pub async fn crawl_sources(
        &self,
        source_ids: &[String],
        options: &BatchOptions,
    ) -> Envelope<CrawlData> {
        let started = Instant::now();

        let ids: Vec<String> = if source_ids.is_empty() {
            self.config.crawl.sources.iter().map(|s| s.id.clone()).collect()
        } else {
            source_ids.to_vec()
        };

        let mut reports = Vec::new();
        for id in &ids {
            let report = self.crawl_one_source(id, options).await;
            info!(
                source = %id,
                found = report.found,
                new = report.new,
                saved = report.saved,
                errored = report.errored,
                "source crawl finished"
            );
            reports.push(report);
        }

        let data = CrawlData {
            total_found: reports.iter().map(|r| r.found).sum(),
            total_new: reports.iter().map(|r| r.new).sum(),
            total_saved: reports.iter().map(|r| r.saved).sum(),
            total_errored: reports.iter().map(|r| r.errored).sum(),
            sources: reports,
        };
        Envelope::ok(data, started.elapsed().as_millis() as u64)
    }

    async fn crawl_one_source(&self, source_id: &str, options: &BatchOptions) -> SourceReport {
        let mut report = SourceReport {
            source_id: source_id.to_string(),
            found: 0,
            new: 0,
            saved: 0,
            errored: 0,
            errors: Vec::new(),
        };

        let Some(source) = self.config.source(source_id).cloned() else {
            let err = PipelineError::InvalidInput(format!("unknown crawl source '{source_id}'"));
            report.errored += 1;
            report.errors.push(ErrorBody::from(&err));
            return report;
        };

        let candidates = match self.discover_candidates(&source).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(source = source_id, "candidate discovery failed: {}", err);
                report.errored += 1;
                report.errors.push(ErrorBody::from(&err));
                return report;
            }
        };
        report.found = candidates.len();

        // Fingerprint each candidate and skip those already in history.
        let mut survivors = Vec::new();
        for candidate in candidates {
            let base_url = Url::parse(&candidate.url).ok();
            let extracted = extract::clean_with_url(&candidate.content, base_url.as_ref());
            let title = if candidate.title.is_empty() {
                extracted.title.clone()
            } else {
                candidate.title.clone()
            };
            let print = fingerprint(&title, &extracted.cleaned_text);

            match self.store.fingerprint_exists(&print).await {
                Ok(true) => continue,
                Ok(false) => {
                    report.new += 1;
                    survivors.push((candidate, extracted, title, print));
                }
                Err(err) => {
                    report.errored += 1;
                    report.errors.push(ErrorBody::from(&err));
                }
            }
        }

        // Summarize survivors with bounded concurrency.
        let concurrency = options
            .concurrency
            .unwrap_or(self.config.llm.batch_concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut in_flight = FuturesUnordered::new();
        for survivor in survivors {
            let semaphore = semaphore.clone();
            let source = &source;
            in_flight.push(async move {
                let _permit = semaphore.acquire().await;
                self.summarize_candidate(source, survivor).await
            });
        }

        while let Some(outcome) = in_flight.next().await {
            match outcome {
                Ok(()) => report.saved += 1,
                Err(err) => {
                    report.errored += 1;
                    report.errors.push(ErrorBody::from(&err));
                }
            }
        }

        report
    }

    /// Fetch the source's feed or listing page and extract candidate
    /// entries (title + content + date + url).
    async fn discover_candidates(&self, source: &common::SourceConfig) -> Result<Vec<Candidate>> {
        let listing = self
            .fetcher
            .fetch(&source.url, &FetchOptions::default())
            .await?;
        let limit = self.config.crawl.max_items_per_source.max(1);

        match source.kind.as_str() {
            "feed" => {
                let mut candidates = parse_feed_candidates(listing.raw_html.as_bytes(), limit)?;
                self.enrich_thin_candidates(&mut candidates).await;
                Ok(candidates)
            }
            "page" => self.collect_page_candidates(source, &listing.raw_html, limit).await,
            other => Err(PipelineError::InvalidInput(format!(
                "source '{}' has unsupported kind '{other}'",
                source.id
            ))),
        }
    }

    /// Feed entries often carry only a teaser; fetch the article page
    /// for those, politely spaced.
    async fn enrich_thin_candidates(&self, candidates: &mut [Candidate]) {
        let delay = Duration::from_millis(self.config.crawl.inter_item_delay_ms);
        for candidate in candidates.iter_mut() {
            if candidate.content.chars().count() >= THIN_ENTRY_CHARS {
                continue;
            }
            tokio::time::sleep(delay).await;
            match self.fetcher.fetch(&candidate.url, &FetchOptions::default()).await {
                Ok(page) if page.raw_html.len() > candidate.content.len() => {
                    info!(
                        url = %candidate.url,
                        "replaced thin feed entry with fetched page content"
                    );
                    candidate.content = page.raw_html;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(url = %candidate.url, "failed to fetch entry page: {}", err);
                }
            }
        }
    }

    /// Listing-page discovery: follow candidate links and fetch each
    /// page as its own candidate.
    async fn collect_page_candidates(
        &self,
        source: &common::SourceConfig,
        listing_html: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let selector_str = source
            .item_selector
            .as_deref()
            .unwrap_or(DEFAULT_ITEM_SELECTOR);
        let base = Url::parse(&source.url)
            .map_err(|e| PipelineError::InvalidInput(format!("bad source URL: {e}")))?;

        // Parse and drop the document before awaiting anything.
        let links: Vec<String> = {
            let doc = Html::parse_document(listing_html);
            let selector = Selector::parse(selector_str).map_err(|e| {
                PipelineError::InvalidInput(format!(
                    "source '{}' has invalid item selector: {e:?}",
                    source.id
                ))
            })?;

            let mut seen = HashSet::new();
            let mut links = Vec::new();
            for element in doc.select(&selector) {
                let Some(href) = element.value().attr("href") else {
                    continue;
                };
                let Ok(absolute) = base.join(href) else {
                    continue;
                };
                let absolute = absolute.to_string();
                if seen.insert(absolute.clone()) {
                    links.push(absolute);
                }
                if links.len() >= limit {
                    break;
                }
            }
            links
        };

        let delay = Duration::from_millis(self.config.crawl.inter_item_delay_ms);
        let mut candidates = Vec::new();
        for link in links {
            tokio::time::sleep(delay).await;
            match self.fetcher.fetch(&link, &FetchOptions::default()).await {
                Ok(page) => candidates.push(Candidate {
                    title: String::new(),
                    url: link,
                    content: page.raw_html,
                    published: None,
                }),
                Err(err) => {
                    warn!(url = %link, "failed to fetch candidate page: {}", err);
                }
            }
        }
        Ok(candidates)
    }

    async fn summarize_candidate(
        &self,
        source: &common::SourceConfig,
        survivor: (Candidate, extract::ExtractedContent, String, String),
    ) -> Result<()> {
        let (candidate, extracted, title, print) = survivor;

        let style = source.style.as_deref().unwrap_or("news_digest");
        let mut variables: HashMap<String, Value> = HashMap::new();
        variables.insert(
            "content".to_string(),
            Value::from(extracted.cleaned_text.as_str()),
        );
        if style == "news_digest" {
            let source_name = source.name.clone().unwrap_or_else(|| source.id.clone());
            variables.insert("source_name".to_string(), Value::from(source_name));
        }
        let prompt = self.templates.build(style, &variables, "auto")?;

        let summary = self
            .router
            .summarize(
                &extracted.cleaned_text,
                &prompt,
                &crate::llm::SummaryOptions::default(),
            )
            .await?;

        let record = ArticleRecord {
            id: Uuid::new_v4(),
            url: candidate.url,
            title,
            content: extracted.cleaned_text,
            summary: summary.summary,
            key_points: summary.key_points,
            tags: source.tags.clone(),
            language: extracted.language,
            tokens_in: summary.metadata.tokens_in,
            tokens_out: summary.metadata.tokens_out,
            cost_estimate: summary.metadata.cost_estimate,
            status: RecordStatus::Completed,
            fingerprint: print,
            created_at: candidate
                .published
                .or(extracted.detected_publish_date)
                .unwrap_or_else(Utc::now),
        };
        self.store.upsert(record).await
    }
}

/// Extract candidate entries from an RSS/Atom feed body.
fn parse_feed_candidates(body: &[u8], limit: usize) -> Result<Vec<Candidate>> {
    let feed = feed_rs::parser::parse(body)
        .map_err(|e| PipelineError::InvalidInput(format!("failed to parse feed: {e}")))?;

    Ok(feed
        .entries
        .into_iter()
        .take(limit)
        .filter_map(|entry| {
            let url = entry.links.first().map(|link| link.href.clone())?;
            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.clone())
                .unwrap_or_default();
            let content = entry
                .content
                .as_ref()
                .and_then(|c| c.body.clone())
                .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()))
                .unwrap_or_default();
            Some(Candidate {
                title,
                url,
                content,
                published: entry.published,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Feed</title>
    <link>https://example.com</link>
    <item>
      <title>First article</title>
      <link>https://example.com/articles/1</link>
      <description>A teaser for the first article.</description>
      <pubDate>Mon, 04 Mar 2024 09:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Second article</title>
      <link>https://example.com/articles/2</link>
      <description>A teaser for the second article.</description>
    </item>
    <item>
      <title>No link entry</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn feed_candidates_parse_title_url_and_date() {
        let candidates = parse_feed_candidates(FEED_XML.as_bytes(), 10).expect("parse feed");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].title, "First article");
        assert_eq!(candidates[0].url, "https://example.com/articles/1");
        assert!(candidates[0].published.is_some());
        assert!(candidates[0].content.contains("teaser"));
        assert!(candidates[1].published.is_none());
    }

    #[test]
    fn feed_candidates_respect_limit() {
        let candidates = parse_feed_candidates(FEED_XML.as_bytes(), 1).expect("parse feed");
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn invalid_feed_is_invalid_input() {
        let err = parse_feed_candidates(b"not a feed", 10).expect_err("should fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }
}
