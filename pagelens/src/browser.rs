//! Browser-automation fetch strategy for script-rendered pages.
//!
//! A single Chromium instance is launched lazily and shared; each
//! request gets its own page. The page is closed on every exit path,
//! success or failure, so sustained load cannot leak render targets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::fetch::{FetchOptions, FetchResult};

pub struct BrowserRenderer {
    instance: Mutex<Option<Arc<Browser>>>,
    config: common::BrowserConfig,
}

impl BrowserRenderer {
    pub fn new(config: common::BrowserConfig) -> Self {
        Self {
            instance: Mutex::new(None),
            config,
        }
    }

    /// Get the shared browser, launching it on first use. The CDP
    /// event handler runs on a background task for the browser's
    /// lifetime.
    async fn browser(&self) -> Result<Arc<Browser>> {
        let mut guard = self.instance.lock().await;
        if let Some(browser) = guard.as_ref() {
            return Ok(browser.clone());
        }

        if !self.config.enabled {
            return Err(PipelineError::InvalidInput(
                "browser rendering is disabled in configuration".to_string(),
            ));
        }

        info!("launching headless browser");
        let mut builder = BrowserConfig::builder()
            .window_size(self.config.window_width, self.config.window_height)
            .args(vec!["--no-sandbox", "--disable-dev-shm-usage", "--disable-gpu"]);

        for resource in &self.config.blocked_resource_types {
            match resource.as_str() {
                "image" => {
                    builder = builder.arg("--blink-settings=imagesEnabled=false");
                }
                other => debug!(resource = other, "unsupported blocked resource type, ignoring"),
            }
        }

        let browser_config = builder
            .build()
            .map_err(|e| PipelineError::Internal(format!("browser configuration failed: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| PipelineError::Network(format!("browser launch failed: {e}")))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler event error: {}", e);
                }
            }
        });

        let browser = Arc::new(browser);
        *guard = Some(browser.clone());
        Ok(browser)
    }

    /// Navigate to a URL with page scripts enabled and return the
    /// rendered document.
    pub async fn fetch_rendered(&self, url: &str, options: &FetchOptions) -> Result<FetchResult> {
        // Viewport and resource blocking are applied at browser launch;
        // differing per-request values cannot take effect on the shared
        // instance.
        if options.viewport.is_some() {
            debug!(url, "per-request viewport ignored, launch configuration applies");
        }
        if !options.blocked_resource_types.is_empty() {
            debug!(url, "per-request blocked resource types ignored, launch configuration applies");
        }

        let browser = self.browser().await?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| PipelineError::Network(format!("failed to open page: {e}")))?;

        let deadline = Duration::from_millis(
            options.timeout_ms.unwrap_or(self.config.nav_timeout_ms),
        );
        let result = tokio::time::timeout(deadline, self.render(&page, url, options))
            .await
            .unwrap_or_else(|_| {
                Err(PipelineError::Network(format!(
                    "render of {url} timed out after {}ms",
                    deadline.as_millis()
                )))
            });

        // Release the page whatever happened above.
        if let Err(e) = page.close().await {
            warn!(url, "failed to close browser page: {}", e);
        }
        result
    }

    async fn render(&self, page: &Page, url: &str, options: &FetchOptions) -> Result<FetchResult> {
        if let Some(agent) = &options.user_agent {
            page.set_user_agent(agent.as_str())
                .await
                .map_err(|e| PipelineError::Network(format!("set user agent failed: {e}")))?;
        }

        page.goto(url)
            .await
            .map_err(|e| PipelineError::Network(format!("navigation to {url} failed: {e}")))?;

        if options.require_network_idle {
            page.wait_for_navigation()
                .await
                .map_err(|e| PipelineError::Network(format!("waiting for network idle failed: {e}")))?;
        }

        if let Some(selector) = &options.wait_for_selector {
            self.wait_for_selector(page, selector).await?;
        }

        let raw_html = page
            .content()
            .await
            .map_err(|e| PipelineError::Network(format!("reading rendered content failed: {e}")))?;

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        debug!(url, %final_url, bytes = raw_html.len(), "rendered page");
        Ok(FetchResult {
            url: url.to_string(),
            final_url,
            // The CDP path does not surface the HTTP status; a
            // successfully rendered document is reported as 200.
            status_code: 200,
            raw_html,
            response_headers: HashMap::new(),
            fetched_at: Utc::now(),
        })
    }

    /// Poll for a selector until it appears. The caller's overall
    /// render deadline bounds this loop.
    async fn wait_for_selector(&self, page: &Page, selector: &str) -> Result<()> {
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Typed extraction contract: a selector list in, structured text
    /// fields out. Selectors that match nothing are simply absent from
    /// the result.
    pub async fn extract_fields(
        &self,
        url: &str,
        selectors: &[String],
        options: &FetchOptions,
    ) -> Result<HashMap<String, String>> {
        let browser = self.browser().await?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| PipelineError::Network(format!("failed to open page: {e}")))?;

        let deadline = Duration::from_millis(
            options.timeout_ms.unwrap_or(self.config.nav_timeout_ms),
        );
        let result = tokio::time::timeout(
            deadline,
            self.extract_fields_inner(&page, url, selectors),
        )
        .await
        .unwrap_or_else(|_| {
            Err(PipelineError::Network(format!(
                "field extraction on {url} timed out after {}ms",
                deadline.as_millis()
            )))
        });

        if let Err(e) = page.close().await {
            warn!(url, "failed to close browser page: {}", e);
        }
        result
    }

    async fn extract_fields_inner(
        &self,
        page: &Page,
        url: &str,
        selectors: &[String],
    ) -> Result<HashMap<String, String>> {
        page.goto(url)
            .await
            .map_err(|e| PipelineError::Network(format!("navigation to {url} failed: {e}")))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| PipelineError::Network(format!("waiting for page load failed: {e}")))?;

        let mut fields = HashMap::new();
        for selector in selectors {
            let Ok(element) = page.find_element(selector.as_str()).await else {
                continue;
            };
            match element.inner_text().await {
                Ok(Some(text)) => {
                    fields.insert(selector.clone(), text.trim().to_string());
                }
                Ok(None) => {}
                Err(e) => debug!(selector = selector.as_str(), "inner_text failed: {}", e),
            }
        }
        Ok(fields)
    }
}
