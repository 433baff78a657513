
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::{Browser, LaunchOptions, Tab};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::config::ScraperConfig;
use crate::{RagError, Result};

/// Delay between scroll steps while waiting for lazy-loaded content.
const SCROLL_STEP_DELAY: Duration = Duration::from_millis(500);

/// Hard cap on scroll iterations regardless of stability.
const MAX_SCROLL_STEPS: usize = 50;

/// Elements whose text is never page content.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "iframe", "svg", "nav", "header", "footer", "aside", "button",
];

/// Tags that end a line of flowing text.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "br",
    "tr", "table", "pre", "blockquote",
];

/// Headless-browser page scraper.
///
/// Loads a URL, waits for rendering, follows a single full-page inner frame
/// if present, scrolls until the page height stabilizes, then extracts text
/// from the first matching content selector (falling back to body text).
pub struct WebScraper {
    config: ScraperConfig,
}

impl WebScraper {
    #[inline]
    pub fn new(config: ScraperConfig) -> Self {
        Self { config }
    }

    /// Scrape `url` into a plain-text blob.
    pub async fn scrape(&self, url: &str) -> Result<String> {
        let url = Url::parse(url)
            .map_err(|e| RagError::InvalidInput(format!("Malformed URL {url}: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RagError::InvalidInput(format!(
                "Unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        let browser = launch_browser()?;
        let tab = browser
            .new_tab()
            .map_err(|e| RagError::Transient(format!("Failed to open browser tab: {e}")))?;

        self.navigate(&tab, &url).await?;

        // Some documentation portals wrap the real page in a single
        // full-height iframe; follow it once so extraction sees the content.
        if let Some(inner) = self.inner_frame_url(&tab) {
            debug!("Following inner frame to {}", inner);
            if let Ok(inner_url) = Url::parse(&inner) {
                self.navigate(&tab, &inner_url).await?;
            }
        }

        self.scroll_to_stable(&tab).await;

        let html = tab
            .get_content()
            .map_err(|e| RagError::Transient(format!("Failed to read page content: {e}")))?;

        let text = extract_text(&html, &self.config.content_selectors);
        debug!(
            "Scraped {} into {} chars of text",
            url,
            text.chars().count()
        );
        Ok(text)
    }

    /// Navigate and wait for the page to settle, bounded by the configured
    /// network-idle timeout.
    async fn navigate(&self, tab: &Arc<Tab>, url: &Url) -> Result<()> {
        let timeout = Duration::from_secs(self.config.network_idle_timeout_seconds);

        tokio::time::timeout(timeout, async {
            tab.navigate_to(url.as_str())
                .map_err(|e| RagError::Transient(format!("Failed to navigate to {url}: {e}")))?;
            tab.wait_until_navigated().map_err(|e| {
                RagError::Transient(format!("Navigation to {url} did not complete: {e}"))
            })?;
            if let Err(e) = tab.wait_for_element("body") {
                warn!("Failed to wait for body element on {}: {}", url, e);
            }
            Ok::<(), RagError>(())
        })
        .await
        .map_err(|_| RagError::Transient(format!("Navigation to {url} timed out after {timeout:?}")))??;

        // Give client-side rendering a moment to populate the DOM.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        Ok(())
    }

    /// Detect a single dominant iframe wrapping the real content.
    fn inner_frame_url(&self, tab: &Arc<Tab>) -> Option<String> {
        let script = "(() => { \
            const frames = document.querySelectorAll('iframe'); \
            if (frames.length === 1 && frames[0].src && \
                frames[0].offsetHeight > window.innerHeight * 0.7) { \
                return frames[0].src; \
            } \
            return null; \
        })()";

        match tab.evaluate(script, false) {
            Ok(result) => result.value.and_then(|v| v.as_str().map(String::from)),
            Err(e) => {
                debug!("Inner frame detection failed: {}", e);
                None
            }
        }
    }

    /// Scroll to the bottom repeatedly until scrollHeight is stable for the
    /// configured number of steps, the text budget is exhausted, or the hard
    /// step cap is hit.
    async fn scroll_to_stable(&self, tab: &Arc<Tab>) {
        let mut last_height: i64 = -1;
        let mut stable_steps = 0usize;

        for _ in 0..MAX_SCROLL_STEPS {
            let height = match tab.evaluate(
                "window.scrollTo(0, document.body.scrollHeight); document.body.scrollHeight",
                false,
            ) {
                Ok(result) => result.value.and_then(|v| v.as_i64()).unwrap_or(0),
                Err(e) => {
                    debug!("Scroll step failed: {}", e);
                    break;
                }
            };

            if height == last_height {
                stable_steps += 1;
                if stable_steps >= self.config.scroll_stable_steps {
                    break;
                }
            } else {
                stable_steps = 0;
                last_height = height;
            }

            let traversed = tab
                .evaluate("document.body.innerText.length", false)
                .ok()
                .and_then(|r| r.value.and_then(|v| v.as_u64()))
                .unwrap_or(0) as usize;
            if traversed >= self.config.scroll_budget_bytes {
                debug!("Scroll budget of {} bytes reached", self.config.scroll_budget_bytes);
                break;
            }

            tokio::time::sleep(SCROLL_STEP_DELAY).await;
        }
    }
}

fn launch_browser() -> Result<Browser> {
    let args: Vec<&OsStr> = [
        "--no-sandbox",
        "--disable-dev-shm-usage",
        "--disable-gpu",
        "--disable-extensions",
        "--disable-images",
    ]
    .iter()
    .map(OsStr::new)
    .collect();

    let launch_options = LaunchOptions {
        headless: true,
        window_size: Some((1280, 720)),
        args,
        ..Default::default()
    };

    Browser::new(launch_options)
        .map_err(|e| RagError::Permanent(format!("Failed to launch headless browser: {e}")))
}

/// Extract plain text from rendered HTML, trying content selectors in order
/// before falling back to body text.
pub fn extract_text(html: &str, selectors: &[String]) -> String {
    let document = Html::parse_document(html);

    for selector_str in selectors {
        let Ok(selector) = Selector::parse(selector_str) else {
            warn!("Skipping invalid content selector: {}", selector_str);
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let text = element_text(element);
            if !text.trim().is_empty() {
                debug!("Extracted content via selector '{}'", selector_str);
                return text.trim().to_string();
            }
        }
    }

    // Body fallback, then the whole document for fragment inputs.
    if let Ok(body) = Selector::parse("body") {
        if let Some(body_el) = document.select(&body).next() {
            return element_text(body_el).trim().to_string();
        }
    }
    element_text(document.root_element()).trim().to_string()
}

fn element_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect_text(element, &mut out);
    out
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(el) = ElementRef::wrap(child) {
            let name = el.value().name();
            if SKIP_TAGS.contains(&name) {
                continue;
            }
            collect_text(el, out);
            if BLOCK_TAGS.contains(&name) && !out.ends_with('\n') {
                out.push('\n');
            }
        } else if let Some(text) = child.value().as_text() {
            out.push_str(text);
        }
    }
}
