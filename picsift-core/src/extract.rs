use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::http::{FetchError, HttpClient};

pub type ExtractResult<T> = Result<T, ExtractError>;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to fetch page: {0}")]
    Fetch(#[from] FetchError),
    #[error("page has no usable base url: {0}")]
    BaseUrl(String),
}

/// One raw image reference lifted from a page, with the local signals the
/// scorer consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    /// Absolute, normalized URL.
    pub url: String,
    pub alt_text: Option<String>,
    pub context_text: Option<String>,
}

/// Seam between the orchestrator and the fetch+parse pair, so discovery logic
/// is testable without a network.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn images(&self, page_url: &str) -> ExtractResult<Vec<ImageCandidate>>;
}

/// Fetches a page and extracts `<img>` references: src/data-src/data-original
/// attributes, normalized to absolute URLs, extension-filtered, deduplicated
/// in document order, with alt text and nearby context attached.
pub struct PageExtractor {
    http: Arc<HttpClient>,
    context_window: usize,
}

fn image_ext_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\.(?:png|jpe?g|gif|webp|svg)(?:\?.*)?$").expect("static image pattern")
    })
}

pub fn is_image_url(url: &str) -> bool {
    if image_ext_pattern().is_match(url) {
        return true;
    }
    let path = url.split('?').next().unwrap_or(url).to_lowercase();
    [".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg"]
        .iter()
        .any(|ext| path.ends_with(ext))
}

impl PageExtractor {
    pub fn new(http: Arc<HttpClient>, context_window: usize) -> Self {
        Self {
            http,
            context_window,
        }
    }

    pub fn extract_from_html(&self, html: &str, base_url: &str) -> ExtractResult<Vec<ImageCandidate>> {
        let base =
            Url::parse(base_url).map_err(|err| ExtractError::BaseUrl(format!("{base_url}: {err}")))?;
        let document = Html::parse_document(html);
        let img_selector = Selector::parse("img").expect("static selector");

        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();
        for element in document.select(&img_selector) {
            let src = element
                .value()
                .attr("src")
                .or_else(|| element.value().attr("data-src"))
                .or_else(|| element.value().attr("data-original"));
            let Some(src) = src else { continue };
            let Some(url) = normalize_source(src, &base) else {
                continue;
            };
            if !seen.insert(url.clone()) {
                continue;
            }
            if !is_image_url(&url) {
                continue;
            }

            let alt_text = element
                .value()
                .attr("alt")
                .map(str::trim)
                .filter(|alt| !alt.is_empty())
                .map(str::to_string);
            let context_text = surrounding_text(element, self.context_window);

            candidates.push(ImageCandidate {
                url,
                alt_text,
                context_text,
            });
        }
        debug!(base = %base, images = candidates.len(), "extracted image candidates");
        Ok(candidates)
    }
}

#[async_trait]
impl PageSource for PageExtractor {
    async fn images(&self, page_url: &str) -> ExtractResult<Vec<ImageCandidate>> {
        let page = self.http.fetch_text(page_url).await?;
        // Redirects may have moved the page; resolve relatives against where
        // the content actually came from.
        self.extract_from_html(&page.body, &page.final_url)
    }
}

fn normalize_source(src: &str, base: &Url) -> Option<String> {
    let src = src.trim();
    if src.is_empty() {
        return None;
    }
    if let Some(rest) = src.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    if src.starts_with("http://") || src.starts_with("https://") {
        return Some(src.to_string());
    }
    base.join(src).ok().map(String::from)
}

/// Text of the nearest ancestor that says something: up to three levels,
/// first one with more than 10 chars wins, truncated to the window.
fn surrounding_text(element: ElementRef<'_>, window: usize) -> Option<String> {
    let mut node = element.parent()?;
    for _ in 0..3 {
        if let Some(parent) = ElementRef::wrap(node) {
            let text = parent
                .text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            if text.chars().count() > 10 {
                return Some(text.chars().take(window).collect());
            }
        }
        node = node.parent()?;
    }
    None
}
