use std::sync::Arc;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::trace;
use url::Url;

use crate::http::HttpClient;

use super::{build_query, normalize_candidates, CandidatePage, SearchProvider, SearchResult};

/// DuckDuckGo's HTML SERP endpoint. No API key, stable result markup, and the
/// ranked order of the page is the ranked order we report.
pub struct DuckDuckGoProvider {
    http: Arc<HttpClient>,
}

impl DuckDuckGoProvider {
    pub const KEY: &'static str = "duckduckgo";

    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }

    fn query_url(topic: &str) -> String {
        let encoded: String =
            url::form_urlencoded::byte_serialize(build_query(topic).as_bytes()).collect();
        format!("https://html.duckduckgo.com/html/?q={encoded}")
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoProvider {
    fn key(&self) -> &'static str {
        Self::KEY
    }

    async fn search(&self, topic: &str, limit: usize) -> SearchResult<Vec<CandidatePage>> {
        let url = Self::query_url(topic);
        trace!(url = %url, "opening search url");
        let page = self.http.fetch_text(&url).await?;
        let raw = parse_serp(&page.body, "a.result__a");
        Ok(normalize_candidates(topic, raw, limit))
    }
}

/// Fallback SERP: DuckDuckGo Lite, a plain-HTML table of results that tends
/// to survive markup changes on the main endpoint.
pub struct HtmlSerpFallbackProvider {
    http: Arc<HttpClient>,
}

impl HtmlSerpFallbackProvider {
    pub const KEY: &'static str = "html_serp";

    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }

    fn query_url(topic: &str) -> String {
        let encoded: String =
            url::form_urlencoded::byte_serialize(build_query(topic).as_bytes()).collect();
        format!("https://lite.duckduckgo.com/lite/?q={encoded}")
    }
}

#[async_trait]
impl SearchProvider for HtmlSerpFallbackProvider {
    fn key(&self) -> &'static str {
        Self::KEY
    }

    async fn search(&self, topic: &str, limit: usize) -> SearchResult<Vec<CandidatePage>> {
        let url = Self::query_url(topic);
        trace!(url = %url, "opening fallback search url");
        let page = self.http.fetch_text(&url).await?;
        let raw = parse_serp(&page.body, "a.result-link");
        Ok(normalize_candidates(topic, raw, limit))
    }
}

/// Pull result hrefs out of a SERP document in document order, unwrapping
/// DuckDuckGo's `/l/?uddg=` redirect links to the destination URL.
fn parse_serp(html: &str, anchor_selector: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(anchor_selector).expect("static selector");
    document
        .select(&selector)
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(decode_result_href)
        .collect()
}

fn decode_result_href(href: &str) -> Option<String> {
    let absolute = if let Some(rest) = href.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        href.to_string()
    };
    let parsed = Url::parse(&absolute).ok()?;
    let is_redirect = parsed
        .host_str()
        .map(|host| host.ends_with("duckduckgo.com"))
        .unwrap_or(false)
        && parsed.path().starts_with("/l/");
    if is_redirect {
        parsed
            .query_pairs()
            .find(|(key, _)| key == "uddg")
            .map(|(_, value)| value.into_owned())
    } else {
        Some(absolute)
    }
}
