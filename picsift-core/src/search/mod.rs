mod duckduckgo;

pub use duckduckgo::{DuckDuckGoProvider, HtmlSerpFallbackProvider};

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::http::FetchError;
use crate::limiter::RateLimiter;

pub type SearchResult<T> = Result<T, SearchError>;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("provider request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("provider returned an unreadable results page: {0}")]
    Malformed(String),
}

impl SearchError {
    /// Short classification recorded in the query log when an attempt fails.
    pub fn class(&self) -> &'static str {
        match self {
            SearchError::Fetch(inner) => inner.class(),
            SearchError::Malformed(_) => "malformed",
        }
    }
}

/// Closed set of provider variants, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Duckduckgo,
    HtmlSerp,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderKind::Duckduckgo => "duckduckgo",
            ProviderKind::HtmlSerp => "html_serp",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "duckduckgo" | "ddg" => Ok(ProviderKind::Duckduckgo),
            "html_serp" | "html-serp" => Ok(ProviderKind::HtmlSerp),
            other => Err(format!("unknown search provider: {other}")),
        }
    }
}

/// A page the provider believes may contain relevant images. Ephemeral:
/// created per search call, never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePage {
    pub url: String,
    pub discovered_via_topic: String,
    /// 1-based order as returned by the provider.
    pub rank: usize,
}

/// Provider capability interface: topic in, ordered candidate pages out.
/// Implementations must preserve the provider's ranked order so identical
/// responses yield identical sequences.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Stable identity: rate limiter key and query-log provider name.
    fn key(&self) -> &'static str;

    async fn search(&self, topic: &str, limit: usize) -> SearchResult<Vec<CandidatePage>>;
}

/// The exact query string sent for a topic.
pub fn build_query(topic: &str) -> String {
    format!("{topic} images")
}

/// Keep valid http(s) URLs, drop duplicates, assign ranks in arrival order.
pub(crate) fn normalize_candidates(
    topic: &str,
    raw: Vec<String>,
    limit: usize,
) -> Vec<CandidatePage> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut pages = Vec::new();
    for url in raw {
        if pages.len() >= limit {
            break;
        }
        if !is_valid_page_url(&url) {
            continue;
        }
        if !seen.insert(url.clone()) {
            continue;
        }
        pages.push(CandidatePage {
            rank: pages.len() + 1,
            url,
            discovered_via_topic: topic.to_string(),
        });
    }
    pages
}

fn is_valid_page_url(candidate: &str) -> bool {
    match url::Url::parse(candidate) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
        }
        Err(_) => false,
    }
}

/// One provider attempt as the chain saw it, for the query log.
#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    pub provider: String,
    pub query: String,
    pub page_count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChainOutcome {
    pub pages: Vec<CandidatePage>,
    pub attempts: Vec<ProviderAttempt>,
}

/// Explicit ordered fallback: providers are tried in sequence until one
/// yields a non-empty, non-error result. Every attempt is reported so the
/// caller can log it; errors are absorbed here, never propagated.
pub struct ProviderChain {
    providers: Vec<Arc<dyn SearchProvider>>,
    limiter: Arc<RateLimiter>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn SearchProvider>>, limiter: Arc<RateLimiter>) -> Self {
        Self { providers, limiter }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub async fn search(&self, topic: &str, limit: usize) -> ChainOutcome {
        let mut outcome = ChainOutcome::default();
        let query = build_query(topic);
        for provider in &self.providers {
            self.limiter.acquire(provider.key()).await;
            match provider.search(topic, limit).await {
                Ok(pages) if pages.is_empty() => {
                    info!(provider = provider.key(), topic, "provider returned no pages");
                    outcome.attempts.push(ProviderAttempt {
                        provider: provider.key().to_string(),
                        query: query.clone(),
                        page_count: 0,
                        error: None,
                    });
                }
                Ok(pages) => {
                    info!(
                        provider = provider.key(),
                        topic,
                        pages = pages.len(),
                        "provider search succeeded"
                    );
                    outcome.attempts.push(ProviderAttempt {
                        provider: provider.key().to_string(),
                        query: query.clone(),
                        page_count: pages.len(),
                        error: None,
                    });
                    outcome.pages = pages;
                    return outcome;
                }
                Err(err) => {
                    warn!(provider = provider.key(), topic, error = %err, "provider search failed");
                    outcome.attempts.push(ProviderAttempt {
                        provider: provider.key().to_string(),
                        query: query.clone(),
                        page_count: 0,
                        error: Some(err.class().to_string()),
                    });
                }
            }
        }
        outcome
    }
}
