use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{DiscoveryConfig, LimitsSection, PicsiftConfig};
use crate::dedup::{merge, normalize_image_url};
use crate::download::{DownloadResult, Downloader, StorageError};
use crate::extract::{ImageCandidate, PageExtractor, PageSource};
use crate::filter::{DimensionProbe, DownloadFilter, FilterPipeline, HttpDimensionProbe};
use crate::http::{FetchError, HttpClient, ResourceFetcher, RetryPolicy};
use crate::limiter::RateLimiter;
use crate::provenance::{
    DiscoveryMethod, ProvenanceEntry, ProvenanceRecorder, SkipReason, TopicLog,
};
use crate::robots::{RobotsDecision, RobotsGate, RobotsPolicy};
use crate::scoring::{domain_from_url, filename_from_url, RelevanceScorer, RelevanceSignals};
use crate::search::{
    DuckDuckGoProvider, HtmlSerpFallbackProvider, ProviderChain, ProviderKind, SearchProvider,
};

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid topic {0:?}: topics must be non-empty")]
    InvalidTopic(String),
    #[error("no search providers configured")]
    NoProviders,
    #[error("page blocked by robots.txt: {0}")]
    RobotsBlocked(String),
    #[error("failed to build http client: {0}")]
    Build(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Cooperative cancellation signal. Workers poll it between units of work and
/// abandon in-flight page extractions when it fires.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelToken {
    pub fn pair() -> (CancelHandle, CancelToken) {
        let (sender, receiver) = watch::channel(false);
        (CancelHandle { sender }, CancelToken { receiver })
    }

    /// A token that never fires.
    pub fn never() -> CancelToken {
        Self::pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow() {
                return;
            }
            if receiver.changed().await.is_err() {
                // Handle dropped without firing: never cancel.
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    /// Deadline support: fire the token after `delay`.
    pub fn cancel_after(self, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = self.sender.send(true);
        });
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub respect_robots: bool,
    pub cancel: CancelToken,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            respect_robots: true,
            cancel: CancelToken::never(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    Done,
    Failed,
    Cancelled,
}

impl TopicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicStatus::Done => "done",
            TopicStatus::Failed => "failed",
            TopicStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TopicSummary {
    pub topic: String,
    pub status: TopicStatus,
    pub found: usize,
}

/// Result of one discovery run: the merged, provenance-tagged image set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PreviewResult {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub topics: Vec<String>,
    pub summaries: Vec<TopicSummary>,
    pub entries: Vec<ProvenanceEntry>,
    pub total_found: usize,
    pub total_after_dedup: usize,
}

struct TopicOutcome {
    topic: String,
    status: TopicStatus,
    entries: Vec<ProvenanceEntry>,
}

enum PageOutcome {
    Images(String, Vec<ImageCandidate>),
    Skip(String, SkipReason, Option<String>),
    Aborted,
}

/// Top-level coordinator for one discovery run. All collaborators are
/// explicit, constructed once and passed in; there is no process-wide state.
pub struct DiscoveryOrchestrator {
    chain: ProviderChain,
    pages: Arc<dyn PageSource>,
    robots: Arc<dyn RobotsPolicy>,
    fetcher: Arc<dyn ResourceFetcher>,
    probe: Arc<dyn DimensionProbe>,
    recorder: Arc<ProvenanceRecorder>,
    scorer: RelevanceScorer,
    limits: LimitsSection,
}

impl DiscoveryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: ProviderChain,
        pages: Arc<dyn PageSource>,
        robots: Arc<dyn RobotsPolicy>,
        fetcher: Arc<dyn ResourceFetcher>,
        probe: Arc<dyn DimensionProbe>,
        recorder: Arc<ProvenanceRecorder>,
        scorer: RelevanceScorer,
        limits: LimitsSection,
    ) -> Self {
        Self {
            chain,
            pages,
            robots,
            fetcher,
            probe,
            recorder,
            scorer,
            limits,
        }
    }

    /// Wire up the real collaborators from configuration.
    pub fn from_configs(
        picsift: &PicsiftConfig,
        discovery: &DiscoveryConfig,
    ) -> DiscoveryResult<Self> {
        let retry = RetryPolicy::new(&discovery.retry);
        let http = Arc::new(HttpClient::new(&picsift.network, retry)?);
        let limiter = Arc::new(RateLimiter::from_config(discovery));

        let mut providers: Vec<Arc<dyn SearchProvider>> = Vec::new();
        for name in &discovery.providers.order {
            match name.parse::<ProviderKind>() {
                Ok(ProviderKind::Duckduckgo) => {
                    providers.push(Arc::new(DuckDuckGoProvider::new(Arc::clone(&http))));
                }
                Ok(ProviderKind::HtmlSerp) => {
                    providers.push(Arc::new(HtmlSerpFallbackProvider::new(Arc::clone(&http))));
                }
                Err(error) => warn!(provider = %name, %error, "skipping unknown provider"),
            }
        }
        if providers.is_empty() {
            return Err(DiscoveryError::NoProviders);
        }

        Ok(Self::new(
            ProviderChain::new(providers, limiter),
            Arc::new(PageExtractor::new(
                Arc::clone(&http),
                discovery.scoring.context_window_chars,
            )),
            Arc::new(RobotsGate::new(Arc::clone(&http), &discovery.robots)),
            Arc::clone(&http) as Arc<dyn ResourceFetcher>,
            Arc::new(HttpDimensionProbe::new(Arc::clone(&http))),
            Arc::new(ProvenanceRecorder::new(PathBuf::from(
                &picsift.paths.discovery_logs_dir,
            ))),
            RelevanceScorer::new(&discovery.scoring),
            picsift.limits.clone(),
        ))
    }

    pub async fn discover(
        &self,
        topics: &[String],
        limit: usize,
    ) -> DiscoveryResult<PreviewResult> {
        self.discover_with_options(topics, limit, DiscoverOptions::default())
            .await
    }

    /// Run discovery for every topic: provider chain, robots gate, extraction,
    /// scoring, provenance accumulation, per-topic log, cross-topic dedup.
    /// One topic failing never aborts its siblings; the only hard failure is
    /// an empty topic string.
    pub async fn discover_with_options(
        &self,
        topics: &[String],
        limit: usize,
        options: DiscoverOptions,
    ) -> DiscoveryResult<PreviewResult> {
        let mut cleaned = Vec::with_capacity(topics.len());
        for topic in topics {
            let trimmed = topic.trim();
            if trimmed.is_empty() {
                return Err(DiscoveryError::InvalidTopic(topic.clone()));
            }
            cleaned.push(trimmed.to_string());
        }

        let run_id = Uuid::new_v4();
        let date = Utc::now().format("%Y%m%d").to_string();
        info!(
            run_id = %run_id,
            topics = cleaned.len(),
            limit,
            respect_robots = options.respect_robots,
            "discovery run started"
        );

        let page_permits = Arc::new(Semaphore::new(self.limits.max_concurrent_pages.max(1)));
        let outcomes: Vec<TopicOutcome> = stream::iter(cleaned.iter().cloned())
            .map(|topic| {
                let options = options.clone();
                let permits = Arc::clone(&page_permits);
                let date = date.clone();
                async move {
                    self.discover_topic(topic, limit, run_id, &date, options, permits)
                        .await
                }
            })
            .buffered(self.limits.max_concurrent_topics.max(1))
            .collect()
            .await;

        let total_found: usize = outcomes.iter().map(|o| o.entries.len()).sum();
        let summaries: Vec<TopicSummary> = outcomes
            .iter()
            .map(|outcome| TopicSummary {
                topic: outcome.topic.clone(),
                status: outcome.status,
                found: outcome.entries.len(),
            })
            .collect();
        let entries = merge(outcomes.into_iter().map(|o| o.entries).collect());

        info!(
            run_id = %run_id,
            total_found,
            total_after_dedup = entries.len(),
            "discovery run finished"
        );
        Ok(PreviewResult {
            run_id,
            generated_at: Utc::now(),
            topics: cleaned,
            summaries,
            total_found,
            total_after_dedup: entries.len(),
            entries,
        })
    }

    async fn discover_topic(
        &self,
        topic: String,
        limit: usize,
        run_id: Uuid,
        date: &str,
        options: DiscoverOptions,
        permits: Arc<Semaphore>,
    ) -> TopicOutcome {
        let mut log = TopicLog::new(&topic, run_id, date);

        let chain_outcome = self
            .chain
            .search(&topic, self.limits.max_pages_per_query)
            .await;
        for attempt in &chain_outcome.attempts {
            log.record_query(
                &attempt.provider,
                &attempt.query,
                attempt.page_count,
                0,
                attempt.error.clone(),
            );
        }
        let provider_failed = !chain_outcome.attempts.is_empty()
            && chain_outcome
                .attempts
                .iter()
                .all(|attempt| attempt.error.is_some());

        // Ordered fan-out: pages fetch concurrently under the shared permit
        // pool, results fold back in SERP order so logs stay deterministic.
        let page_results: Vec<PageOutcome> = stream::iter(chain_outcome.pages.iter())
            .map(|page| {
                let options = options.clone();
                let permits = Arc::clone(&permits);
                async move {
                    if options.cancel.is_cancelled() {
                        return PageOutcome::Aborted;
                    }
                    if options.respect_robots {
                        match self.robots.allowed_for_page(&page.url).await {
                            RobotsDecision::Denied => {
                                return PageOutcome::Skip(
                                    page.url.clone(),
                                    SkipReason::RobotsDenied,
                                    None,
                                );
                            }
                            RobotsDecision::UnreachableDenied => {
                                return PageOutcome::Skip(
                                    page.url.clone(),
                                    SkipReason::RobotsUnreachable,
                                    None,
                                );
                            }
                            RobotsDecision::Allowed | RobotsDecision::UnreachableAllowed => {}
                        }
                    }
                    let Ok(_permit) = permits.acquire().await else {
                        return PageOutcome::Aborted;
                    };
                    tokio::select! {
                        _ = options.cancel.cancelled() => PageOutcome::Aborted,
                        extraction = self.pages.images(&page.url) => match extraction {
                            Ok(images) => PageOutcome::Images(page.url.clone(), images),
                            Err(err) => PageOutcome::Skip(
                                page.url.clone(),
                                SkipReason::ExtractionFailed,
                                Some(err.to_string()),
                            ),
                        },
                    }
                }
            })
            .buffered(self.limits.max_concurrent_pages.max(1))
            .collect()
            .await;

        let mut entries: Vec<ProvenanceEntry> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cancelled = false;
        for outcome in page_results {
            match outcome {
                PageOutcome::Aborted => cancelled = true,
                PageOutcome::Skip(url, reason, detail) => {
                    warn!(topic = %topic, url = %url, reason = %reason, "page skipped");
                    log.record_skip(&url, reason, detail);
                }
                PageOutcome::Images(page_url, images) => {
                    for candidate in images {
                        if entries.len() >= limit {
                            break;
                        }
                        // image_url unique within one topic's set prior to merge
                        if !seen.insert(normalize_image_url(&candidate.url)) {
                            continue;
                        }
                        entries.push(self.entry_for(&topic, &page_url, candidate));
                    }
                }
            }
        }

        // The successful provider attempt gets the final harvest count.
        if let Some(query) = log
            .queries
            .iter_mut()
            .rev()
            .find(|query| query.error.is_none() && query.page_count > 0)
        {
            query.image_count = entries.len();
        }
        log.early_termination = cancelled;
        log.entries = entries.clone();
        if let Err(error) = self.recorder.write_topic_log(&log).await {
            warn!(topic = %topic, %error, "failed to write topic log");
        }

        let status = if cancelled {
            TopicStatus::Cancelled
        } else if provider_failed {
            TopicStatus::Failed
        } else {
            TopicStatus::Done
        };
        info!(
            topic = %topic,
            status = status.as_str(),
            found = entries.len(),
            "topic finished"
        );
        TopicOutcome {
            topic,
            status,
            entries,
        }
    }

    fn entry_for(&self, topic: &str, page_url: &str, candidate: ImageCandidate) -> ProvenanceEntry {
        let filename = filename_from_url(&candidate.url);
        let domain = domain_from_url(&candidate.url);
        let score = self.scorer.score(
            topic,
            &RelevanceSignals {
                alt_text: candidate.alt_text.as_deref(),
                filename: filename.as_deref(),
                context_text: candidate.context_text.as_deref(),
                domain: domain.as_deref(),
            },
        );
        ProvenanceRecorder::record_image(
            topic,
            page_url,
            &candidate.url,
            DiscoveryMethod::Serp,
            score,
            candidate.alt_text,
            filename,
            candidate.context_text,
        )
    }

    /// Consume a preview: select by normalized image URL, filter, download,
    /// index. Filter rejections and per-image failures land in
    /// `DownloadResult.failed`; only an unusable output directory is fatal.
    pub async fn select_and_download(
        &self,
        preview: &PreviewResult,
        selection: &HashSet<String>,
        filter: &DownloadFilter,
        out_dir: &Path,
    ) -> DiscoveryResult<DownloadResult> {
        let selected_keys: HashSet<String> =
            selection.iter().map(|url| normalize_image_url(url)).collect();
        let selected: Vec<ProvenanceEntry> = preview
            .entries
            .iter()
            .filter(|entry| selected_keys.contains(&normalize_image_url(&entry.image_url)))
            .cloned()
            .collect();
        info!(
            requested = selection.len(),
            selected = selected.len(),
            out_dir = %out_dir.display(),
            "download selection resolved"
        );

        let pipeline = FilterPipeline::new(Arc::clone(&self.probe));
        let filtered = pipeline.apply(selected, filter).await;

        let downloader = Downloader::new(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.robots),
            self.limits.max_concurrent_downloads,
        );
        let mut result = downloader
            .download_batch(&filtered.kept, out_dir, true)
            .await?;
        let mut failed = filtered.rejected;
        failed.append(&mut result.failed);
        result.failed = failed;
        Ok(result)
    }

    /// Direct single-page scrape, bypassing search: extract, record with
    /// direct-url provenance, download everything found.
    pub async fn scrape_page(
        &self,
        page_url: &str,
        out_dir: &Path,
        limit: Option<usize>,
        options: DiscoverOptions,
    ) -> DiscoveryResult<DownloadResult> {
        if options.respect_robots {
            let decision = self.robots.allowed_for_page(page_url).await;
            if !decision.is_allowed() {
                return Err(DiscoveryError::RobotsBlocked(page_url.to_string()));
            }
        }

        let topic = domain_from_url(page_url).unwrap_or_else(|| page_url.to_string());
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        match self.pages.images(page_url).await {
            Ok(images) => {
                for candidate in images {
                    if let Some(cap) = limit {
                        if entries.len() >= cap {
                            break;
                        }
                    }
                    if !seen.insert(normalize_image_url(&candidate.url)) {
                        continue;
                    }
                    let filename = filename_from_url(&candidate.url);
                    entries.push(ProvenanceRecorder::record_image(
                        &topic,
                        page_url,
                        &candidate.url,
                        DiscoveryMethod::DirectUrl,
                        0.0,
                        candidate.alt_text,
                        filename,
                        candidate.context_text,
                    ));
                }
            }
            Err(error) => {
                warn!(url = %page_url, %error, "direct scrape extraction failed");
            }
        }

        let downloader = Downloader::new(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.robots),
            self.limits.max_concurrent_downloads,
        );
        Ok(downloader
            .download_batch(&entries, out_dir, options.respect_robots)
            .await?)
    }
}
