use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use picsift_core::config::{LimitsSection, RateSection};
use picsift_core::discovery::{
    CancelToken, DiscoverOptions, DiscoveryError, DiscoveryOrchestrator, TopicStatus,
};
use picsift_core::extract::{ExtractError, ImageCandidate, PageSource};
use picsift_core::filter::{DimensionProbe, DownloadFilter};
use picsift_core::http::{FetchError, FetchResult, FetchedBytes, ResourceFetcher};
use picsift_core::limiter::RateLimiter;
use picsift_core::provenance::{ProvenanceRecorder, SkipReason};
use picsift_core::robots::{RobotsDecision, RobotsPolicy};
use picsift_core::scoring::RelevanceScorer;
use picsift_core::search::{
    CandidatePage, ProviderChain, SearchError, SearchProvider, SearchResult,
};
use picsift_core::ConfigBundle;

fn fixture_bundle() -> ConfigBundle {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
    ConfigBundle::from_directory(dir).expect("fixture configs parse")
}

struct MockProvider {
    key: &'static str,
    pages_by_topic: HashMap<String, Vec<String>>,
    failing_topics: HashSet<String>,
}

impl MockProvider {
    fn new(key: &'static str) -> Self {
        Self {
            key,
            pages_by_topic: HashMap::new(),
            failing_topics: HashSet::new(),
        }
    }

    fn with_pages(mut self, topic: &str, pages: &[&str]) -> Self {
        self.pages_by_topic
            .insert(topic.to_string(), pages.iter().map(|p| p.to_string()).collect());
        self
    }

    fn failing_for(mut self, topic: &str) -> Self {
        self.failing_topics.insert(topic.to_string());
        self
    }
}

#[async_trait]
impl SearchProvider for MockProvider {
    fn key(&self) -> &'static str {
        self.key
    }

    async fn search(&self, topic: &str, limit: usize) -> SearchResult<Vec<CandidatePage>> {
        if self.failing_topics.contains(topic) {
            return Err(SearchError::Malformed("provider outage".into()));
        }
        let pages = self.pages_by_topic.get(topic).cloned().unwrap_or_default();
        Ok(pages
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(idx, url)| CandidatePage {
                url,
                discovered_via_topic: topic.to_string(),
                rank: idx + 1,
            })
            .collect())
    }
}

struct MockPageSource {
    images_by_page: HashMap<String, Vec<ImageCandidate>>,
}

impl MockPageSource {
    fn new() -> Self {
        Self {
            images_by_page: HashMap::new(),
        }
    }

    fn with_images(mut self, page: &str, images: &[(&str, Option<&str>)]) -> Self {
        self.images_by_page.insert(
            page.to_string(),
            images
                .iter()
                .map(|(url, alt)| ImageCandidate {
                    url: url.to_string(),
                    alt_text: alt.map(String::from),
                    context_text: None,
                })
                .collect(),
        );
        self
    }
}

#[async_trait]
impl PageSource for MockPageSource {
    async fn images(&self, page_url: &str) -> Result<Vec<ImageCandidate>, ExtractError> {
        match self.images_by_page.get(page_url) {
            Some(images) => Ok(images.clone()),
            None => Err(ExtractError::BaseUrl(format!("unknown page {page_url}"))),
        }
    }
}

struct MockRobots {
    denied_pages: HashSet<String>,
}

impl MockRobots {
    fn allowing() -> Self {
        Self {
            denied_pages: HashSet::new(),
        }
    }

    fn denying(pages: &[&str]) -> Self {
        Self {
            denied_pages: pages.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[async_trait]
impl RobotsPolicy for MockRobots {
    async fn allowed_for_page(&self, url: &str) -> RobotsDecision {
        if self.denied_pages.contains(url) {
            RobotsDecision::Denied
        } else {
            RobotsDecision::Allowed
        }
    }

    async fn allowed_for_resource(&self, _url: &str) -> RobotsDecision {
        RobotsDecision::Allowed
    }
}

struct MockFetcher {
    bodies: HashMap<String, Vec<u8>>,
}

impl MockFetcher {
    fn serving(urls: &[&str]) -> Self {
        Self {
            bodies: urls
                .iter()
                .map(|url| (url.to_string(), b"imagebytes".to_vec()))
                .collect(),
        }
    }
}

#[async_trait]
impl ResourceFetcher for MockFetcher {
    async fn fetch_resource(&self, url: &str) -> FetchResult<FetchedBytes> {
        match self.bodies.get(url) {
            Some(bytes) => Ok(FetchedBytes {
                status: 200,
                final_url: url.to_string(),
                content_type: Some("image/jpeg".into()),
                bytes: bytes.clone(),
            }),
            None => Err(FetchError::Status {
                status: reqwest::StatusCode::NOT_FOUND,
                url: url.to_string(),
            }),
        }
    }
}

struct MockProbe {
    dims: HashMap<String, (u32, u32)>,
}

impl MockProbe {
    fn new(entries: &[(&str, (u32, u32))]) -> Self {
        Self {
            dims: entries
                .iter()
                .map(|(url, dims)| (url.to_string(), *dims))
                .collect(),
        }
    }
}

#[async_trait]
impl DimensionProbe for MockProbe {
    async fn dimensions(&self, image_url: &str) -> Option<(u32, u32)> {
        self.dims.get(image_url).copied()
    }
}

struct Harness {
    providers: Vec<Arc<dyn SearchProvider>>,
    pages: MockPageSource,
    robots: MockRobots,
    fetcher: MockFetcher,
    probe: MockProbe,
    logs_dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            providers: Vec::new(),
            pages: MockPageSource::new(),
            robots: MockRobots::allowing(),
            fetcher: MockFetcher::serving(&[]),
            probe: MockProbe::new(&[]),
            logs_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn logs_path(&self) -> std::path::PathBuf {
        self.logs_dir.path().to_path_buf()
    }

    fn build(self) -> (DiscoveryOrchestrator, tempfile::TempDir) {
        let bundle = fixture_bundle();
        let limiter = Arc::new(RateLimiter::new(
            &RateSection {
                default_capacity: 1000,
                default_per_second: 100_000.0,
                slow_acquire_warn_ms: 60_000,
            },
            HashMap::new(),
        ));
        let limits = LimitsSection {
            max_concurrent_topics: 4,
            max_concurrent_pages: 4,
            max_concurrent_downloads: 4,
            max_pages_per_query: 20,
            default_image_limit: 50,
        };
        let orchestrator = DiscoveryOrchestrator::new(
            ProviderChain::new(self.providers, limiter),
            Arc::new(self.pages),
            Arc::new(self.robots),
            Arc::new(self.fetcher),
            Arc::new(self.probe),
            Arc::new(ProvenanceRecorder::new(self.logs_dir.path())),
            RelevanceScorer::new(&bundle.discovery.scoring),
            limits,
        );
        (orchestrator, self.logs_dir)
    }
}

#[tokio::test]
async fn robots_denied_page_is_skipped_and_logged() {
    let mut harness = Harness::new();
    harness.providers.push(Arc::new(
        MockProvider::new("duckduckgo").with_pages(
            "fuji",
            &[
                "https://allowed.example/gallery",
                "https://blocked.example/private",
            ],
        ),
    ));
    harness.pages = MockPageSource::new()
        .with_images(
            "https://allowed.example/gallery",
            &[("https://img.example/fuji-summit.jpg", Some("Mount Fuji"))],
        )
        .with_images(
            "https://blocked.example/private",
            &[("https://img.example/secret.jpg", None)],
        );
    harness.robots = MockRobots::denying(&["https://blocked.example/private"]);
    let logs = harness.logs_path();
    let (orchestrator, _guard) = harness.build();

    let preview = orchestrator
        .discover(&["fuji".to_string()], 10)
        .await
        .unwrap();

    assert_eq!(preview.entries.len(), 1);
    assert_eq!(
        preview.entries[0].source_page_url,
        "https://allowed.example/gallery"
    );
    assert!(preview
        .entries
        .iter()
        .all(|entry| entry.source_page_url != "https://blocked.example/private"));

    let log_path = logs.join(format!(
        "{}_fuji.json",
        chrono::Utc::now().format("%Y%m%d")
    ));
    let log = ProvenanceRecorder::read_topic_log(&log_path).await.unwrap();
    assert_eq!(log.skips.len(), 1);
    assert_eq!(log.skips[0].url, "https://blocked.example/private");
    assert_eq!(log.skips[0].reason, SkipReason::RobotsDenied);
    assert_eq!(log.queries.len(), 1);
    assert_eq!(log.queries[0].provider, "duckduckgo");
    assert_eq!(log.queries[0].query, "fuji images");
    assert_eq!(log.queries[0].image_count, 1);
}

#[tokio::test]
async fn shared_image_across_topics_dedups_with_topic_union() {
    let mut harness = Harness::new();
    harness.providers.push(Arc::new(
        MockProvider::new("duckduckgo")
            .with_pages("fuji", &["https://a.example/fuji"])
            .with_pages("mtfuji", &["https://b.example/mtfuji"]),
    ));
    harness.pages = MockPageSource::new()
        .with_images(
            "https://a.example/fuji",
            &[
                ("https://img.example/shared.jpg", Some("fuji")),
                ("https://img.example/only-a.jpg", None),
            ],
        )
        .with_images(
            "https://b.example/mtfuji",
            &[("https://img.example/shared.jpg", Some("mtfuji"))],
        );
    let (orchestrator, _guard) = harness.build();

    let preview = orchestrator
        .discover(&["fuji".to_string(), "mtfuji".to_string()], 10)
        .await
        .unwrap();

    assert_eq!(preview.total_found, 3);
    assert_eq!(preview.total_after_dedup, 2);
    assert!(preview.total_after_dedup < preview.total_found);

    let shared = preview
        .entries
        .iter()
        .find(|entry| entry.image_url.ends_with("shared.jpg"))
        .unwrap();
    assert!(shared.topics.contains(&"fuji".to_string()));
    assert!(shared.topics.contains(&"mtfuji".to_string()));
}

#[tokio::test]
async fn every_discovered_image_carries_full_provenance() {
    let mut harness = Harness::new();
    harness.providers.push(Arc::new(
        MockProvider::new("duckduckgo").with_pages("fuji", &["https://a.example/fuji"]),
    ));
    harness.pages = MockPageSource::new().with_images(
        "https://a.example/fuji",
        &[
            ("https://img.example/one.jpg", Some("Mount Fuji photo")),
            ("https://img.example/two.png", None),
        ],
    );
    let (orchestrator, _guard) = harness.build();

    let preview = orchestrator
        .discover(&["fuji".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(preview.entries.len(), 2);
    for entry in &preview.entries {
        assert!(!entry.source_page_url.is_empty());
        assert!(!entry.image_url.is_empty());
        assert!(!entry.topics.is_empty());
        assert!((0.0..=1.0).contains(&entry.relevance_score));
    }
}

#[tokio::test]
async fn provider_outage_is_isolated_per_topic() {
    let mut harness = Harness::new();
    harness.providers.push(Arc::new(
        MockProvider::new("duckduckgo")
            .with_pages("fuji", &["https://a.example/fuji"])
            .failing_for("storm"),
    ));
    harness.pages = MockPageSource::new().with_images(
        "https://a.example/fuji",
        &[("https://img.example/one.jpg", None)],
    );
    let (orchestrator, _guard) = harness.build();

    let preview = orchestrator
        .discover(&["storm".to_string(), "fuji".to_string()], 10)
        .await
        .unwrap();

    let storm = preview
        .summaries
        .iter()
        .find(|s| s.topic == "storm")
        .unwrap();
    let fuji = preview
        .summaries
        .iter()
        .find(|s| s.topic == "fuji")
        .unwrap();
    assert_eq!(storm.status, TopicStatus::Failed);
    assert_eq!(storm.found, 0);
    assert_eq!(fuji.status, TopicStatus::Done);
    assert_eq!(fuji.found, 1);
    assert_eq!(preview.entries.len(), 1);
}

#[tokio::test]
async fn empty_topic_is_the_only_hard_failure() {
    let (orchestrator, _guard) = {
        let mut harness = Harness::new();
        harness
            .providers
            .push(Arc::new(MockProvider::new("duckduckgo")));
        harness.build()
    };
    let result = orchestrator
        .discover(&["fuji".to_string(), "   ".to_string()], 10)
        .await;
    assert!(matches!(result, Err(DiscoveryError::InvalidTopic(_))));
}

#[tokio::test]
async fn per_topic_limit_caps_collected_entries() {
    let mut harness = Harness::new();
    harness.providers.push(Arc::new(
        MockProvider::new("duckduckgo").with_pages("fuji", &["https://a.example/fuji"]),
    ));
    harness.pages = MockPageSource::new().with_images(
        "https://a.example/fuji",
        &[
            ("https://img.example/1.jpg", None),
            ("https://img.example/2.jpg", None),
            ("https://img.example/3.jpg", None),
            ("https://img.example/4.jpg", None),
        ],
    );
    let (orchestrator, _guard) = harness.build();
    let preview = orchestrator
        .discover(&["fuji".to_string()], 2)
        .await
        .unwrap();
    assert_eq!(preview.entries.len(), 2);
}

#[tokio::test]
async fn pre_cancelled_run_abandons_extraction_but_still_reports() {
    let mut harness = Harness::new();
    harness.providers.push(Arc::new(
        MockProvider::new("duckduckgo").with_pages("fuji", &["https://a.example/fuji"]),
    ));
    harness.pages = MockPageSource::new().with_images(
        "https://a.example/fuji",
        &[("https://img.example/1.jpg", None)],
    );
    let logs = harness.logs_path();
    let (orchestrator, _guard) = harness.build();

    let (handle, token) = CancelToken::pair();
    handle.cancel();
    let preview = orchestrator
        .discover_with_options(
            &["fuji".to_string()],
            10,
            DiscoverOptions {
                respect_robots: true,
                cancel: token,
            },
        )
        .await
        .unwrap();

    assert!(preview.entries.is_empty());
    assert_eq!(preview.summaries[0].status, TopicStatus::Cancelled);

    let log_path = logs.join(format!(
        "{}_fuji.json",
        chrono::Utc::now().format("%Y%m%d")
    ));
    let log = ProvenanceRecorder::read_topic_log(&log_path).await.unwrap();
    assert!(log.early_termination);
}

#[tokio::test]
async fn repeated_runs_replay_the_same_query_sequence() {
    let build = || {
        let mut harness = Harness::new();
        harness.providers.push(Arc::new(
            MockProvider::new("duckduckgo").failing_for("fuji"),
        ));
        harness.providers.push(Arc::new(
            MockProvider::new("html_serp").with_pages("fuji", &["https://a.example/fuji"]),
        ));
        harness.pages = MockPageSource::new().with_images(
            "https://a.example/fuji",
            &[("https://img.example/1.jpg", None)],
        );
        let logs = harness.logs_path();
        (harness.build(), logs)
    };

    let mut sequences = Vec::new();
    for _ in 0..2 {
        let ((orchestrator, _guard), logs) = build();
        orchestrator
            .discover(&["fuji".to_string()], 10)
            .await
            .unwrap();
        let log_path = logs.join(format!(
            "{}_fuji.json",
            chrono::Utc::now().format("%Y%m%d")
        ));
        let log = ProvenanceRecorder::read_topic_log(&log_path).await.unwrap();
        let sequence: Vec<(String, String, Option<String>)> = log
            .queries
            .iter()
            .map(|q| (q.provider.clone(), q.query.clone(), q.error.clone()))
            .collect();
        sequences.push(sequence);
    }
    assert_eq!(sequences[0], sequences[1]);
    assert_eq!(sequences[0].len(), 2, "failed attempt then fallback");
    assert_eq!(sequences[0][0].0, "duckduckgo");
    assert!(sequences[0][0].2.is_some());
    assert_eq!(sequences[0][1].0, "html_serp");
}

#[tokio::test]
async fn min_width_download_fails_closed_on_unknown_dimensions() {
    let mut harness = Harness::new();
    harness.providers.push(Arc::new(
        MockProvider::new("duckduckgo").with_pages("fuji", &["https://a.example/fuji"]),
    ));
    harness.pages = MockPageSource::new().with_images(
        "https://a.example/fuji",
        &[
            ("https://img.example/wide.jpg", None),
            ("https://img.example/narrow.jpg", None),
            ("https://img.example/mystery.jpg", None),
        ],
    );
    harness.fetcher = MockFetcher::serving(&[
        "https://img.example/wide.jpg",
        "https://img.example/narrow.jpg",
        "https://img.example/mystery.jpg",
    ]);
    harness.probe = MockProbe::new(&[
        ("https://img.example/wide.jpg", (1024, 768)),
        ("https://img.example/narrow.jpg", (640, 480)),
    ]);
    let (orchestrator, _guard) = harness.build();

    let preview = orchestrator
        .discover(&["fuji".to_string()], 10)
        .await
        .unwrap();
    assert_eq!(preview.entries.len(), 3);

    let out_dir = tempfile::tempdir().unwrap();
    let selection: HashSet<String> = preview
        .entries
        .iter()
        .map(|entry| entry.image_url.clone())
        .collect();
    let filter = DownloadFilter {
        min_width: Some(800),
        ..Default::default()
    };
    let result = orchestrator
        .select_and_download(&preview, &selection, &filter, out_dir.path())
        .await
        .unwrap();

    assert_eq!(result.saved.len(), 1);
    assert!(result.saved[0].image_url.ends_with("wide.jpg"));
    assert_eq!(result.failed.len(), 2);
    assert!(result
        .failed
        .iter()
        .all(|skip| skip.reason == SkipReason::FilterRejected));

    let raw = std::fs::read(&result.provenance_index_path).unwrap();
    let index: Vec<picsift_core::IndexRecord> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(index.len(), result.saved.len());
}

#[tokio::test]
async fn preview_serializes_to_json_and_back() {
    let mut harness = Harness::new();
    harness.providers.push(Arc::new(
        MockProvider::new("duckduckgo").with_pages("fuji", &["https://a.example/fuji"]),
    ));
    harness.pages = MockPageSource::new().with_images(
        "https://a.example/fuji",
        &[("https://img.example/1.jpg", Some("fuji"))],
    );
    let (orchestrator, _guard) = harness.build();
    let preview = orchestrator
        .discover(&["fuji".to_string()], 10)
        .await
        .unwrap();

    let json = serde_json::to_string(&preview).unwrap();
    let restored: picsift_core::PreviewResult = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.entries.len(), preview.entries.len());
    assert_eq!(restored.total_after_dedup, preview.total_after_dedup);
}
