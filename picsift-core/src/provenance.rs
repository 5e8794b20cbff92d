use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::scoring::RelevanceTier;

pub type ProvenanceResult<T> = Result<T, ProvenanceError>;

#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error("failed to write discovery log {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to encode discovery log: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProvenanceError {
    fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        ProvenanceError::Io {
            source,
            path: path.into(),
        }
    }
}

/// How an image reference was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Serp,
    Sitemap,
    DirectUrl,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::Serp => "serp",
            DiscoveryMethod::Sitemap => "sitemap",
            DiscoveryMethod::DirectUrl => "direct_url",
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded origin of one discovered image. Built once at extraction time and
/// never mutated afterwards; merging across topics only appends to `topics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProvenanceEntry {
    /// Every topic that surfaced this image; the first element discovered it.
    pub topics: Vec<String>,
    pub source_page_url: String,
    /// Normalized absolute URL; unique within one topic's result set.
    pub image_url: String,
    pub discovery_method: DiscoveryMethod,
    pub retrieved_at: DateTime<Utc>,
    pub relevance_score: f64,
    pub relevance_tier: RelevanceTier,
    pub alt_text: Option<String>,
    pub filename: Option<String>,
    pub context_text: Option<String>,
}

/// One executed (topic, provider, query) triple. The per-topic sequence is
/// ordered by issue time and replayable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QueryLogEntry {
    pub topic: String,
    pub provider: String,
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub page_count: usize,
    pub image_count: usize,
    /// Error class when the provider attempt failed; None on success.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    RobotsDenied,
    RobotsUnreachable,
    ExtractionFailed,
    FilterRejected,
    DownloadFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::RobotsDenied => "robots_denied",
            SkipReason::RobotsUnreachable => "robots_unreachable",
            SkipReason::ExtractionFailed => "extraction_failed",
            SkipReason::FilterRejected => "filter_rejected",
            SkipReason::DownloadFailed => "download_failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record for a URL excluded from a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SkipRecord {
    pub url: String,
    pub reason: SkipReason,
    pub detail: Option<String>,
}

/// Durable per-(date, topic) discovery document: the ordered query sequence,
/// every exclusion decision and the full provenance set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TopicLog {
    pub topic: String,
    pub run_id: Uuid,
    pub date: String,
    pub early_termination: bool,
    pub queries: Vec<QueryLogEntry>,
    pub skips: Vec<SkipRecord>,
    pub entries: Vec<ProvenanceEntry>,
}

impl TopicLog {
    pub fn new(topic: impl Into<String>, run_id: Uuid, date: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            run_id,
            date: date.into(),
            early_termination: false,
            queries: Vec::new(),
            skips: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn record_query(
        &mut self,
        provider: &str,
        query: &str,
        page_count: usize,
        image_count: usize,
        error: Option<String>,
    ) {
        self.queries.push(QueryLogEntry {
            topic: self.topic.clone(),
            provider: provider.to_string(),
            query: query.to_string(),
            timestamp: Utc::now(),
            page_count,
            image_count,
            error,
        });
    }

    pub fn record_skip(&mut self, url: &str, reason: SkipReason, detail: Option<String>) {
        self.skips.push(SkipRecord {
            url: url.to_string(),
            reason,
            detail,
        });
    }
}

/// Builds immutable provenance entries and persists topic logs. Construction
/// is side-effect free; only `write_topic_log` touches the filesystem, and
/// concurrent writers serialize on an internal lock.
pub struct ProvenanceRecorder {
    logs_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ProvenanceRecorder {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Pure constructor: the caller decides whether the entry is kept.
    #[allow(clippy::too_many_arguments)]
    pub fn record_image(
        topic: &str,
        source_page_url: &str,
        image_url: &str,
        discovery_method: DiscoveryMethod,
        relevance_score: f64,
        alt_text: Option<String>,
        filename: Option<String>,
        context_text: Option<String>,
    ) -> ProvenanceEntry {
        ProvenanceEntry {
            topics: vec![topic.to_string()],
            source_page_url: source_page_url.to_string(),
            image_url: image_url.to_string(),
            discovery_method,
            retrieved_at: Utc::now(),
            relevance_score,
            relevance_tier: RelevanceTier::from_score(relevance_score),
            alt_text,
            filename,
            context_text,
        }
    }

    /// Deterministic file name: re-running the same topic on the same day
    /// overwrites its own log and never collides with another topic's.
    pub fn log_path(&self, date: &str, topic: &str) -> PathBuf {
        self.logs_dir
            .join(format!("{date}_{}.json", slugify_topic(topic)))
    }

    /// Atomic from the reader's perspective: the document is staged to a temp
    /// file and renamed into place.
    pub async fn write_topic_log(&self, log: &TopicLog) -> ProvenanceResult<PathBuf> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.logs_dir)
            .await
            .map_err(|source| ProvenanceError::io(source, &self.logs_dir))?;

        let path = self.log_path(&log.date, &log.topic);
        let staged = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(log)?;
        tokio::fs::write(&staged, payload)
            .await
            .map_err(|source| ProvenanceError::io(source, &staged))?;
        tokio::fs::rename(&staged, &path)
            .await
            .map_err(|source| ProvenanceError::io(source, &path))?;

        info!(
            topic = %log.topic,
            path = %path.display(),
            queries = log.queries.len(),
            entries = log.entries.len(),
            "topic log written"
        );
        Ok(path)
    }

    pub async fn read_topic_log(path: &Path) -> ProvenanceResult<TopicLog> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|source| ProvenanceError::io(source, path))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Filesystem-safe topic slug: lowercase, alnum/dash/underscore plus CJK kept,
/// runs of anything else collapse to an underscore, capped at 60 chars.
pub fn slugify_topic(topic: &str) -> String {
    static KEEP: OnceLock<Regex> = OnceLock::new();
    let keep = KEEP.get_or_init(|| {
        Regex::new(r"[^a-z0-9\-_\p{Hiragana}\p{Katakana}\p{Han}]+").expect("static slug pattern")
    });

    let lowered = topic.trim().to_lowercase();
    let slug = keep.replace_all(&lowered, "_");
    let slug = slug.trim_matches('_');
    let truncated: String = slug.chars().take(60).collect();
    if truncated.is_empty() {
        "topic".to_string()
    } else {
        truncated
    }
}
