use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::http::ResourceFetcher;
use crate::provenance::{ProvenanceEntry, SkipReason, SkipRecord};
use crate::robots::{RobotsDecision, RobotsPolicy};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir { source: io::Error, path: PathBuf },
    #[error("failed to write {path}: {source}")]
    Write { source: io::Error, path: PathBuf },
    #[error("failed to encode provenance index: {0}")]
    Encode(#[from] serde_json::Error),
}

pub const PROVENANCE_INDEX_FILE: &str = "provenance_index.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SavedImage {
    pub image_url: String,
    /// Local file name inside the output directory.
    pub file: String,
    pub path: PathBuf,
}

/// Summary of one download batch. Per-image failures never abort the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DownloadResult {
    pub saved: Vec<SavedImage>,
    pub failed: Vec<SkipRecord>,
    pub provenance_index_path: PathBuf,
}

/// One row of the provenance-index sidecar: local file plus the full entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IndexRecord {
    pub file: String,
    pub entry: ProvenanceEntry,
}

/// Content-addressed file name: sha256 prefix of the URL plus an extension
/// taken from the URL path, falling back to the Content-Type.
pub fn hash_filename(url: &str, content_type: Option<&str>) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let stem = hex::encode(digest)[..16].to_string();
    let ext = extension_from_url(url)
        .or_else(|| content_type.and_then(extension_from_content_type))
        .unwrap_or_else(|| "img".to_string());
    format!("{stem}.{ext}")
}

fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_lowercase())
}

fn extension_from_content_type(content_type: &str) -> Option<String> {
    let ext = match content_type.trim() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => return None,
    };
    Some(ext.to_string())
}

/// Bounded-concurrency image downloader with per-image robots checks.
pub struct Downloader {
    fetcher: Arc<dyn ResourceFetcher>,
    robots: Arc<dyn RobotsPolicy>,
    max_concurrent: usize,
}

enum ItemOutcome {
    Saved(Box<(SavedImage, ProvenanceEntry)>),
    Skipped(SkipRecord),
}

impl Downloader {
    pub fn new(
        fetcher: Arc<dyn ResourceFetcher>,
        robots: Arc<dyn RobotsPolicy>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            fetcher,
            robots,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Download every entry into `out_dir`, then write the provenance-index
    /// sidecar listing exactly the files that were saved.
    pub async fn download_batch(
        &self,
        entries: &[ProvenanceEntry],
        out_dir: &Path,
        respect_robots: bool,
    ) -> StorageResult<DownloadResult> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|source| StorageError::CreateDir {
                source,
                path: out_dir.to_path_buf(),
            })?;

        // `buffered` keeps input order, so results and the index are
        // deterministic for a given entry sequence.
        let outcomes: Vec<ItemOutcome> = stream::iter(entries.iter().cloned())
            .map(|entry| self.download_one(entry, out_dir, respect_robots))
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let mut saved = Vec::new();
        let mut index = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Saved(boxed) => {
                    let (image, entry) = *boxed;
                    index.push(IndexRecord {
                        file: image.file.clone(),
                        entry,
                    });
                    saved.push(image);
                }
                ItemOutcome::Skipped(skip) => failed.push(skip),
            }
        }

        let provenance_index_path = write_provenance_index(&index, out_dir).await?;
        info!(
            saved = saved.len(),
            failed = failed.len(),
            out_dir = %out_dir.display(),
            "download batch finished"
        );
        Ok(DownloadResult {
            saved,
            failed,
            provenance_index_path,
        })
    }

    async fn download_one(
        &self,
        entry: ProvenanceEntry,
        out_dir: &Path,
        respect_robots: bool,
    ) -> ItemOutcome {
        let url = entry.image_url.clone();
        if respect_robots {
            match self.robots.allowed_for_resource(&url).await {
                RobotsDecision::Denied => {
                    warn!(url = %url, "robots.txt disallows fetching image");
                    return ItemOutcome::Skipped(SkipRecord {
                        url,
                        reason: SkipReason::RobotsDenied,
                        detail: None,
                    });
                }
                RobotsDecision::UnreachableDenied => {
                    return ItemOutcome::Skipped(SkipRecord {
                        url,
                        reason: SkipReason::RobotsUnreachable,
                        detail: None,
                    });
                }
                RobotsDecision::Allowed | RobotsDecision::UnreachableAllowed => {}
            }
        }

        let body = match self.fetcher.fetch_resource(&url).await {
            Ok(body) => body,
            Err(err) => {
                warn!(url = %url, error = %err, "image download failed");
                return ItemOutcome::Skipped(SkipRecord {
                    url,
                    reason: SkipReason::DownloadFailed,
                    detail: Some(err.to_string()),
                });
            }
        };

        let file = hash_filename(&url, body.content_type.as_deref());
        let path = out_dir.join(&file);
        if let Err(source) = tokio::fs::write(&path, &body.bytes).await {
            warn!(url = %url, path = %path.display(), error = %source, "failed to store image");
            return ItemOutcome::Skipped(SkipRecord {
                url,
                reason: SkipReason::DownloadFailed,
                detail: Some(source.to_string()),
            });
        }
        ItemOutcome::Saved(Box::new((
            SavedImage {
                image_url: url,
                file,
                path,
            },
            entry,
        )))
    }
}

pub async fn write_provenance_index(
    records: &[IndexRecord],
    out_dir: &Path,
) -> StorageResult<PathBuf> {
    let path = out_dir.join(PROVENANCE_INDEX_FILE);
    let payload = serde_json::to_vec_pretty(records)?;
    tokio::fs::write(&path, payload)
        .await
        .map_err(|source| StorageError::Write {
            source,
            path: path.clone(),
        })?;
    Ok(path)
}
