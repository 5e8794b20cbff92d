use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::http::HttpClient;
use crate::provenance::{ProvenanceEntry, SkipReason, SkipRecord};
use crate::scoring::domain_from_url;

/// Per-request download constraints. Stateless value object; deny wins over
/// allow when both match a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DownloadFilter {
    pub min_width: Option<u32>,
    pub min_height: Option<u32>,
    #[serde(default)]
    pub allow_domains: BTreeSet<String>,
    #[serde(default)]
    pub deny_domains: BTreeSet<String>,
}

impl DownloadFilter {
    pub fn wants_resolution(&self) -> bool {
        self.min_width.is_some() || self.min_height.is_some()
    }

    pub fn domain_allowed(&self, host: &str) -> Option<&'static str> {
        let host = host.to_lowercase();
        if matches_any(&self.deny_domains, &host) {
            return Some("deny_domain");
        }
        if !self.allow_domains.is_empty() && !matches_any(&self.allow_domains, &host) {
            return Some("not_in_allow_list");
        }
        None
    }
}

fn matches_any(set: &BTreeSet<String>, host: &str) -> bool {
    set.iter().any(|domain| {
        let domain = domain.to_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    })
}

/// Dimension lookup seam. The default implementation reads the image header
/// over HTTP; tests substitute a table.
#[async_trait]
pub trait DimensionProbe: Send + Sync {
    /// None when dimensions cannot be determined.
    async fn dimensions(&self, image_url: &str) -> Option<(u32, u32)>;
}

/// Ranged fetch of the image head plus a format-sniffing dimension decode.
/// Anything undecodable stays None and the pipeline treats it fail-closed.
pub struct HttpDimensionProbe {
    http: Arc<HttpClient>,
    max_probe_bytes: usize,
}

impl HttpDimensionProbe {
    const DEFAULT_PROBE_BYTES: usize = 64 * 1024;

    pub fn new(http: Arc<HttpClient>) -> Self {
        Self {
            http,
            max_probe_bytes: Self::DEFAULT_PROBE_BYTES,
        }
    }
}

#[async_trait]
impl DimensionProbe for HttpDimensionProbe {
    async fn dimensions(&self, image_url: &str) -> Option<(u32, u32)> {
        let head = self
            .http
            .fetch_head_bytes(image_url, self.max_probe_bytes)
            .await
            .ok()?;
        dimensions_from_bytes(&head.bytes)
    }
}

pub fn dimensions_from_bytes(bytes: &[u8]) -> Option<(u32, u32)> {
    image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub kept: Vec<ProvenanceEntry>,
    pub rejected: Vec<SkipRecord>,
}

/// Applies domain and resolution constraints before any download is
/// authorized. Rejections are policy outcomes, recorded, never errors.
pub struct FilterPipeline {
    probe: Arc<dyn DimensionProbe>,
}

impl FilterPipeline {
    pub fn new(probe: Arc<dyn DimensionProbe>) -> Self {
        Self { probe }
    }

    pub async fn apply(
        &self,
        entries: Vec<ProvenanceEntry>,
        filter: &DownloadFilter,
    ) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        for entry in entries {
            let host = domain_from_url(&entry.image_url).unwrap_or_default();
            if let Some(detail) = filter.domain_allowed(&host) {
                trace!(url = %entry.image_url, detail, "domain filter rejected image");
                outcome.rejected.push(SkipRecord {
                    url: entry.image_url.clone(),
                    reason: SkipReason::FilterRejected,
                    detail: Some(detail.to_string()),
                });
                continue;
            }

            if filter.wants_resolution() {
                match self.probe.dimensions(&entry.image_url).await {
                    Some((width, height)) => {
                        let wide_enough = filter.min_width.map_or(true, |min| width >= min);
                        let tall_enough = filter.min_height.map_or(true, |min| height >= min);
                        if !wide_enough || !tall_enough {
                            outcome.rejected.push(SkipRecord {
                                url: entry.image_url.clone(),
                                reason: SkipReason::FilterRejected,
                                detail: Some(format!("below_min_resolution:{width}x{height}")),
                            });
                            continue;
                        }
                    }
                    // Fail closed while a resolution constraint is active.
                    None => {
                        outcome.rejected.push(SkipRecord {
                            url: entry.image_url.clone(),
                            reason: SkipReason::FilterRejected,
                            detail: Some("unknown_dimensions".to_string()),
                        });
                        continue;
                    }
                }
            }

            outcome.kept.push(entry);
        }
        debug!(
            kept = outcome.kept.len(),
            rejected = outcome.rejected.len(),
            "filter pipeline applied"
        );
        outcome
    }
}
