use std::collections::HashMap;

use tracing::debug;

use crate::provenance::ProvenanceEntry;

const IMAGE_EXTENSIONS: [&str; 6] = [".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg"];

/// Query keys that identify the actual resource when the path itself does not.
const DISCRIMINATOR_KEYS: [&str; 6] = ["id", "img", "image", "file", "media", "photo"];

/// The one normalization rule applied everywhere image URL equality is
/// tested: lowercased scheme+host+path, query stripped unless it carries the
/// resource discriminator (extension-less path with an id-like key).
pub fn normalize_image_url(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return url.trim().to_lowercase();
    };
    let host = parsed.host_str().unwrap_or_default().to_lowercase();
    let mut normalized = match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    };
    normalized.push_str(&parsed.path().to_lowercase());

    if let Some(query) = parsed.query() {
        if query_is_discriminator(&parsed) {
            normalized.push('?');
            normalized.push_str(query);
        }
    }
    normalized
}

fn query_is_discriminator(parsed: &url::Url) -> bool {
    let path = parsed.path().to_lowercase();
    if IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return false;
    }
    parsed.query_pairs().any(|(key, _)| {
        let key = key.to_lowercase();
        DISCRIMINATOR_KEYS.iter().any(|candidate| key == *candidate)
    })
}

/// Merge per-topic result sets into one sequence keyed by the normalized
/// image URL. First-seen entry wins for provenance fields; the topic list
/// accumulates every contributing topic so no attribution is lost. Output
/// order is first-seen order, which keeps merges deterministic.
pub fn merge(per_topic: Vec<Vec<ProvenanceEntry>>) -> Vec<ProvenanceEntry> {
    let total: usize = per_topic.iter().map(Vec::len).sum();
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, ProvenanceEntry> = HashMap::new();

    for entries in per_topic {
        for entry in entries {
            let key = normalize_image_url(&entry.image_url);
            match merged.get_mut(&key) {
                Some(existing) => {
                    for topic in &entry.topics {
                        if !existing.topics.contains(topic) {
                            existing.topics.push(topic.clone());
                        }
                    }
                }
                None => {
                    order.push(key.clone());
                    merged.insert(key, entry);
                }
            }
        }
    }

    let result: Vec<ProvenanceEntry> = order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect();
    debug!(total, after_dedup = result.len(), "merged topic result sets");
    result
}
