use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ScoringSection;

pub const WEIGHT_ALT: f64 = 0.4;
pub const WEIGHT_FILENAME: f64 = 0.3;
pub const WEIGHT_CONTEXT: f64 = 0.2;
pub const WEIGHT_DOMAIN: f64 = 0.1;

/// Display tier derived from the score. Tiers drive CLI/UI filtering only;
/// low-tier entries stay in provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceTier {
    High,
    Medium,
    Low,
}

impl RelevanceTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.6 {
            RelevanceTier::High
        } else if score >= 0.3 {
            RelevanceTier::Medium
        } else {
            RelevanceTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelevanceTier::High => "high",
            RelevanceTier::Medium => "medium",
            RelevanceTier::Low => "low",
        }
    }
}

impl fmt::Display for RelevanceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-image signals collected at extraction time.
#[derive(Debug, Clone, Default)]
pub struct RelevanceSignals<'a> {
    pub alt_text: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub context_text: Option<&'a str>,
    pub domain: Option<&'a str>,
}

/// Weighted keyword scorer: alt text 0.4, filename 0.3, surrounding context
/// 0.2, domain trust 0.1. Each sub-signal is normalized to [0,1] before
/// weighting and the final score is clamped.
#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    trusted_domains: Vec<String>,
    token_pattern: Regex,
    context_window: usize,
}

impl RelevanceScorer {
    pub fn new(config: &ScoringSection) -> Self {
        Self {
            trusted_domains: config
                .trusted_domains
                .iter()
                .map(|domain| domain.to_lowercase())
                .collect(),
            // \w is Unicode-aware, so CJK topics tokenize without a special case.
            token_pattern: Regex::new(r"\w+").expect("static token pattern"),
            context_window: config.context_window_chars,
        }
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    pub fn score(&self, topic: &str, signals: &RelevanceSignals<'_>) -> f64 {
        let topic_tokens = self.tokenize(topic);
        if topic_tokens.is_empty() {
            return 0.0;
        }

        let alt = match_ratio(&topic_tokens, signals.alt_text.unwrap_or(""));
        let filename = match_ratio(&topic_tokens, signals.filename.unwrap_or(""));
        let context = match_ratio(&topic_tokens, signals.context_text.unwrap_or(""));
        let domain = self.domain_trust(signals.domain.unwrap_or(""));

        let total = WEIGHT_ALT * alt
            + WEIGHT_FILENAME * filename
            + WEIGHT_CONTEXT * context
            + WEIGHT_DOMAIN * domain;
        total.clamp(0.0, 1.0)
    }

    /// Lowercased word tokens; single characters carry no signal and are dropped.
    fn tokenize(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        self.token_pattern
            .find_iter(&lowered)
            .map(|token| token.as_str().to_string())
            .filter(|token| token.chars().count() > 1)
            .collect()
    }

    fn domain_trust(&self, domain: &str) -> f64 {
        if domain.is_empty() {
            return 0.0;
        }
        let domain = domain.to_lowercase();
        let trusted = self.trusted_domains.iter().any(|candidate| {
            domain == *candidate || domain.ends_with(&format!(".{candidate}"))
        });
        if trusted {
            1.0
        } else {
            0.0
        }
    }
}

/// Fraction of topic tokens present in the text, substring match on the
/// lowercased haystack.
fn match_ratio(topic_tokens: &[String], text: &str) -> f64 {
    if topic_tokens.is_empty() || text.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let matches = topic_tokens
        .iter()
        .filter(|token| haystack.contains(token.as_str()))
        .count();
    matches as f64 / topic_tokens.len() as f64
}

/// Last path segment of the URL, query stripped.
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

pub fn domain_from_url(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_lowercase()))
}
