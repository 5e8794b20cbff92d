use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PicsiftConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub limits: LimitsSection,
    pub network: NetworkSection,
}

impl PicsiftConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub discovery_logs_dir: String,
    pub downloads_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_concurrent_topics: usize,
    pub max_concurrent_pages: usize,
    pub max_concurrent_downloads: usize,
    pub max_pages_per_query: usize,
    pub default_image_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    pub user_agent: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DiscoveryConfig {
    pub providers: ProvidersSection,
    pub rate: RateSection,
    pub robots: RobotsSection,
    pub retry: RetrySection,
    pub scoring: ScoringSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersSection {
    /// Providers tried in order until one yields a non-empty result.
    pub order: Vec<String>,
    #[serde(default)]
    pub limits: HashMap<String, BucketSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketSection {
    pub capacity: u32,
    pub per_second: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateSection {
    pub default_capacity: u32,
    pub default_per_second: f64,
    pub slow_acquire_warn_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotsSection {
    pub respect: bool,
    pub fail_open: bool,
    pub cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringSection {
    pub context_window_chars: usize,
    pub trusted_domains: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub picsift: PicsiftConfig,
    pub discovery: DiscoveryConfig,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let picsift = load_picsift_config(dir.join("picsift.toml"))?;
        let discovery = load_discovery_config(dir.join("discovery.toml"))?;
        Ok(Self { picsift, discovery })
    }
}

pub fn load_picsift_config<P: AsRef<Path>>(path: P) -> Result<PicsiftConfig> {
    let config: PicsiftConfig = load_toml(&path)?;
    if config.limits.max_pages_per_query == 0 {
        return Err(invalid(&path, "limits.max_pages_per_query must be at least 1"));
    }
    Ok(config)
}

pub fn load_discovery_config<P: AsRef<Path>>(path: P) -> Result<DiscoveryConfig> {
    let config: DiscoveryConfig = load_toml(&path)?;
    if config.providers.order.is_empty() {
        return Err(invalid(&path, "providers.order must name at least one provider"));
    }
    if config.rate.default_per_second <= 0.0 {
        return Err(invalid(&path, "rate.default_per_second must be positive"));
    }
    for (key, bucket) in &config.providers.limits {
        if bucket.per_second <= 0.0 || bucket.capacity == 0 {
            return Err(invalid(
                &path,
                &format!("providers.limits.{key} must have positive capacity and rate"),
            ));
        }
    }
    Ok(config)
}

fn invalid<P: AsRef<Path>>(path: P, message: &str) -> ConfigError {
    ConfigError::Invalid {
        message: message.to_string(),
        path: path.as_ref().to_path_buf(),
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_configs() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let bundle = ConfigBundle::from_directory(dir).expect("configs should parse");
        assert_eq!(bundle.picsift.system.node_name, "picsift-primary");
        assert_eq!(bundle.discovery.providers.order[0], "duckduckgo");
        assert!(bundle
            .discovery
            .scoring
            .trusted_domains
            .contains(&"wikimedia.org".to_string()));
        assert!(!bundle.discovery.robots.fail_open);
    }

    #[test]
    fn empty_provider_order_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discovery.toml");
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/discovery.toml");
        let content = std::fs::read_to_string(fixture)
            .unwrap()
            .replace("order = [\"duckduckgo\", \"html_serp\"]", "order = []");
        std::fs::write(&path, content).unwrap();
        let err = load_discovery_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn resolve_path_joins_relative_to_base_dir() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let config = load_picsift_config(dir.join("picsift.toml")).unwrap();
        assert_eq!(
            config.resolve_path("downloads"),
            PathBuf::from("/var/lib/picsift/downloads")
        );
        assert_eq!(
            config.resolve_path("/tmp/elsewhere"),
            PathBuf::from("/tmp/elsewhere")
        );
    }
}
