pub mod config;
pub mod dedup;
pub mod discovery;
pub mod download;
pub mod error;
pub mod extract;
pub mod filter;
pub mod http;
pub mod limiter;
pub mod provenance;
pub mod robots;
pub mod scoring;
pub mod search;

pub use config::{
    load_discovery_config, load_picsift_config, ConfigBundle, DiscoveryConfig, PicsiftConfig,
};
pub use discovery::{
    CancelHandle, CancelToken, DiscoverOptions, DiscoveryError, DiscoveryOrchestrator,
    DiscoveryResult, PreviewResult, TopicStatus, TopicSummary,
};
pub use download::{DownloadResult, IndexRecord, SavedImage};
pub use error::{ConfigError, Result};
pub use filter::DownloadFilter;
pub use provenance::{
    DiscoveryMethod, ProvenanceEntry, ProvenanceRecorder, QueryLogEntry, SkipReason, SkipRecord,
    TopicLog,
};
pub use scoring::{RelevanceScorer, RelevanceTier};
