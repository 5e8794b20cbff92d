use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use texting_robots::Robot;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RobotsSection;
use crate::http::{FetchError, HttpClient};

/// Outcome of a robots.txt check. Unreachable policies are kept distinct from
/// explicit denies so the audit trail shows which exclusions were policy and
/// which were conservatism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotsDecision {
    Allowed,
    Denied,
    /// robots.txt could not be fetched or parsed; fail-closed default.
    UnreachableDenied,
    /// robots.txt could not be fetched or parsed; operator opted into fail-open.
    UnreachableAllowed,
}

impl RobotsDecision {
    pub fn is_allowed(self) -> bool {
        matches!(
            self,
            RobotsDecision::Allowed | RobotsDecision::UnreachableAllowed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RobotsDecision::Allowed => "allowed",
            RobotsDecision::Denied => "denied",
            RobotsDecision::UnreachableDenied => "unreachable_denied",
            RobotsDecision::UnreachableAllowed => "unreachable_allowed",
        }
    }
}

impl fmt::Display for RobotsDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy seam consumed by the orchestrator and downloader. Page and resource
/// checks are separate operations: a host may serve its pages freely while
/// disallowing direct asset fetches, or the reverse.
#[async_trait]
pub trait RobotsPolicy: Send + Sync {
    async fn allowed_for_page(&self, url: &str) -> RobotsDecision;
    async fn allowed_for_resource(&self, url: &str) -> RobotsDecision;
}

enum HostPolicy {
    Rules(Box<Robot>),
    /// Host publishes no robots.txt (404/410): everything is allowed.
    Absent,
    Unreachable,
}

struct CachedPolicy {
    policy: HostPolicy,
    fetched_at: Instant,
}

/// Fetches and caches one robots policy per host origin for the lifetime of a
/// run (bounded by a TTL so long-lived gates do not go stale). All mutation is
/// behind an internal lock; callers never synchronize.
pub struct RobotsGate {
    http: Arc<HttpClient>,
    agent_token: String,
    respect: bool,
    fail_open: bool,
    ttl: Duration,
    cache: Mutex<HashMap<String, Arc<CachedPolicy>>>,
}

impl RobotsGate {
    pub const AGENT_TOKEN: &'static str = "PicSift";

    pub fn new(http: Arc<HttpClient>, config: &RobotsSection) -> Self {
        Self {
            http,
            agent_token: Self::AGENT_TOKEN.to_string(),
            respect: config.respect,
            fail_open: config.fail_open,
            ttl: Duration::from_secs(config.cache_ttl_seconds.max(1)),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn origin_of(url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let origin = match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        };
        Some(origin)
    }

    async fn policy_for(&self, origin: &str) -> Arc<CachedPolicy> {
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(origin) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Arc::clone(cached);
                }
            }
        }

        let policy = self.fetch_policy(origin).await;
        let cached = Arc::new(CachedPolicy {
            policy,
            fetched_at: Instant::now(),
        });
        let mut cache = self.cache.lock().await;
        cache.insert(origin.to_string(), Arc::clone(&cached));
        cached
    }

    async fn fetch_policy(&self, origin: &str) -> HostPolicy {
        let robots_url = format!("{origin}/robots.txt");
        match self.http.fetch_text(&robots_url).await {
            Ok(page) => match Robot::new(&self.agent_token, page.body.as_bytes()) {
                Ok(robot) => HostPolicy::Rules(Box::new(robot)),
                Err(err) => {
                    warn!(origin, error = %err, "malformed robots.txt, treating host as unreachable");
                    HostPolicy::Unreachable
                }
            },
            Err(FetchError::Status { status, .. })
                if status.as_u16() == 404 || status.as_u16() == 410 =>
            {
                debug!(origin, "no robots.txt published");
                HostPolicy::Absent
            }
            Err(err) => {
                warn!(origin, error = %err, "robots.txt fetch failed");
                HostPolicy::Unreachable
            }
        }
    }

    async fn evaluate(&self, url: &str) -> RobotsDecision {
        if !self.respect {
            return RobotsDecision::Allowed;
        }
        let Some(origin) = Self::origin_of(url) else {
            return RobotsDecision::Denied;
        };
        let cached = self.policy_for(&origin).await;
        match &cached.policy {
            HostPolicy::Rules(robot) => {
                if robot.allowed(url) {
                    RobotsDecision::Allowed
                } else {
                    RobotsDecision::Denied
                }
            }
            HostPolicy::Absent => RobotsDecision::Allowed,
            HostPolicy::Unreachable => {
                if self.fail_open {
                    RobotsDecision::UnreachableAllowed
                } else {
                    RobotsDecision::UnreachableDenied
                }
            }
        }
    }

    #[cfg(test)]
    async fn seed(&self, origin: &str, body: Option<&str>) {
        let policy = match body {
            Some(text) => HostPolicy::Rules(Box::new(
                Robot::new(&self.agent_token, text.as_bytes()).unwrap(),
            )),
            None => HostPolicy::Unreachable,
        };
        let mut cache = self.cache.lock().await;
        cache.insert(
            origin.to_string(),
            Arc::new(CachedPolicy {
                policy,
                fetched_at: Instant::now(),
            }),
        );
    }
}

#[async_trait]
impl RobotsPolicy for RobotsGate {
    async fn allowed_for_page(&self, url: &str) -> RobotsDecision {
        self.evaluate(url).await
    }

    async fn allowed_for_resource(&self, url: &str) -> RobotsDecision {
        self.evaluate(url).await
    }
}
