//! Engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use revsync_proto::EntityKind;

/// Default channel handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bounded timeout for workflow mutations and store reads.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default reconnect backoff base.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default reconnect backoff cap.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Default cache time-to-live per entity class.
fn default_ttls() -> HashMap<EntityKind, Duration> {
    HashMap::from([
        (EntityKind::Comment, Duration::from_secs(30)),
        (EntityKind::Notification, Duration::from_secs(15)),
        (EntityKind::ContentVersion, Duration::from_secs(60)),
    ])
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bound on the channel handshake before falling back to retry.
    pub handshake_timeout: Duration,

    /// Bound on workflow mutations and store reads. No automatic retry.
    pub request_timeout: Duration,

    /// Exponential backoff base for channel reconnects.
    pub backoff_base: Duration,

    /// Exponential backoff cap for channel reconnects.
    pub backoff_cap: Duration,

    /// Cache staleness TTL per entity class.
    pub cache_ttls: HashMap<EntityKind, Duration>,
}

impl SyncConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            cache_ttls: default_ttls(),
        }
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the mutation/read request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the reconnect backoff window.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Set the cache TTL for one entity class.
    pub fn with_cache_ttl(mut self, entity: EntityKind, ttl: Duration) -> Self {
        self.cache_ttls.insert(entity, ttl);
        self
    }

    /// The cache TTL for an entity class.
    pub fn cache_ttl(&self, entity: EntityKind) -> Duration {
        self.cache_ttls
            .get(&entity)
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
