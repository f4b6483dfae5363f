use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

/// Where a sandbox's persistent process accepts work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub port: u16,
    pub path: String,
    pub pid: u32,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    endpoint: Endpoint,
    expires_at: Instant,
}

/// Known-good endpoints keyed by sandbox id. Entries expire after a TTL and
/// are dropped explicitly on restart, restore, reset and teardown.
#[derive(Debug)]
pub struct EndpointCache {
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
}

impl EndpointCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, sandbox_id: &str) -> Option<Endpoint> {
        let now = Instant::now();
        let endpoint = {
            let entry = self.entries.get(sandbox_id)?;
            (entry.expires_at > now).then(|| entry.endpoint.clone())
        };
        if endpoint.is_none() {
            self.entries
                .remove_if(sandbox_id, |_, entry| entry.expires_at <= now);
        }
        endpoint
    }

    pub fn insert(&self, sandbox_id: &str, endpoint: Endpoint) {
        self.entries.insert(
            sandbox_id.to_string(),
            CacheEntry {
                endpoint,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, sandbox_id: &str) {
        if self.entries.remove(sandbox_id).is_some() {
            debug!(sandbox_id, "endpoint cache invalidated");
        }
    }
}
