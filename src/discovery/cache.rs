//! Caching discovery.
//!
//! Wraps any discovery backend behind a TTL-bounded cache that rotates
//! round-robin through the cached result set. A miss or an expired entry is
//! refreshed with a fixed large fanout so subsequent reads rotate through
//! the full provider set rather than the caller's window size.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{Discovery, DiscoveryError, Lease};

/// How long a cached provider set remains valid.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Fanout used to populate the cache on a refresh.
pub const DEFAULT_MAX_RECORDS: usize = 100;

/// A cached provider set for one service name.
struct CacheEntry {
    providers: Vec<String>,
    index: usize,
    expiry: Instant,
}

impl CacheEntry {
    /// Return the next window of `n` providers in the rotation and advance
    /// the index by the number returned. The window wraps cleanly and never
    /// duplicates an address within a single call.
    fn next(&mut self, n: usize) -> Vec<String> {
        let len = self.providers.len();
        if len == 0 {
            return Vec::new();
        }

        let base = self.index % len;
        let upper = base + n;

        let (window, advance) = if upper <= len {
            (self.providers[base..upper].to_vec(), n)
        } else {
            let tail = len - base;
            let spillover = (n - tail).min(base);
            let mut window = self.providers[base..].to_vec();
            window.extend_from_slice(&self.providers[..spillover]);
            (window, tail + spillover)
        };

        self.index += advance;
        window
    }
}

/// A discovery service that caches the results of another.
pub struct CachedDiscovery {
    inner: Arc<dyn Discovery>,
    ttl: Duration,
    max_records: usize,
    // One coarse lock over the whole map, held across the inner refresh
    // call: concurrent misses serialize, and a miss for one key delays a
    // hit for another.
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CachedDiscovery {
    pub fn new(inner: Arc<dyn Discovery>, ttl: Duration) -> Self {
        CachedDiscovery {
            inner,
            ttl,
            max_records: DEFAULT_MAX_RECORDS,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Discovery for CachedDiscovery {
    async fn lookup_providers(
        &self,
        n: usize,
        service: &str,
    ) -> Result<Vec<String>, DiscoveryError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        let expired = entries
            .get(service)
            .map(|entry| now > entry.expiry)
            .unwrap_or(true);

        if expired {
            debug!(service = %service, "querying for providers");
            // A failed refresh propagates without touching the cache; a
            // live entry is only ever replaced by a successful lookup.
            let providers = self.inner.lookup_providers(self.max_records, service).await?;
            debug!(service = %service, count = providers.len(), "received providers");
            entries.insert(
                service.to_string(),
                CacheEntry {
                    providers,
                    index: 0,
                    expiry: now + self.ttl,
                },
            );
        }

        let entry = entries
            .get_mut(service)
            .expect("cache entry present after refresh");
        Ok(entry.next(n))
    }

    async fn register_providers(
        &self,
        instance: &str,
        services: &BTreeMap<String, String>,
    ) -> Result<Lease, DiscoveryError> {
        self.inner.register_providers(instance, services).await
    }
}
