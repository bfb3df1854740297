//! Service discovery.
//!
//! Discovery maps a logical service name to the set of backend addresses
//! currently registered for it, and publishes this instance's own services
//! as leased records. The capability is a trait object so the TTL cache can
//! wrap any backend transparently and so tests can substitute fakes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

mod cache;
mod dns;
mod etcd;
mod registrar;
mod zone;

pub use cache::{CachedDiscovery, DEFAULT_CACHE_TTL, DEFAULT_MAX_RECORDS};
pub use dns::zone_endpoints;
pub use etcd::{EtcdDiscovery, KEY_PREFIX, LEASE_TTL};
pub use registrar::Registrar;
pub use zone::{ProviderSpec, Zone};

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The provider spec could not be parsed.
    #[error("malformed provider")]
    MalformedProvider,
    /// No usable discovery clients are available.
    #[error("no discovery service available")]
    NoDiscovery,
    /// Discovery is reachable but holds no addresses for the service.
    #[error("no providers available")]
    NoProviders,
    #[error("unsupported discovery provider type: {0}")]
    UnsupportedProvider(String),
    #[error("dns: {0}")]
    Dns(String),
    #[error(transparent)]
    Transport(#[from] etcd_client::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// A service registration lease. `expires` drives the registrar's renewal
/// cadence.
#[derive(Debug, Clone)]
pub struct Lease {
    pub instance: String,
    pub services: BTreeMap<String, String>,
    pub expires: Instant,
}

/// The discovery capability.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Look up at most `n` provider addresses for a logical service, in
    /// zone-preference order.
    async fn lookup_providers(
        &self,
        n: usize,
        service: &str,
    ) -> Result<Vec<String>, DiscoveryError>;

    /// Look up a single provider address for a logical service.
    async fn lookup_provider(&self, service: &str) -> Result<String, DiscoveryError> {
        let providers = self.lookup_providers(1, service).await?;
        providers.into_iter().next().ok_or(DiscoveryError::NoProviders)
    }

    /// Register every service in the map under this instance, attached to a
    /// bounded lease.
    async fn register_providers(
        &self,
        instance: &str,
        services: &BTreeMap<String, String>,
    ) -> Result<Lease, DiscoveryError>;
}

/// Operational counters for a discovery backend. Injected rather than
/// process-global so tests can observe counts deterministically; latencies
/// accumulate as count + total micros, from which shippers derive means.
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    pub lookups: AtomicU64,
    pub lookup_errors: AtomicU64,
    pub lookup_micros: AtomicU64,
    pub registrations: AtomicU64,
    pub registration_errors: AtomicU64,
}

/// Wraps a discovery backend and counts every operation against it. Each
/// lookup counts exactly once in the rate and duration counters regardless
/// of outcome; failures additionally count as errors.
pub struct MeteredDiscovery {
    inner: Arc<dyn Discovery>,
    stats: Arc<DiscoveryStats>,
}

impl MeteredDiscovery {
    pub fn new(inner: Arc<dyn Discovery>) -> Self {
        MeteredDiscovery {
            inner,
            stats: Arc::new(DiscoveryStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DiscoveryStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Discovery for MeteredDiscovery {
    async fn lookup_providers(
        &self,
        n: usize,
        service: &str,
    ) -> Result<Vec<String>, DiscoveryError> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = self.inner.lookup_providers(n, service).await;
        self.stats
            .lookup_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        if result.is_err() {
            self.stats.lookup_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn register_providers(
        &self,
        instance: &str,
        services: &BTreeMap<String, String>,
    ) -> Result<Lease, DiscoveryError> {
        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.register_providers(instance, services).await;
        if result.is_err() {
            self.stats
                .registration_errors
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}
