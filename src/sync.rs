//! Distributed synchronization.
//!
//! A small capability for fabric-wide mutual exclusion: a `Mutex` held
//! under `/sync/perc/<key>` in etcd, plus a no-op implementation for
//! development and tests. The sync fabric coordinates through exactly one
//! zone.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tokio::time::timeout;

use crate::discovery::{DiscoveryError, ProviderSpec, Zone};

/// Key namespace for sync mutexes.
pub const KEY_PREFIX: &str = "/sync/perc";

const OP_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("sync service must use exactly one zone to coordinate clients; got {0}")]
    ZoneArity(usize),
    #[error("unsupported sync provider type: {0}")]
    UnsupportedProvider(String),
    #[error(transparent)]
    Transport(#[from] etcd_client::Error),
    #[error("sync operation timed out")]
    Timeout,
    #[error("mutex is not locked")]
    NotLocked,
}

/// A fabric-wide mutex.
#[async_trait]
pub trait Mutex: Send {
    async fn lock(&mut self) -> Result<(), SyncError>;
    async fn unlock(&mut self) -> Result<(), SyncError>;
}

/// The sync capability.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Obtain a mutex for the given key.
    async fn mutex(&self, key: &str) -> Result<Box<dyn Mutex>, SyncError>;
}

/// Lock, run, unlock. The closure's error wins over an unlock failure.
pub async fn perform<F, Fut>(mutex: &mut dyn Mutex, f: F) -> Result<(), SyncError>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<(), SyncError>> + Send,
{
    mutex.lock().await?;
    let result = f().await;
    let unlocked = mutex.unlock().await;
    result.and(unlocked)
}

/// Etcd-backed sync service.
pub struct EtcdSync {
    zone: Zone,
    client: Client,
}

impl EtcdSync {
    /// Create a sync service from a provider spec, which must name exactly
    /// one zone.
    pub async fn new(
        resolver: &TokioAsyncResolver,
        domain: &str,
        spec: &str,
    ) -> Result<EtcdSync, SyncError> {
        let spec = ProviderSpec::parse(spec)?;
        if spec.zones.len() != 1 {
            return Err(SyncError::ZoneArity(spec.zones.len()));
        }
        if spec.scheme != "etcd" {
            return Err(SyncError::UnsupportedProvider(spec.scheme));
        }

        let zone = spec.zones[0].clone();
        let endpoints = crate::discovery::zone_endpoints(resolver, domain, &zone).await?;
        let options = ConnectOptions::new().with_connect_timeout(DIAL_TIMEOUT);
        let client = Client::connect(&endpoints, Some(options)).await?;

        Ok(EtcdSync { zone, client })
    }

    /// The zone this service coordinates through.
    pub fn zone(&self) -> &Zone {
        &self.zone
    }
}

#[async_trait]
impl SyncService for EtcdSync {
    async fn mutex(&self, key: &str) -> Result<Box<dyn Mutex>, SyncError> {
        Ok(Box::new(EtcdMutex {
            client: self.client.clone(),
            name: format!("{}/{}", KEY_PREFIX, key),
            owner: None,
        }))
    }
}

/// A mutex held as an etcd lock. The ownership key returned by a
/// successful lock call is required to unlock.
struct EtcdMutex {
    client: Client,
    name: String,
    owner: Option<Vec<u8>>,
}

#[async_trait]
impl Mutex for EtcdMutex {
    async fn lock(&mut self) -> Result<(), SyncError> {
        let response = timeout(OP_TIMEOUT, self.client.lock(self.name.as_str(), None))
            .await
            .map_err(|_| SyncError::Timeout)??;
        self.owner = Some(response.key().to_vec());
        Ok(())
    }

    async fn unlock(&mut self) -> Result<(), SyncError> {
        let owner = self.owner.take().ok_or(SyncError::NotLocked)?;
        timeout(OP_TIMEOUT, self.client.unlock(owner))
            .await
            .map_err(|_| SyncError::Timeout)??;
        Ok(())
    }
}

/// A sync service whose mutexes always succeed without coordinating
/// anything. Stands in for the fabric in development and tests.
pub struct Faux;

#[async_trait]
impl SyncService for Faux {
    async fn mutex(&self, _key: &str) -> Result<Box<dyn Mutex>, SyncError> {
        Ok(Box::new(FauxMutex))
    }
}

struct FauxMutex;

#[async_trait]
impl Mutex for FauxMutex {
    async fn lock(&mut self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn unlock(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}
