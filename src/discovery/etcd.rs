//! Etcd-backed discovery.
//!
//! One client per configured zone, with the zone's endpoints resolved
//! through DNS at construction time. Lookups prefix-scan the service's key
//! directory in zone-preference order; registrations write one leased key
//! per service in every zone.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions};
use hickory_resolver::TokioAsyncResolver;
use tokio::time::{timeout, Instant};
use tracing::{debug, error};

use super::dns::zone_endpoints;
use super::{Discovery, DiscoveryError, Lease, Zone};

/// Key namespace for discovery registrations.
pub const KEY_PREFIX: &str = "/disc/perc";

/// Lease duration granted to registrations.
pub const LEASE_TTL: Duration = Duration::from_secs(10);

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Etcd-backed discovery service.
pub struct EtcdDiscovery {
    zones: Vec<Zone>,
    clients: Vec<Client>,
}

impl EtcdDiscovery {
    /// Create a discovery service with one client per zone. A zone whose
    /// endpoints cannot be resolved or dialed is skipped with an error log;
    /// at least one zone must succeed.
    pub async fn new(
        resolver: &TokioAsyncResolver,
        domain: &str,
        zones: &[Zone],
    ) -> Result<EtcdDiscovery, DiscoveryError> {
        let mut clients = Vec::new();
        let mut usable = Vec::new();

        for zone in zones {
            match Self::client_for_zone(resolver, domain, zone).await {
                Ok(client) => {
                    debug!(zone = %zone, "created etcd discovery client");
                    clients.push(client);
                    usable.push(zone.clone());
                }
                Err(err) => {
                    error!(zone = %zone, error = %err, "could not create discovery client");
                }
            }
        }

        if clients.is_empty() {
            return Err(DiscoveryError::NoDiscovery);
        }

        Ok(EtcdDiscovery {
            zones: usable,
            clients,
        })
    }

    /// Resolve a zone's endpoints and connect a client to them.
    async fn client_for_zone(
        resolver: &TokioAsyncResolver,
        domain: &str,
        zone: &Zone,
    ) -> Result<Client, DiscoveryError> {
        let endpoints = zone_endpoints(resolver, domain, zone).await?;
        debug!(zone = %zone, endpoints = ?endpoints, "resolved discovery endpoints");

        let options = ConnectOptions::new().with_connect_timeout(DIAL_TIMEOUT);
        let client = Client::connect(&endpoints, Some(options)).await?;
        Ok(client)
    }

    /// The zones this service consults, in preference order.
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }
}

#[async_trait]
impl Discovery for EtcdDiscovery {
    async fn lookup_providers(
        &self,
        n: usize,
        service: &str,
    ) -> Result<Vec<String>, DiscoveryError> {
        if self.clients.is_empty() {
            return Err(DiscoveryError::NoDiscovery);
        }

        let prefix = format!("{}/", key_path(&[KEY_PREFIX, service]));
        let mut providers = Vec::new();

        'zones: for client in &self.clients {
            let mut client = client.clone();
            let response = timeout(
                LOOKUP_TIMEOUT,
                client.get(prefix.as_str(), Some(GetOptions::new().with_prefix())),
            )
            .await
            .map_err(|_| DiscoveryError::Timeout("lookup"))??;

            let values = response
                .kvs()
                .iter()
                .map(|kv| kv.value_str().map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?;
            if gather(&mut providers, values, n) {
                break 'zones;
            }
        }

        if providers.is_empty() {
            return Err(DiscoveryError::NoProviders);
        }
        Ok(providers)
    }

    async fn register_providers(
        &self,
        instance: &str,
        services: &BTreeMap<String, String>,
    ) -> Result<Lease, DiscoveryError> {
        if self.clients.is_empty() {
            return Err(DiscoveryError::NoDiscovery);
        }

        let expires = Instant::now() + LEASE_TTL;
        for client in &self.clients {
            for (service, addr) in services {
                let mut client = client.clone();

                let grant = timeout(
                    REGISTER_TIMEOUT,
                    client.lease_grant(LEASE_TTL.as_secs() as i64, None),
                )
                .await
                .map_err(|_| DiscoveryError::Timeout("lease grant"))??;

                let key = key_path(&[KEY_PREFIX, service, instance]);
                timeout(
                    REGISTER_TIMEOUT,
                    client.put(
                        key,
                        addr.as_str(),
                        Some(PutOptions::new().with_lease(grant.id())),
                    ),
                )
                .await
                .map_err(|_| DiscoveryError::Timeout("registration"))??;
            }
        }

        Ok(Lease {
            instance: instance.to_string(),
            services: services.clone(),
            expires,
        })
    }
}

/// Append values to `out` until the bound is reached. Returns true once
/// `out` holds exactly `n` entries.
fn gather(out: &mut Vec<String>, values: impl IntoIterator<Item = String>, n: usize) -> bool {
    for value in values {
        out.push(value);
        if out.len() >= n {
            return true;
        }
    }
    false
}

/// Join key components into a slash-separated path, additionally splitting
/// each component on `.` so dotted service names map to directory segments.
pub(crate) fn key_path(components: &[&str]) -> String {
    let mut path = String::new();
    for component in components {
        for segment in component.split('.').flat_map(|part| part.split('/')) {
            if segment.is_empty() {
                continue;
            }
            path.push('/');
            path.push_str(segment);
        }
    }
    path
}
