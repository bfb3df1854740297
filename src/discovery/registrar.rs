//! Service registration.
//!
//! The registrar publishes this instance's services as leased discovery
//! records and renews them forever, at half the lease duration. Transport
//! errors are logged and retried at a capped cadence so a discovery outage
//! heals itself when the fabric returns.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::Discovery;

/// Retry cadence when registration fails.
const DEFAULT_RETRY: Duration = Duration::from_secs(10);

/// Floor on the renewal interval.
const MIN_WAIT: Duration = Duration::from_secs(1);

/// Publishes services under a stable instance tag and renews their leases.
pub struct Registrar {
    discovery: Arc<dyn Discovery>,
}

impl Registrar {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Registrar { discovery }
    }

    /// Publish a single service and keep renewing it.
    pub fn publish(&self, instance: &str, service: &str, addr: &str) -> JoinHandle<()> {
        let mut services = BTreeMap::new();
        services.insert(service.to_string(), addr.to_string());
        self.publish_all(instance, services)
    }

    /// Publish a set of services and keep renewing them. The returned
    /// handle never completes on its own; abort it to stop renewing.
    pub fn publish_all(
        &self,
        instance: &str,
        services: BTreeMap<String, String>,
    ) -> JoinHandle<()> {
        let discovery = Arc::clone(&self.discovery);
        // The tag is composed once and stays stable across renewals so the
        // instance keeps republishing the same keys.
        let tag = format!("{}-{}", instance, random_tag(16));

        tokio::spawn(async move {
            loop {
                debug!(instance = %tag, services = ?services, "publishing services");
                let wait = match discovery.register_providers(&tag, &services).await {
                    Ok(lease) => {
                        let remaining = lease.expires.saturating_duration_since(Instant::now());
                        (remaining / 2).max(MIN_WAIT)
                    }
                    Err(err) => {
                        warn!(instance = %tag, error = %err, "could not register local services");
                        DEFAULT_RETRY
                    }
                };
                tokio::time::sleep(wait).await;
            }
        })
    }
}

fn random_tag(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::testing::ScriptedDiscovery;
    use std::sync::atomic::Ordering;

    fn intervals(calls: &[Instant]) -> Vec<Duration> {
        calls.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn renews_at_half_lease() {
        let discovery =
            Arc::new(ScriptedDiscovery::answering(vec![]).with_lease_ttl(Duration::from_secs(10)));
        let registrar = Registrar::new(discovery.clone() as Arc<dyn Discovery>);

        let handle = registrar.publish("i-1", "svc.users", "10.0.0.1:9000");
        tokio::time::sleep(Duration::from_secs(16)).await;
        handle.abort();

        let calls = discovery.register_calls.lock().unwrap().clone();
        assert!(calls.len() >= 3, "expected at least 3 renewals, got {}", calls.len());
        for interval in intervals(&calls) {
            assert_eq!(interval, Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_error_at_capped_cadence() {
        let discovery = Arc::new(ScriptedDiscovery::answering(vec![]));
        discovery.fail_registration.store(true, Ordering::Relaxed);
        let registrar = Registrar::new(discovery.clone() as Arc<dyn Discovery>);

        let handle = registrar.publish("i-1", "svc.users", "10.0.0.1:9000");
        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.abort();

        let calls = discovery.register_calls.lock().unwrap().clone();
        assert!(calls.len() >= 2);
        for interval in intervals(&calls) {
            assert_eq!(interval, Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_interval_never_drops_below_floor() {
        let discovery = Arc::new(
            ScriptedDiscovery::answering(vec![]).with_lease_ttl(Duration::from_millis(500)),
        );
        let registrar = Registrar::new(discovery.clone() as Arc<dyn Discovery>);

        let handle = registrar.publish("i-1", "svc.users", "10.0.0.1:9000");
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.abort();

        let calls = discovery.register_calls.lock().unwrap().clone();
        assert!(calls.len() >= 2);
        for interval in intervals(&calls) {
            assert_eq!(interval, Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn instance_tags_are_stable_and_distinct() {
        let tag = random_tag(16);
        assert_eq!(tag.len(), 16);
        assert!(tag.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_tag(16), random_tag(16));
    }
}
