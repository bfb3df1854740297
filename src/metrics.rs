//! Stats shipping.
//!
//! When an InfluxDB endpoint is configured, a background task serializes
//! the same snapshot the admin endpoint serves into line protocol and
//! POSTs it on a fixed cadence. Shipping failures are logged and retried
//! on the next tick.

use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::discovery::DiscoveryStats;
use crate::proxy::ProxyService;

/// Cadence for stats shipping.
pub const SHIP_INTERVAL: Duration = Duration::from_secs(5);

/// Shipper configuration.
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// InfluxDB endpoint as `host[:port]`.
    pub endpoint: String,
    pub environ: String,
    pub host: String,
}

/// Spawn the shipping task.
pub fn spawn(
    service: Arc<ProxyService>,
    discovery_stats: Option<Arc<DiscoveryStats>>,
    config: ShipperConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let url = format!("http://{}/write?db={}", config.endpoint, service.name());
        let client = match reqwest::Client::builder().timeout(SHIP_INTERVAL).build() {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "could not build stats client; shipping disabled");
                return;
            }
        };

        let mut ticker = tokio::time::interval(SHIP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let body = render(&service, discovery_stats.as_deref(), &config).await;
            match client.post(&url).body(body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("shipped stats");
                }
                Ok(response) => {
                    warn!(status = %response.status(), "stats endpoint rejected write");
                }
                Err(err) => {
                    warn!(error = %err, "could not ship stats");
                }
            }
        }
    })
}

/// Render the stats snapshot as InfluxDB line protocol.
async fn render(
    service: &ProxyService,
    discovery: Option<&DiscoveryStats>,
    config: &ShipperConfig,
) -> String {
    let tags = format!(
        "environ={},host={},instance={}",
        escape_tag(&config.environ),
        escape_tag(&config.host),
        escape_tag(service.instance()),
    );

    let stats = service.stats().await;
    let raw = service.service_stats();

    let mut body = String::new();
    let _ = writeln!(
        body,
        "{}_proxy,{} accepted={}i,open_conns={}i,total_conns={}i,bytes_xfer={}i,io_workers={}i,\
         resolve_errors={}i,connect_errors={}i,xfer_errors={}i,\
         resolves={}i,resolve_micros={}i,connects={}i,connect_micros={}i",
        service.name(),
        tags,
        raw.accepted.load(Ordering::Relaxed),
        stats.open_conns,
        stats.total_conns,
        stats.bytes_xfer,
        stats.io_workers,
        raw.resolve_errors.load(Ordering::Relaxed),
        raw.connect_errors.load(Ordering::Relaxed),
        raw.xfer_errors.load(Ordering::Relaxed),
        raw.resolves.load(Ordering::Relaxed),
        raw.resolve_micros.load(Ordering::Relaxed),
        raw.connects.load(Ordering::Relaxed),
        raw.connect_micros.load(Ordering::Relaxed),
    );

    for (backend, conns) in &stats.total_conns_by_route {
        let _ = writeln!(
            body,
            "{}_route,{},backend={} total_conns={}i",
            service.name(),
            tags,
            escape_tag(backend),
            conns,
        );
    }

    if let Some(discovery) = discovery {
        let _ = writeln!(
            body,
            "{}_discovery,{} lookups={}i,lookup_errors={}i,lookup_micros={}i,\
             registrations={}i,registration_errors={}i",
            service.name(),
            tags,
            discovery.lookups.load(Ordering::Relaxed),
            discovery.lookup_errors.load(Ordering::Relaxed),
            discovery.lookup_micros.load(Ordering::Relaxed),
            discovery.registrations.load(Ordering::Relaxed),
            discovery.registration_errors.load(Ordering::Relaxed),
        );
    }

    body
}

/// Escape a tag value for line protocol.
fn escape_tag(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
