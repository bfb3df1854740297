//! manifold
//!
//! Multi-route TCP reverse proxy for internal service fabrics.
//!
//! This binary:
//! - Parses routes from flags and the environment
//! - Builds the discovery stack (etcd clients per zone, metered, cached)
//! - Binds one listener per route and relays connections
//! - Serves live stats on the admin endpoint
//! - Optionally ships stats to InfluxDB

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use hickory_resolver::TokioAsyncResolver;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use manifold::config::Config;
use manifold::discovery::{
    CachedDiscovery, Discovery, DiscoveryStats, EtcdDiscovery, MeteredDiscovery,
};
use manifold::metrics::ShipperConfig;
use manifold::proxy::{ProxyConfig, ProxyService};
use manifold::{admin, metrics};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let default_filter = if config.verbose {
        "manifold=trace"
    } else if config.debug {
        "manifold=debug"
    } else {
        "manifold=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // TLS dials use the process-default crypto provider
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let instance = instance_key(&host);

    info!(
        host = %host,
        instance = %instance,
        environ = %config.environ,
        routes = config.routes.len(),
        "starting manifold"
    );
    if config.sentry.is_some() {
        info!("error alerting enabled");
    }

    let (discovery, discovery_stats) = build_discovery(&config).await?;

    let service = Arc::new(
        ProxyService::new(ProxyConfig {
            name: config.name.clone(),
            instance,
            discovery,
            routes: config.routes.clone(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            debug: config.debug,
            tls_roots: None,
        })
        .await,
    );

    let admin_service = Arc::clone(&service);
    let status_addr = config.status.clone();
    tokio::spawn(async move {
        if let Err(err) = admin::serve(&status_addr, admin_service).await {
            error!(error = %err, "admin endpoint failed");
        }
    });

    if let Some(endpoint) = &config.influxdb {
        info!(endpoint = %endpoint, environ = %config.environ, "reporting metrics to InfluxDB");
        metrics::spawn(
            Arc::clone(&service),
            discovery_stats,
            ShipperConfig {
                endpoint: endpoint.clone(),
                environ: config.environ.clone(),
                host: host.clone(),
            },
        );
    }

    service.run().await?;
    Ok(())
}

/// Build the discovery stack configured for this instance: etcd clients
/// per zone, wrapped in metering, wrapped in the TTL cache.
async fn build_discovery(
    config: &Config,
) -> Result<(Option<Arc<dyn Discovery>>, Option<Arc<DiscoveryStats>>)> {
    let Some(spec) = &config.discovery else {
        return Ok((None, None));
    };

    if spec.scheme != "etcd" {
        bail!("unsupported discovery provider type: {}", spec.scheme);
    }

    info!(discovery = %spec, domain = %config.domain, "using discovery service");

    let resolver =
        TokioAsyncResolver::tokio_from_system_conf().context("could not build DNS resolver")?;
    let etcd = EtcdDiscovery::new(&resolver, &config.domain, &spec.zones)
        .await
        .context("could not create discovery service")?;

    let metered = MeteredDiscovery::new(Arc::new(etcd));
    let stats = metered.stats();
    let cached = CachedDiscovery::new(Arc::new(metered), config.cache_timeout);

    Ok((Some(Arc::new(cached)), Some(stats)))
}

/// Derive a process-unique instance key from host identity and random
/// seed material.
fn instance_key(host: &str) -> String {
    let mut seed = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut seed);

    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(seed);
    let digest = hasher.finalize();

    digest
        .iter()
        .take(20)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
