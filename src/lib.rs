//! manifold
//!
//! A multi-route TCP reverse proxy for internal service fabrics.
//!
//! This library:
//! - Parses route specifications that bind local listen endpoints to
//!   literal host backends or logical service names
//! - Resolves logical services through an etcd-backed discovery fabric,
//!   fronted by a TTL cache with round-robin rotation
//! - Relays bytes in both directions with independent idle deadlines
//! - Publishes this instance's own services as leased discovery records
//! - Exposes live operational counters over an admin endpoint

pub mod admin;
pub mod config;
pub mod discovery;
pub mod metrics;
pub mod proxy;
pub mod route;
pub mod sync;

pub use config::Config;
pub use discovery::{
    CachedDiscovery, Discovery, DiscoveryError, DiscoveryStats, EtcdDiscovery, Lease,
    MeteredDiscovery, ProviderSpec, Registrar, Zone,
};
pub use proxy::{CounterMap, Entry, ProxyConfig, ProxyService, ServiceStats, Stats};
pub use route::{Backend, Route, RouteError};
