//! The proxy service.
//!
//! ```text
//! Client -> Listener -> Route -> (Discovery | Rotation) -> Backend dial
//!                                                              |
//!                                               two pumps, one per direction
//! ```

mod cmap;
mod service;

pub use cmap::{CounterMap, Entry};
pub use service::{ProxyConfig, ProxyService, ServiceStats, Stats};
