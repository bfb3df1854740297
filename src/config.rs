//! Configuration.
//!
//! Every option can be provided as a flag or through its `HP_*` environment
//! variable; flags win. Routes accumulate from the repeatable `--route`
//! flag and the semicolon-joined `HP_ROUTES` variable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser};

use crate::discovery::ProviderSpec;
use crate::route::Route;

/// The service name this instance reports under.
pub const SERVICE_NAME: &str = "manifold";

/// A string that must not leak into logs.
#[derive(Clone)]
pub struct RedactedString(String);

impl RedactedString {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RedactedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Parser)]
#[command(name = "manifold", version, about = "Multi-route TCP reverse proxy for internal service fabrics")]
pub struct Options {
    /// Add a proxy route as '<listen>=<backend>[,...,<backendN>]'; use
    /// repeatedly for multiple routes
    #[arg(long = "route", value_name = "SPEC")]
    pub route: Vec<String>,

    /// The discovery service used for service lookup, as
    /// 'scheme://[rack.][az.]region[,...]' in descending order of
    /// preference; 'none' disables discovery
    #[arg(long, env = "HP_DISCOVERY_SERVICE", default_value = "etcd://us-east-1")]
    pub discovery: String,

    /// The domain under which zone discovery endpoints are published
    #[arg(long, env = "HP_DISCOVERY_DOMAIN", default_value = "")]
    pub domain: String,

    /// Both the read and write timeouts at once; overrides the individual
    /// timeouts
    #[arg(long = "timeout", env = "HP_TIMEOUT", value_name = "DURATION")]
    pub io_timeout: Option<String>,

    /// The connect timeout for backend dials
    #[arg(long = "timeout:connect", env = "HP_TIMEOUT_CONNECT", default_value = "5s", value_name = "DURATION")]
    pub connect_timeout: String,

    /// The read timeout for proxied connections
    #[arg(long = "timeout:read", env = "HP_TIMEOUT_READ", default_value = "5s", value_name = "DURATION")]
    pub read_timeout: String,

    /// The write timeout for proxied connections
    #[arg(long = "timeout:write", env = "HP_TIMEOUT_WRITE", default_value = "5s", value_name = "DURATION")]
    pub write_timeout: String,

    /// How long discovery results are cached
    #[arg(long = "timeout:cache", env = "HP_TIMEOUT_CACHE", default_value = "5m", value_name = "DURATION")]
    pub cache_timeout: String,

    /// The admin endpoint bind address
    #[arg(long = "status", env = "HP_STATUS", default_value = "127.0.0.1:5958")]
    pub status: String,

    /// The InfluxDB metrics reporting backend, as 'host[:port]'
    #[arg(long = "influxdb", env = "HP_METRICS_INFLUXDB")]
    pub influxdb: Option<String>,

    /// The alerting DSN error events are reported under
    #[arg(long = "sentry", env = "HP_SENTRY")]
    pub sentry: Option<String>,

    /// The environment in which the service is running
    #[arg(long, env = "HP_ENVIRON", default_value = "devel")]
    pub environ: String,

    /// Enable debugging mode
    #[arg(long, env = "HP_DEBUG", action = ArgAction::SetTrue)]
    pub debug: bool,

    /// Enable verbose debugging mode
    #[arg(long, env = "HP_VERBOSE", action = ArgAction::SetTrue)]
    pub verbose: bool,
}

/// Resolved configuration.
#[derive(Debug)]
pub struct Config {
    pub name: String,
    pub routes: Vec<Arc<Route>>,
    pub discovery: Option<ProviderSpec>,
    pub domain: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub cache_timeout: Duration,
    pub status: String,
    pub influxdb: Option<String>,
    pub sentry: Option<RedactedString>,
    pub environ: String,
    pub debug: bool,
    pub verbose: bool,
}

impl Config {
    /// Load configuration from the command line and environment.
    pub fn load() -> Result<Config> {
        let options = Options::parse();
        let routes_env = std::env::var("HP_ROUTES").ok();
        let optimize = std::env::var("HP_OPTIMIZE").ok().filter(|v| !v.is_empty());
        Self::resolve(options, routes_env, optimize.is_some())
    }

    /// Resolve options into a configuration. Split from `load` so tests
    /// can drive it without touching the process environment.
    pub fn resolve(
        options: Options,
        routes_env: Option<String>,
        optimize: bool,
    ) -> Result<Config> {
        if optimize {
            // The zero-copy transfer path is broken and has been removed
            bail!("HP_OPTIMIZE is not supported");
        }

        let mut specs = options.route;
        if let Some(joined) = routes_env {
            specs.extend(
                joined
                    .split(';')
                    .map(str::trim)
                    .filter(|spec| !spec.is_empty())
                    .map(str::to_string),
            );
        }
        if specs.is_empty() {
            bail!("no routes defined; use --route '<listen>=<backend>[,...,<backendN>]'");
        }

        let routes = specs
            .iter()
            .map(|spec| {
                Route::parse(spec)
                    .map(Arc::new)
                    .with_context(|| format!("invalid route: {}", spec))
            })
            .collect::<Result<Vec<_>>>()?;

        let discovery = match options.discovery.trim() {
            "" | "none" => None,
            spec => Some(
                ProviderSpec::parse(spec)
                    .map_err(|err| anyhow!("invalid discovery spec '{}': {}", spec, err))?,
            ),
        };

        if discovery.is_none() {
            if let Some(route) = routes.iter().find(|route| route.service) {
                bail!(
                    "no discovery service is defined but a service is used in route: {}",
                    route
                );
            }
        }

        let mut read_timeout = parse_duration(&options.read_timeout)
            .context("HP_TIMEOUT_READ must be a duration")?;
        let mut write_timeout = parse_duration(&options.write_timeout)
            .context("HP_TIMEOUT_WRITE must be a duration")?;
        if let Some(io_timeout) = &options.io_timeout {
            let io_timeout = parse_duration(io_timeout).context("HP_TIMEOUT must be a duration")?;
            if io_timeout > Duration::ZERO {
                read_timeout = io_timeout;
                write_timeout = io_timeout;
            }
        }

        Ok(Config {
            name: SERVICE_NAME.to_string(),
            routes,
            discovery,
            domain: options.domain,
            connect_timeout: parse_duration(&options.connect_timeout)
                .context("HP_TIMEOUT_CONNECT must be a duration")?,
            read_timeout,
            write_timeout,
            cache_timeout: parse_duration(&options.cache_timeout)
                .context("HP_TIMEOUT_CACHE must be a duration")?,
            status: options.status,
            influxdb: options.influxdb.filter(|endpoint| !endpoint.is_empty()),
            sentry: options
                .sentry
                .filter(|dsn| !dsn.is_empty())
                .map(RedactedString::new),
            environ: options.environ,
            debug: options.debug,
            verbose: options.verbose,
        })
    }
}

/// Parse a Go-style duration string; a bare `0` disables the timeout.
fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(input).map_err(|err| anyhow!("{}: {}", input, err))
}
