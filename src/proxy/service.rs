//! The proxy data path.
//!
//! One listener per route, an accept loop per listener, and an independent
//! handler per accepted connection. The handler resolves a backend address
//! (through discovery for service routes, round-robin for host routes),
//! dials it (optionally over TLS) and relays bytes in both directions
//! until either side closes or fails.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn, Instrument};

use crate::discovery::Discovery;
use crate::route::{Backend, Route, PARAM_TLS};

use super::cmap::{CounterMap, Entry};

/// Read size for the relay pumps.
const COPY_BUFFER: usize = 32 * 1024;

/// Pause after a failed accept so a persistent error does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Anything a pump can read from and write to.
trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type BoxedStream = Box<dyn Io>;

/// Relay direction, from the client's point of view.
#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToBackend,
    BackendToClient,
}

/// Absolute read and write deadlines for one socket, shared by the pump
/// that reads from it and the pump that writes into it. The reading pump
/// re-arms both deadlines after every read; the opposite pump's writes
/// into the socket are bounded by the write deadline. A deadline stays
/// unarmed until the socket delivers its first byte.
struct SocketDeadlines {
    epoch: Instant,
    read_nanos: AtomicU64,
    write_nanos: AtomicU64,
}

impl SocketDeadlines {
    fn new() -> SocketDeadlines {
        SocketDeadlines {
            epoch: Instant::now(),
            read_nanos: AtomicU64::new(0),
            write_nanos: AtomicU64::new(0),
        }
    }

    /// Re-arm each deadline to now plus its configured timeout. A zero
    /// timeout leaves that deadline unarmed.
    fn refresh(&self, read_timeout: Duration, write_timeout: Duration) {
        let now = self.epoch.elapsed();
        if read_timeout > Duration::ZERO {
            self.read_nanos
                .store((now + read_timeout).as_nanos() as u64, Ordering::Relaxed);
        }
        if write_timeout > Duration::ZERO {
            self.write_nanos
                .store((now + write_timeout).as_nanos() as u64, Ordering::Relaxed);
        }
    }

    fn read_deadline(&self) -> Option<Instant> {
        self.instant(self.read_nanos.load(Ordering::Relaxed))
    }

    fn write_deadline(&self) -> Option<Instant> {
        self.instant(self.write_nanos.load(Ordering::Relaxed))
    }

    fn instant(&self, nanos: u64) -> Option<Instant> {
        if nanos == 0 {
            None
        } else {
            Some(self.epoch + Duration::from_nanos(nanos))
        }
    }
}

/// Service configuration.
pub struct ProxyConfig {
    pub name: String,
    pub instance: String,
    pub discovery: Option<Arc<dyn Discovery>>,
    pub routes: Vec<Arc<Route>>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub debug: bool,
    /// Trust anchors for TLS dials; the platform web roots when unset.
    pub tls_roots: Option<RootCertStore>,
}

/// Live operational counters. Shared with the admin endpoint and the stats
/// shipper; snapshots are eventually consistent with the hot path.
#[derive(Debug, Default)]
pub struct ServiceStats {
    pub accepted: AtomicU64,
    pub open_conns: AtomicI64,
    pub total_conns: AtomicI64,
    pub bytes_xfer: AtomicI64,
    pub io_workers: AtomicI64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub resolve_errors: AtomicU64,
    pub connect_errors: AtomicU64,
    pub xfer_errors: AtomicU64,
    pub resolves: AtomicU64,
    pub resolve_micros: AtomicU64,
    pub connects: AtomicU64,
    pub connect_micros: AtomicU64,
}

/// A point-in-time stats snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub open_conns: i64,
    pub total_conns: i64,
    pub bytes_xfer: i64,
    pub total_conns_by_route: HashMap<String, i64>,
    pub io_workers: i64,
}

/// The proxy service.
pub struct ProxyService {
    name: String,
    instance: String,
    discovery: Option<Arc<dyn Discovery>>,
    routes: Vec<Arc<Route>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    debug: bool,
    tls: TlsConnector,
    stats: Arc<ServiceStats>,
    by_route: CounterMap,
    update_tx: mpsc::Sender<Entry>,
}

impl ProxyService {
    pub async fn new(config: ProxyConfig) -> ProxyService {
        let roots = config.tls_roots.unwrap_or_else(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            roots
        });
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let by_route = CounterMap::new();
        let update_tx = by_route.put().await;

        ProxyService {
            name: config.name,
            instance: config.instance,
            discovery: config.discovery,
            routes: config.routes,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            debug: config.debug,
            tls: TlsConnector::from(Arc::new(tls_config)),
            stats: Arc::new(ServiceStats::default()),
            by_route,
            update_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The live counters backing the stats snapshot.
    pub fn service_stats(&self) -> Arc<ServiceStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot the service counters.
    pub async fn stats(&self) -> Stats {
        Stats {
            open_conns: self.stats.open_conns.load(Ordering::Relaxed),
            total_conns: self.stats.total_conns.load(Ordering::Relaxed),
            bytes_xfer: self.stats.bytes_xfer.load(Ordering::Relaxed),
            total_conns_by_route: self.by_route.copy().await,
            io_workers: self.stats.io_workers.load(Ordering::Relaxed),
        }
    }

    /// Bind every route's listener and spawn its accept loop. Returns the
    /// bound local addresses, in route order. Any bind failure aborts.
    pub async fn start(self: &Arc<Self>) -> io::Result<Vec<SocketAddr>> {
        let mut listeners = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let listener = TcpListener::bind(listen_addr(&route.listen)).await?;
            let local_addr = listener.local_addr()?;
            info!(listen = %local_addr, route = %route, "serving requests");
            listeners.push((Arc::clone(route), listener));
        }

        let mut addrs = Vec::with_capacity(listeners.len());
        for (route, listener) in listeners {
            addrs.push(listener.local_addr()?);
            let service = Arc::clone(self);
            tokio::spawn(async move { service.accept_loop(route, listener).await });
        }
        Ok(addrs)
    }

    /// Handle requests forever. Never returns except on a bind failure.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        self.start().await?;
        std::future::pending::<()>().await;
        Ok(())
    }

    /// Accept connections for one route. Transient accept errors are
    /// logged and never kill the loop.
    async fn accept_loop(self: Arc<Self>, route: Arc<Route>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    self.stats.open_conns.fetch_add(1, Ordering::Relaxed);
                    self.stats.total_conns.fetch_add(1, Ordering::Relaxed);

                    let service = Arc::clone(&self);
                    let route = Arc::clone(&route);
                    let handler = async move {
                        service.handle(route, stream, peer_addr).await;
                        service.stats.open_conns.fetch_sub(1, Ordering::Relaxed);
                    };
                    if self.debug {
                        tokio::spawn(
                            handler.instrument(tracing::info_span!("connection", peer = %peer_addr)),
                        );
                    } else {
                        tokio::spawn(handler);
                    }
                }
                Err(err) => {
                    error!(error = %err, "could not accept");
                    sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Handle one accepted connection. Both sockets are dropped on every
    /// exit path; the surviving pump is torn down when the first one
    /// reports.
    async fn handle(&self, route: Arc<Route>, client: TcpStream, peer_addr: SocketAddr) {
        let client_ip = peer_addr.ip().to_string();
        let started = Instant::now();

        // Resolve a backend address for this connection
        let (backend, addr) = if route.service {
            let Some(discovery) = &self.discovery else {
                self.stats.resolve_errors.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %peer_addr, route = %route, "discovery not available");
                return;
            };
            let backend = route.any().clone();
            match discovery.lookup_provider(&backend.addr).await {
                Ok(addr) => (backend, addr),
                Err(err) => {
                    self.stats.resolve_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %peer_addr, route = %route, error = %err, "could not discover service");
                    return;
                }
            }
        } else {
            let backend = route.next().clone();
            let addr = backend.addr.clone();
            (backend, addr)
        };

        let key = if route.service {
            backend.to_string()
        } else {
            addr.clone()
        };
        let _ = self
            .update_tx
            .send(Entry {
                key,
                delta: 1,
                client: client_ip,
            })
            .await;

        self.stats.resolves.fetch_add(1, Ordering::Relaxed);
        self.stats
            .resolve_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        debug!(peer = %peer_addr, backend = %addr, "proxying to backend");

        // Dial the backend
        let dial_started = Instant::now();
        let upstream = match self.dial(&backend, &addr).await {
            Ok(stream) => stream,
            Err(err) => {
                self.stats.connect_errors.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer_addr, backend = %addr, error = %err, "could not connect to backend");
                return;
            }
        };
        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        self.stats
            .connect_micros
            .fetch_add(dial_started.elapsed().as_micros() as u64, Ordering::Relaxed);

        // One pump per direction, each with its own error channel. The
        // first to report ends the connection; aborting the other drops
        // its halves, which closes both sockets. Each socket's deadlines
        // are shared: the pump reading it re-arms them, the pump writing
        // into it consults the write deadline.
        let client: BoxedStream = Box::new(client);
        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);

        let client_deadlines = Arc::new(SocketDeadlines::new());
        let upstream_deadlines = Arc::new(SocketDeadlines::new());

        let (in_tx, mut in_rx) = mpsc::channel::<io::Error>(1);
        let (out_tx, mut out_rx) = mpsc::channel::<io::Error>(1);

        let inbound = tokio::spawn(pump(
            client_read,
            upstream_write,
            Direction::ClientToBackend,
            Arc::clone(&self.stats),
            Arc::clone(&client_deadlines),
            Arc::clone(&upstream_deadlines),
            self.read_timeout,
            self.write_timeout,
            in_tx,
        ));
        let outbound = tokio::spawn(pump(
            upstream_read,
            client_write,
            Direction::BackendToClient,
            Arc::clone(&self.stats),
            Arc::clone(&upstream_deadlines),
            Arc::clone(&client_deadlines),
            self.read_timeout,
            self.write_timeout,
            out_tx,
        ));

        let first = tokio::select! {
            err = in_rx.recv() => err,
            err = out_rx.recv() => err,
        };
        if let Some(err) = first {
            self.stats.xfer_errors.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %peer_addr, backend = %addr, error = %err, "could not proxy");
        }

        inbound.abort();
        outbound.abort();

        debug!(peer = %peer_addr, backend = %addr, "connection will end");
    }

    /// Dial a backend, over TLS when the backend declares a `tls`
    /// parameter whose value is the server name to present.
    async fn dial(&self, backend: &Backend, addr: &str) -> io::Result<BoxedStream> {
        let stream = if self.connect_timeout > Duration::ZERO {
            timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??
        } else {
            TcpStream::connect(addr).await?
        };

        match backend.params.get(PARAM_TLS) {
            Some(sni) => {
                // An empty server name falls back to the dialed host
                let name = if sni.is_empty() {
                    host_of(addr).to_string()
                } else {
                    sni.clone()
                };
                debug!(backend = %addr, server_name = %name, "dialing via TLS");
                let server_name = ServerName::try_from(name)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
                let stream = self.tls.connect(server_name, stream).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

/// Decrements the worker gauge even when the owning pump is aborted.
struct WorkerGuard(Arc<ServiceStats>);

impl WorkerGuard {
    fn new(stats: &Arc<ServiceStats>) -> Self {
        stats.io_workers.fetch_add(1, Ordering::Relaxed);
        WorkerGuard(Arc::clone(stats))
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.io_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Copy bytes one way until the source ends or either side fails.
///
/// Deadlines restart after activity on the source socket only: every read
/// re-arms both of the source's deadlines at now plus the configured
/// timeouts. Reads here are bounded by the source's read deadline; writes
/// are bounded by the destination socket's write deadline, which the
/// opposite pump re-arms as it reads that socket. Writes into a socket
/// therefore stay live only while the socket itself keeps delivering
/// bytes. End of stream exits cleanly without an emission; any other
/// failure, including the zero-length write surfaced as `WriteZero`, is
/// emitted on the error channel. The channel closing with no emission
/// tells the waiter the pump ended cleanly.
async fn pump(
    mut src: ReadHalf<BoxedStream>,
    mut dst: WriteHalf<BoxedStream>,
    direction: Direction,
    stats: Arc<ServiceStats>,
    src_deadlines: Arc<SocketDeadlines>,
    dst_deadlines: Arc<SocketDeadlines>,
    read_timeout: Duration,
    write_timeout: Duration,
    errs: mpsc::Sender<io::Error>,
) {
    let _worker = WorkerGuard::new(&stats);
    let mut buf = vec![0u8; COPY_BUFFER];

    loop {
        let read = match src_deadlines.read_deadline() {
            Some(deadline) => match timeout_at(deadline, src.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read idle timeout")),
            },
            None => src.read(&mut buf).await,
        };

        // Deadlines restart after activity, on the source only
        src_deadlines.refresh(read_timeout, write_timeout);

        match read {
            // End of stream: close the error channel without an emission
            Ok(0) => break,
            Ok(n) => {
                stats.bytes_xfer.fetch_add(n as i64, Ordering::Relaxed);
                match direction {
                    Direction::ClientToBackend => {
                        stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed)
                    }
                    Direction::BackendToClient => {
                        stats.bytes_written.fetch_add(n as u64, Ordering::Relaxed)
                    }
                };

                if let Err(err) =
                    write_with_deadline(&mut dst, &buf[..n], &dst_deadlines, write_timeout).await
                {
                    let _ = errs.send(err).await;
                    break;
                }
            }
            Err(err) => {
                let _ = errs.send(err).await;
                break;
            }
        }
    }
}

/// Write the whole buffer into the destination, bounded by the
/// destination socket's write deadline. The deadline is an absolute point
/// that only the opposite pump moves, so an expired deadline fails the
/// write immediately and a blocked write re-arms whenever the deadline
/// advances.
async fn write_with_deadline(
    dst: &mut WriteHalf<BoxedStream>,
    buf: &[u8],
    deadlines: &SocketDeadlines,
    write_timeout: Duration,
) -> io::Result<()> {
    if write_timeout == Duration::ZERO {
        return dst.write_all(buf).await;
    }

    let write = dst.write_all(buf);
    tokio::pin!(write);
    loop {
        match deadlines.write_deadline() {
            // Unarmed until the destination delivers its first byte;
            // re-check in case the opposite pump arms it mid-write
            None => {
                tokio::select! {
                    result = &mut write => return result,
                    _ = sleep(write_timeout) => {}
                }
            }
            Some(deadline) if deadline <= Instant::now() => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "write idle timeout"));
            }
            Some(deadline) => {
                tokio::select! {
                    result = &mut write => return result,
                    // The deadline may have moved while the write was
                    // blocked; the next pass re-reads it
                    _ = sleep_until(deadline) => {}
                }
            }
        }
    }
}

/// Normalize a listen spec into a bindable address: a bare `:port`
/// listens on every interface.
fn listen_addr(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    }
}

/// The host portion of a `host:port` address, with IPv6 brackets removed.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
