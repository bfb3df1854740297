//! Test harness for proxy integration tests.
//!
//! Provides echo, silent, and TLS backend fixtures, a scripted discovery
//! fake, and a helper to spawn a fully wired proxy on ephemeral ports.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use manifold::discovery::{Discovery, DiscoveryError, Lease};
use manifold::proxy::{ProxyConfig, ProxyService};
use manifold::route::Route;

static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        tokio_rustls::rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// A TCP backend that echoes everything it reads.
#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    #[allow(dead_code)]
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A TCP backend that accepts connections and never reads or writes.
#[allow(dead_code)]
pub struct SilentBackend {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl SilentBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => held.push(stream),
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            drop(held);
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for SilentBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A TCP backend that greets each connection with a marker, then keeps
/// draining what it receives without ever sending again.
#[allow(dead_code)]
pub struct GreetingBackend {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl GreetingBackend {
    pub async fn spawn(greeting: &'static [u8]) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((mut stream, _)) => {
                                tokio::spawn(async move {
                                    if stream.write_all(greeting).await.is_err() {
                                        return;
                                    }
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(_) => {}
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for GreetingBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A TLS backend that records the SNI each client presented and answers
/// with a marker.
#[allow(dead_code)]
pub struct TlsBackend {
    pub addr: SocketAddr,
    pub cert_der: Vec<u8>,
    pub last_sni: Arc<Mutex<Option<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TlsBackend {
    pub async fn spawn(server_name: &str, marker: &str) -> io::Result<Self> {
        init_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(io::Error::other)?;
        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let certs = vec![CertificateDer::from(cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let last_sni = Arc::new(Mutex::new(None));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let sni_clone = Arc::clone(&last_sni);
        let marker_bytes = marker.as_bytes().to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let acceptor = acceptor.clone();
                                let sni = Arc::clone(&sni_clone);
                                let response = marker_bytes.clone();
                                tokio::spawn(async move {
                                    if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                                        let negotiated = tls_stream
                                            .get_ref()
                                            .1
                                            .server_name()
                                            .map(str::to_string);
                                        *sni.lock().unwrap() = negotiated;

                                        let mut buf = vec![0u8; 1024];
                                        if tls_stream.read(&mut buf).await.is_ok() {
                                            let _ = tls_stream.write_all(&response).await;
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert_der,
            last_sni,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    #[allow(dead_code)]
    pub fn negotiated_sni(&self) -> Option<String> {
        self.last_sni.lock().unwrap().clone()
    }
}

impl Drop for TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A discovery fake that answers from a fixed provider list.
pub struct StaticDiscovery {
    providers: Mutex<Vec<String>>,
    pub lookups: AtomicU64,
}

impl StaticDiscovery {
    #[allow(dead_code)]
    pub fn answering(providers: Vec<String>) -> Self {
        StaticDiscovery {
            providers: Mutex::new(providers),
            lookups: AtomicU64::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn empty() -> Self {
        Self::answering(Vec::new())
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn lookup_providers(
        &self,
        n: usize,
        _service: &str,
    ) -> Result<Vec<String>, DiscoveryError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let providers = self.providers.lock().unwrap();
        if providers.is_empty() {
            return Err(DiscoveryError::NoProviders);
        }
        Ok(providers.iter().take(n).cloned().collect())
    }

    async fn register_providers(
        &self,
        instance: &str,
        services: &BTreeMap<String, String>,
    ) -> Result<Lease, DiscoveryError> {
        Ok(Lease {
            instance: instance.to_string(),
            services: services.clone(),
            expires: tokio::time::Instant::now() + Duration::from_secs(10),
        })
    }
}

/// A proxy wired up on ephemeral ports.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub service: Arc<ProxyService>,
    pub addrs: Vec<SocketAddr>,
}

/// Spawn a proxy for the given route specs.
pub struct ProxyBuilder {
    routes: Vec<String>,
    discovery: Option<Arc<dyn Discovery>>,
    read_timeout: Duration,
    write_timeout: Duration,
    tls_roots: Option<RootCertStore>,
}

impl ProxyBuilder {
    pub fn new(routes: &[&str]) -> Self {
        ProxyBuilder {
            routes: routes.iter().map(|r| r.to_string()).collect(),
            discovery: None,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            tls_roots: None,
        }
    }

    #[allow(dead_code)]
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    #[allow(dead_code)]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[allow(dead_code)]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Trust the given DER certificate for TLS dials.
    #[allow(dead_code)]
    pub fn trust(mut self, cert_der: &[u8]) -> Self {
        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from(cert_der.to_vec()))
            .expect("valid test certificate");
        self.tls_roots = Some(roots);
        self
    }

    pub async fn spawn(self) -> io::Result<ProxyHandle> {
        init_crypto_provider();

        let routes = self
            .routes
            .iter()
            .map(|spec| Route::parse(spec).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let service = Arc::new(
            ProxyService::new(ProxyConfig {
                name: "manifold-test".to_string(),
                instance: "test-instance".to_string(),
                discovery: self.discovery,
                routes,
                connect_timeout: Duration::from_secs(2),
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                debug: false,
                tls_roots: self.tls_roots,
            })
            .await,
        );

        let addrs = service.start().await?;
        Ok(ProxyHandle { service, addrs })
    }
}

/// Connect, write a payload, and read a response of the expected size.
#[allow(dead_code)]
pub async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;

    let mut received = vec![0u8; payload.len()];
    stream.read_exact(&mut received).await?;
    Ok(received)
}

/// Poll a condition until it holds or the deadline passes.
#[allow(dead_code)]
pub async fn wait_for<F>(mut condition: F, deadline: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
