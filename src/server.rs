//! Listener loop — accepts connections and serves them through the proxy
//!
//! One plaintext listener plus an optional TLS listener. Each connection
//! is served by hyper's HTTP/1 machinery; connection-level facts (peer
//! address, TLS, verified client certificate) are captured once and
//! handed to every request on that connection.

use crate::config::{Balance, RouterConfig, TlsConfig};
use crate::error::{Result, RouterError};
use crate::health::Health;
use crate::observability::{AccessLogger, ProxyReporter};
use crate::proxy::{ConnectionContext, Proxy};
use crate::registry::{BalanceStrategy, Endpoint, RouteRegistry};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// How often idle backend connections are reaped
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The assembled router: registry, proxy core and listeners
pub struct Server {
    config: Arc<RouterConfig>,
    registry: Arc<RouteRegistry>,
    proxy: Arc<Proxy>,
    health: Arc<Health>,
    reporter: Arc<ProxyReporter>,
    access_log: Arc<AccessLogger>,
}

impl Server {
    /// Wire up the core and seed any static routes
    pub fn new(config: RouterConfig) -> Result<Self> {
        config.validate()?;

        let strategy = match config.balance {
            Balance::RoundRobin => BalanceStrategy::RoundRobin,
            Balance::LeastResponseTime => BalanceStrategy::LeastResponseTime,
        };
        let registry = Arc::new(RouteRegistry::new(
            strategy,
            config.backends.failed_endpoint_ttl(),
        ));
        let health = Arc::new(Health::new());
        let reporter = Arc::new(ProxyReporter::new());
        let access_log = Arc::new(AccessLogger::new(config.logging.enable_attempts_details));
        let proxy = Proxy::new(
            &config,
            registry.clone(),
            health.clone(),
            reporter.clone(),
            access_log.clone(),
        )?;

        if !config.enable_http1_concurrent_read_write {
            // hyper streams HTTP/1 request and response concurrently by
            // nature; the flag is honored as a warning, not a behavior
            tracing::warn!("enable_http1_concurrent_read_write=false has no effect; HTTP/1 connections are served full-duplex");
        }

        let server = Self {
            config: Arc::new(config),
            registry,
            proxy,
            health,
            reporter,
            access_log,
        };
        server.seed_static_routes()?;
        Ok(server)
    }

    fn seed_static_routes(&self) -> Result<()> {
        for route in &self.config.static_routes {
            let pool = self.registry.pool_for(&route.host, &route.path);
            pool.set_route_service_url(route.route_service_url.clone());
            for backend in &route.backends {
                let addr: SocketAddr = backend.parse().map_err(|e| {
                    RouterError::Config(format!("Invalid backend '{}': {}", backend, e))
                })?;
                self.registry.register(
                    &route.host,
                    &route.path,
                    Endpoint::new(addr.ip().to_string(), addr.port()),
                );
            }
            tracing::info!(
                host = route.host,
                path = route.path,
                backends = route.backends.len(),
                "seeded static route"
            );
        }
        Ok(())
    }

    /// The route registry, for discovery integrations and tests
    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    /// The health flag served to platform probes
    pub fn health(&self) -> &Arc<Health> {
        &self.health
    }

    /// Counter access for the admin surface and tests
    pub fn reporter(&self) -> &Arc<ProxyReporter> {
        &self.reporter
    }

    /// Access log sink
    pub fn access_log(&self) -> &Arc<AccessLogger> {
        &self.access_log
    }

    /// Bind all listeners and start serving. Returns the listener tasks
    /// and the addresses actually bound.
    pub async fn run(&self) -> Result<(Vec<tokio::task::JoinHandle<()>>, Vec<SocketAddr>)> {
        let mut handles = Vec::new();
        let mut addrs = Vec::new();

        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|e| RouterError::Config(format!("bind {}: {}", self.config.listen, e)))?;
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP listener ready");
        addrs.push(addr);
        handles.push(self.spawn_accept_loop(listener, None));

        if let (Some(tls_listen), Some(tls_config)) = (&self.config.tls_listen, &self.config.tls) {
            let listener = TcpListener::bind(tls_listen)
                .await
                .map_err(|e| RouterError::Config(format!("bind {}: {}", tls_listen, e)))?;
            let addr = listener.local_addr()?;
            let acceptor = build_tls_acceptor(tls_config)?;
            tracing::info!(address = %addr, "HTTPS listener ready");
            addrs.push(addr);
            handles.push(self.spawn_accept_loop(listener, Some(acceptor)));
        }

        // reap idle backend connections and stale transports
        let factory = self.proxy.transport_factory().clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                factory.sweep_idle();
            }
        }));

        Ok((handles, addrs))
    }

    fn spawn_accept_loop(
        &self,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> tokio::task::JoinHandle<()> {
        let proxy = self.proxy.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        continue;
                    }
                };
                let proxy = proxy.clone();
                let acceptor = acceptor.clone();

                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                let peer_cert_pem = peer_certificate_pem(&tls_stream);
                                let ctx = ConnectionContext {
                                    peer_addr,
                                    tls: true,
                                    peer_cert_pem,
                                };
                                serve_connection(TokioIo::new(tls_stream), proxy, ctx).await;
                            }
                            Err(e) => {
                                tracing::debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                            }
                        },
                        None => {
                            let ctx = ConnectionContext {
                                peer_addr,
                                tls: false,
                                peer_cert_pem: None,
                            };
                            serve_connection(TokioIo::new(stream), proxy, ctx).await;
                        }
                    }
                });
            }
        })
    }
}

async fn serve_connection<I>(io: I, proxy: Arc<Proxy>, ctx: ConnectionContext)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let peer = ctx.peer_addr;
    let service = service_fn(move |request| {
        let proxy = proxy.clone();
        let ctx = ctx.clone();
        async move { proxy.handle(request, ctx).await }
    });
    if let Err(e) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        tracing::debug!(peer = %peer, error = %e, "connection ended");
    }
}

/// Build the TLS acceptor for the HTTPS listener
pub fn build_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = load_certs(&config.cert_file)?;
    let key = load_private_key(&config.key_file)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| RouterError::Tls(format!("TLS protocol versions: {}", e)))?;
    let server_config = if config.request_client_cert {
        builder
            .with_client_cert_verifier(Arc::new(client_auth::AcceptAnyClientCert::new()))
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .map_err(|e| RouterError::Tls(format!("TLS configuration error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(Path::new(path))
        .map_err(|e| RouterError::Tls(format!("Failed to open certificate file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RouterError::Tls(format!("Failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(RouterError::Tls(
            "No certificates found in certificate file".to_string(),
        ));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(Path::new(path))
        .map_err(|e| RouterError::Tls(format!("Failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RouterError::Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| RouterError::Tls("No private key found in key file".to_string()))
}

/// PEM of the first verified peer certificate, for the XFCC policy
fn peer_certificate_pem<S>(stream: &tokio_rustls::server::TlsStream<S>) -> Option<String> {
    let (_, connection) = stream.get_ref();
    let certs = connection.peer_certificates()?;
    let first = certs.first()?;
    Some(der_to_pem(first.as_ref()))
}

fn der_to_pem(der: &[u8]) -> String {
    let encoded = BASE64_STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

mod client_auth {
    use rustls::pki_types::{CertificateDer, UnixTime};
    use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
    use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};

    /// Requests a client certificate without requiring one, and accepts
    /// whatever the client presents. Identity trust is delegated to the
    /// XFCC policy downstream.
    #[derive(Debug)]
    pub struct AcceptAnyClientCert {
        schemes: Vec<SignatureScheme>,
        roots: Vec<DistinguishedName>,
    }

    impl AcceptAnyClientCert {
        pub fn new() -> Self {
            Self {
                schemes: rustls::crypto::ring::default_provider()
                    .signature_verification_algorithms
                    .supported_schemes(),
                roots: Vec::new(),
            }
        }
    }

    impl ClientCertVerifier for AcceptAnyClientCert {
        fn root_hint_subjects(&self) -> &[DistinguishedName] {
            &self.roots
        }

        fn verify_client_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _now: UnixTime,
        ) -> std::result::Result<ClientCertVerified, rustls::Error> {
            Ok(ClientCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.schemes.clone()
        }

        fn client_auth_mandatory(&self) -> bool {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticRoute;

    fn free_listen() -> String {
        "127.0.0.1:0".to_string()
    }

    #[test]
    fn test_server_new_with_defaults() {
        let mut config = RouterConfig::default();
        config.listen = free_listen();
        let server = Server::new(config).unwrap();
        assert_eq!(server.registry().route_count(), 0);
    }

    #[test]
    fn test_static_routes_seeded() {
        let mut config = RouterConfig::default();
        config.listen = free_listen();
        config.static_routes = vec![StaticRoute {
            host: "app.example.com".to_string(),
            path: "/".to_string(),
            backends: vec!["10.0.0.1:8080".to_string(), "10.0.0.2:8080".to_string()],
            route_service_url: None,
        }];
        let server = Server::new(config).unwrap();
        let pool = server.registry().lookup("app.example.com", "/").unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_static_route_with_route_service() {
        let mut config = RouterConfig::default();
        config.listen = free_listen();
        config.route_services.signing_key = "secret".to_string();
        config.static_routes = vec![StaticRoute {
            host: "filtered.example.com".to_string(),
            path: "/".to_string(),
            backends: vec!["10.0.0.1:8080".to_string()],
            route_service_url: Some("https://rs.example.com".to_string()),
        }];
        let server = Server::new(config).unwrap();
        let pool = server.registry().lookup("filtered.example.com", "/").unwrap();
        assert_eq!(
            pool.route_service_url().as_deref(),
            Some("https://rs.example.com")
        );
    }

    #[tokio::test]
    async fn test_run_binds_listener() {
        let mut config = RouterConfig::default();
        config.listen = free_listen();
        let server = Server::new(config).unwrap();
        let (handles, addrs) = server.run().await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);
        for handle in handles {
            handle.abort();
        }
    }

    #[test]
    fn test_tls_acceptor_missing_files() {
        let config = TlsConfig {
            cert_file: "/nonexistent/cert.pem".to_string(),
            key_file: "/nonexistent/key.pem".to_string(),
            request_client_cert: false,
        };
        let result = build_tls_acceptor(&config);
        assert!(result.is_err());
        match result {
            Err(e) => assert!(e.to_string().contains("certificate file")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_tls_acceptor_empty_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();

        let config = TlsConfig {
            cert_file: cert_path.to_str().unwrap().to_string(),
            key_file: key_path.to_str().unwrap().to_string(),
            request_client_cert: false,
        };
        let result = build_tls_acceptor(&config);
        assert!(result.is_err());
        match result {
            Err(e) => assert!(e.to_string().contains("No certificates")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_der_to_pem_shape() {
        let pem = der_to_pem(&[0u8; 100]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        // base64 lines wrapped at 64 columns
        for line in pem.lines() {
            assert!(line.len() <= 64 || line.starts_with("-----"));
        }
    }
}
