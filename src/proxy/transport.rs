//! Transport factory — cached backend connections keyed by TLS identity
//!
//! One `Transport` per `TransportKey`, each owning a bounded free list of
//! idle HTTP/1 connections. Dialing, TLS and handshake timeouts live
//! here so the round tripper sees classified dispatch errors instead of
//! raw IO failures. The route-service template is a separate client that
//! never shares connections with backend transports.

use crate::config::BackendConfig;
use crate::error::{Result, RouterError};
use crate::registry::TransportKey;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Body type sent to backends
pub type OutBody = UnsyncBoxBody<Bytes, hyper::Error>;

type Sender = http1::SendRequest<OutBody>;

/// A dispatch failure, pre-classified at the layer that observed it
#[derive(Debug)]
pub enum DispatchError {
    /// TCP connect did not complete within the dial timeout
    DialTimeout { authority: String },
    /// TCP connect failed outright
    DialFailed {
        authority: String,
        source: std::io::Error,
    },
    /// TLS handshake did not complete within its timeout
    TlsHandshakeTimeout { authority: String },
    /// TLS handshake failed
    TlsHandshakeFailed { authority: String, detail: String },
    /// The endpoint's certificate name cannot be used or did not match
    HostnameInvalid { authority: String, detail: String },
    /// The request failed after the connection was established
    RequestFailed {
        authority: String,
        source: hyper::Error,
    },
    /// Response headers did not arrive within the configured timeout
    ResponseHeaderTimeout { authority: String },
    /// The client abandoned the request mid-flight
    Canceled,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DialTimeout { authority } => write!(f, "dial timeout connecting {}", authority),
            Self::DialFailed { authority, source } => {
                write!(f, "dial failed connecting {}: {}", authority, source)
            }
            Self::TlsHandshakeTimeout { authority } => {
                write!(f, "TLS handshake timeout with {}", authority)
            }
            Self::TlsHandshakeFailed { authority, detail } => {
                write!(f, "TLS handshake with {} failed: {}", authority, detail)
            }
            Self::HostnameInvalid { authority, detail } => {
                write!(f, "invalid hostname for {}: {}", authority, detail)
            }
            Self::RequestFailed { authority, source } => {
                write!(f, "request to {} failed: {}", authority, source)
            }
            Self::ResponseHeaderTimeout { authority } => {
                write!(f, "response header timeout from {}", authority)
            }
            Self::Canceled => write!(f, "request canceled by client"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Tuning shared by all backend transports
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub dial_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_idle: usize,
}

impl TransportSettings {
    fn from_config(config: &BackendConfig) -> Self {
        Self {
            dial_timeout: config.dial_timeout(),
            tls_handshake_timeout: config.tls_handshake_timeout(),
            idle_timeout: config.idle_conn_timeout(),
            max_idle: config.max_idle_per_transport,
        }
    }
}

struct IdleConn {
    sender: Sender,
    last_used: Instant,
}

/// Connections to one endpoint identity
pub struct Transport {
    key: TransportKey,
    settings: TransportSettings,
    tls: Option<Arc<rustls::ClientConfig>>,
    idle: Mutex<Vec<IdleConn>>,
    last_activity: Mutex<Instant>,
}

impl Transport {
    fn new(
        key: TransportKey,
        settings: TransportSettings,
        tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            key,
            settings,
            tls,
            idle: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// The identity this transport serves
    pub fn key(&self) -> &TransportKey {
        &self.key
    }

    /// Number of idle connections currently cached
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// When this transport last dispatched a request
    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Obtain a connection: a pooled idle one when available, a fresh
    /// dial otherwise. Dial and TLS failures are classified here, before
    /// any request body is consumed.
    pub async fn acquire(&self) -> std::result::Result<Sender, DispatchError> {
        self.touch();
        if let Some(sender) = self.checkout() {
            return Ok(sender);
        }
        self.dial().await
    }

    /// Return a connection for reuse. Closed senders are dropped; a
    /// sender still streaming its response is kept and skipped at
    /// checkout until hyper reports it ready.
    pub fn checkin(&self, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.settings.max_idle {
            idle.push(IdleConn {
                sender,
                last_used: Instant::now(),
            });
        }
    }

    /// Drop idle connections past the idle timeout
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.retain(|c| {
            !c.sender.is_closed() && now.duration_since(c.last_used) < self.settings.idle_timeout
        });
    }

    fn checkout(&self) -> Option<Sender> {
        let now = Instant::now();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.retain(|c| {
            !c.sender.is_closed() && now.duration_since(c.last_used) < self.settings.idle_timeout
        });
        let position = idle.iter().position(|c| c.sender.is_ready())?;
        Some(idle.remove(position).sender)
    }

    async fn dial(&self) -> std::result::Result<Sender, DispatchError> {
        let authority = self.key.authority.clone();

        let stream = match tokio::time::timeout(
            self.settings.dial_timeout,
            TcpStream::connect(authority.as_str()),
        )
        .await
        {
            Err(_) => return Err(DispatchError::DialTimeout { authority }),
            Ok(Err(source)) => return Err(DispatchError::DialFailed { authority, source }),
            Ok(Ok(stream)) => stream,
        };
        let _ = stream.set_nodelay(true);

        match &self.tls {
            Some(tls_config) => {
                let name = self
                    .key
                    .server_cert_domain_san
                    .clone()
                    .unwrap_or_else(|| host_of(&authority).to_string());
                let server_name = ServerName::try_from(name.clone()).map_err(|e| {
                    DispatchError::HostnameInvalid {
                        authority: authority.clone(),
                        detail: format!("{}: {}", name, e),
                    }
                })?;
                let connector = TlsConnector::from(tls_config.clone());
                let tls_stream = match tokio::time::timeout(
                    self.settings.tls_handshake_timeout,
                    connector.connect(server_name, stream),
                )
                .await
                {
                    Err(_) => return Err(DispatchError::TlsHandshakeTimeout { authority }),
                    Ok(Err(e)) => {
                        let detail = e.to_string();
                        // a certificate that verifies but names someone
                        // else signals a stale endpoint
                        if detail.contains("NotValidForName") {
                            return Err(DispatchError::HostnameInvalid { authority, detail });
                        }
                        return Err(DispatchError::TlsHandshakeFailed { authority, detail });
                    }
                    Ok(Ok(tls_stream)) => tls_stream,
                };
                self.handshake(TokioIo::new(tls_stream), authority).await
            }
            None => self.handshake(TokioIo::new(stream), authority).await,
        }
    }

    async fn handshake<I>(
        &self,
        io: I,
        authority: String,
    ) -> std::result::Result<Sender, DispatchError>
    where
        I: hyper::rt::Read + hyper::rt::Write + Send + Unpin + 'static,
    {
        let (sender, conn) = http1::handshake(io)
            .await
            .map_err(|source| DispatchError::RequestFailed {
                authority: authority.clone(),
                source,
            })?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(authority, error = %e, "backend connection ended");
            }
        });
        Ok(sender)
    }
}

fn host_of(authority: &str) -> &str {
    authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority)
}

/// Concurrent `TransportKey -> Transport` cache plus the route-service
/// client template
pub struct TransportFactory {
    settings: TransportSettings,
    backend_tls: Arc<rustls::ClientConfig>,
    transports: Mutex<HashMap<TransportKey, Arc<Transport>>>,
    route_service: reqwest::Client,
}

impl TransportFactory {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let backend_tls = Arc::new(build_client_tls(config)?);

        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout())
            .pool_idle_timeout(config.idle_conn_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .use_rustls_tls();
        if config.skip_ssl_validation {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let route_service = builder
            .build()
            .map_err(|e| RouterError::Config(format!("route service client: {}", e)))?;

        Ok(Self {
            settings: TransportSettings::from_config(config),
            backend_tls,
            transports: Mutex::new(HashMap::new()),
            route_service,
        })
    }

    /// The transport for an endpoint identity; at most one per key
    pub fn backend(&self, key: &TransportKey) -> Arc<Transport> {
        let mut transports = self.transports.lock().unwrap_or_else(|e| e.into_inner());
        transports
            .entry(key.clone())
            .or_insert_with(|| {
                let tls = key.use_tls.then(|| self.backend_tls.clone());
                Arc::new(Transport::new(key.clone(), self.settings.clone(), tls))
            })
            .clone()
    }

    /// Drop a transport and its idle connections; wired to the
    /// registry's endpoint-removal hook
    pub fn evict(&self, key: &TransportKey) {
        let removed = self
            .transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        if removed.is_some() {
            tracing::debug!(key = %key, "evicted transport");
        }
    }

    /// Drop expired idle connections everywhere, and whole transports
    /// that have gone unused past the idle timeout
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let mut transports = self.transports.lock().unwrap_or_else(|e| e.into_inner());
        transports.retain(|_, t| {
            t.sweep_idle();
            t.idle_count() > 0 || now.duration_since(t.last_activity()) < self.settings.idle_timeout
        });
    }

    /// Shared client used for route service detours
    pub fn route_service_client(&self) -> &reqwest::Client {
        &self.route_service
    }

    /// Number of live transports
    pub fn transport_count(&self) -> usize {
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

fn build_client_tls(config: &BackendConfig) -> Result<rustls::ClientConfig> {
    // pin the crypto provider explicitly; the process may link more than
    // one provider through other TLS users
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| RouterError::Tls(format!("TLS protocol versions: {}", e)))?;

    if config.skip_ssl_validation {
        let verifier = danger::NoVerify::new();
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca_file) = &config.ca_file {
        let pem = std::fs::read(ca_file)
            .map_err(|e| RouterError::Tls(format!("Failed to read CA file {}: {}", ca_file, e)))?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RouterError::Tls(format!("Failed to parse CA file {}: {}", ca_file, e)))?;
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| RouterError::Tls(format!("Failed to add CA cert: {}", e)))?;
        }
    }

    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate. Guarded behind the
    /// `skip_ssl_validation` config flag.
    #[derive(Debug)]
    pub struct NoVerify {
        schemes: Vec<SignatureScheme>,
    }

    impl NoVerify {
        pub fn new() -> Self {
            Self {
                schemes: rustls::crypto::ring::default_provider()
                    .signature_verification_algorithms
                    .supported_schemes(),
            }
        }
    }

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.schemes.clone()
        }
    }
}
