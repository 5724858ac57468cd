//! Configuration model for the router
//!
//! Loaded from a TOML file. Every section has serde defaults so a minimal
//! config with just a listen address is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, RouterError};

/// Policy for the `X-Forwarded-Client-Cert` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardedClientCert {
    /// Forward the inbound header untouched, always
    AlwaysForward,
    /// Forward the inbound header only on mTLS connections
    Forward,
    /// Strip the inbound header; on mTLS connections replace it with the
    /// PEM of the verified peer certificate
    SanitizeSet,
    /// Strip the inbound header unconditionally
    AlwaysSanitize,
}

impl Default for ForwardedClientCert {
    fn default() -> Self {
        Self::AlwaysSanitize
    }
}

/// TLS listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain file
    pub cert_file: String,
    /// PEM private key file
    pub key_file: String,
    /// Request (but do not require) a client certificate, for XFCC
    #[serde(default)]
    pub request_client_cert: bool,
}

/// Backend dialing and transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Maximum endpoint attempts per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// TLS handshake timeout in milliseconds
    #[serde(default = "default_tls_handshake_timeout_ms")]
    pub tls_handshake_timeout_ms: u64,
    /// Time to wait for response headers, in milliseconds (0 = unlimited)
    #[serde(default)]
    pub response_header_timeout_ms: u64,
    /// How long an idle backend connection may sit in the pool
    #[serde(default = "default_idle_conn_timeout_secs")]
    pub idle_conn_timeout_secs: u64,
    /// Maximum idle connections cached per transport key
    #[serde(default = "default_max_idle_per_transport")]
    pub max_idle_per_transport: usize,
    /// How long a failed endpoint stays out of rotation
    #[serde(default = "default_failed_endpoint_ttl_secs")]
    pub failed_endpoint_ttl_secs: u64,
    /// Accept any backend certificate (lab environments only)
    #[serde(default)]
    pub skip_ssl_validation: bool,
    /// Extra PEM CA bundle trusted for backend connections
    #[serde(default)]
    pub ca_file: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            dial_timeout_ms: default_dial_timeout_ms(),
            tls_handshake_timeout_ms: default_tls_handshake_timeout_ms(),
            response_header_timeout_ms: 0,
            idle_conn_timeout_secs: default_idle_conn_timeout_secs(),
            max_idle_per_transport: default_max_idle_per_transport(),
            failed_endpoint_ttl_secs: default_failed_endpoint_ttl_secs(),
            skip_ssl_validation: false,
            ca_file: None,
        }
    }
}

impl BackendConfig {
    /// TCP connect timeout
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// TLS handshake timeout
    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }

    /// Response-header timeout, if configured
    pub fn response_header_timeout(&self) -> Option<Duration> {
        if self.response_header_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.response_header_timeout_ms))
        }
    }

    /// Idle connection timeout
    pub fn idle_conn_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_conn_timeout_secs)
    }

    /// Failed endpoint quarantine period
    pub fn failed_endpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.failed_endpoint_ttl_secs)
    }
}

/// Route service detour configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteServiceConfig {
    /// Symmetric signing secret; any length, hashed to the AEAD key
    #[serde(default)]
    pub signing_key: String,
    /// Signature freshness window in seconds
    #[serde(default = "default_route_service_timeout_secs")]
    pub timeout_secs: u64,
    /// Build https forwarded URLs even for plaintext listeners
    #[serde(default)]
    pub recommend_https: bool,
}

impl Default for RouteServiceConfig {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
            timeout_secs: default_route_service_timeout_secs(),
            recommend_https: false,
        }
    }
}

impl RouteServiceConfig {
    /// Signature freshness window
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Header forwarding policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// X-Forwarded-Client-Cert policy
    #[serde(default)]
    pub forwarded_client_cert: ForwardedClientCert,
    /// Always send `X-Forwarded-Proto: https` to backends
    #[serde(default)]
    pub force_forwarded_proto_https: bool,
    /// Replace any inbound X-Forwarded-Proto with the connection scheme
    #[serde(default = "default_true")]
    pub sanitize_forwarded_proto: bool,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            forwarded_client_cert: ForwardedClientCert::default(),
            force_forwarded_proto_https: false,
            sanitize_forwarded_proto: true,
        }
    }
}

/// Request size caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum total request header bytes (0 = unlimited)
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Maximum declared request body bytes (0 = unlimited)
    #[serde(default)]
    pub max_body_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: 0,
        }
    }
}

/// Sticky session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickyConfig {
    /// App cookies whose presence pins the client to an endpoint
    #[serde(default = "default_sticky_cookies")]
    pub cookie_names: Vec<String>,
    /// Mark the affinity cookie Secure
    #[serde(default)]
    pub secure_cookie: bool,
    /// SameSite attribute for the affinity cookie (empty = omit)
    #[serde(default)]
    pub same_site: String,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            cookie_names: default_sticky_cookies(),
            secure_cookie: false,
            same_site: String::new(),
        }
    }
}

/// Access log tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Append per-attempt detail to access log entries
    #[serde(default)]
    pub enable_attempts_details: bool,
}

/// Trace header propagation toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Normalise Zipkin B3 headers
    #[serde(default = "default_true")]
    pub enable_zipkin: bool,
    /// Normalise W3C traceparent
    #[serde(default)]
    pub enable_w3c: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enable_zipkin: true,
            enable_w3c: false,
        }
    }
}

/// Endpoint balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Balance {
    RoundRobin,
    LeastResponseTime,
}

impl Default for Balance {
    fn default() -> Self {
        Self::RoundRobin
    }
}

/// A route seeded at startup, ahead of dynamic discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRoute {
    /// Routable host, wildcards allowed ("*.apps.example.com")
    pub host: String,
    /// Path prefix owned by this route
    #[serde(default = "default_route_path")]
    pub path: String,
    /// Backend "address:port" entries
    pub backends: Vec<String>,
    /// Route service fronting this route, if any
    #[serde(default)]
    pub route_service_url: Option<String>,
}

/// Top-level router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// HTTP listen address, e.g. "0.0.0.0:80"
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Optional HTTPS listener
    #[serde(default)]
    pub tls_listen: Option<String>,
    /// TLS material for the HTTPS listener
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// User-Agent that identifies platform health probes
    #[serde(default = "default_healthcheck_user_agent")]
    pub healthcheck_user_agent: String,
    /// Answer 404 instead of 503 when a matched pool is empty
    #[serde(default)]
    pub empty_pool_404: bool,
    /// Accept HTTP/2 requests
    #[serde(default)]
    pub enable_http2: bool,
    /// Keep HTTP/1 full-duplex streaming enabled
    #[serde(default = "default_true")]
    pub enable_http1_concurrent_read_write: bool,
    /// Shared secret enabling X-Vcap-Trace response headers
    #[serde(default)]
    pub trace_key: String,
    /// Externally visible address reported in trace headers
    #[serde(default = "default_router_address")]
    pub router_address: String,
    /// Endpoint balancing strategy
    #[serde(default)]
    pub balance: Balance,
    /// Routes seeded at startup
    #[serde(default)]
    pub static_routes: Vec<StaticRoute>,

    #[serde(default)]
    pub backends: BackendConfig,
    #[serde(default)]
    pub route_services: RouteServiceConfig,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub sticky: StickyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls_listen: None,
            tls: None,
            healthcheck_user_agent: default_healthcheck_user_agent(),
            empty_pool_404: false,
            enable_http2: false,
            enable_http1_concurrent_read_write: true,
            trace_key: String::new(),
            router_address: default_router_address(),
            balance: Balance::default(),
            static_routes: Vec::new(),
            backends: BackendConfig::default(),
            route_services: RouteServiceConfig::default(),
            forwarding: ForwardingConfig::default(),
            limits: LimitsConfig::default(),
            sticky: StickyConfig::default(),
            logging: LoggingConfig::default(),
            tracing: TracingConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Load configuration from a TOML file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            RouterError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RouterError::Config(format!("Failed to parse TOML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(RouterError::Config(format!(
                "Invalid listen address '{}'",
                self.listen
            )));
        }
        if let Some(tls_listen) = &self.tls_listen {
            if tls_listen.parse::<std::net::SocketAddr>().is_err() {
                return Err(RouterError::Config(format!(
                    "Invalid tls_listen address '{}'",
                    tls_listen
                )));
            }
            if self.tls.is_none() {
                return Err(RouterError::Config(
                    "tls_listen requires a [tls] section".to_string(),
                ));
            }
        }
        if self.backends.max_attempts == 0 {
            return Err(RouterError::Config(
                "backends.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backends.dial_timeout_ms == 0 {
            return Err(RouterError::Config(
                "backends.dial_timeout_ms must be greater than 0".to_string(),
            ));
        }
        for route in &self.static_routes {
            if route.host.is_empty() {
                return Err(RouterError::Config(
                    "static route with an empty host".to_string(),
                ));
            }
            for backend in &route.backends {
                if backend.parse::<std::net::SocketAddr>().is_err() {
                    return Err(RouterError::Config(format!(
                        "Invalid backend address '{}' for route '{}'",
                        backend, route.host
                    )));
                }
            }
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_healthcheck_user_agent() -> String {
    "HTTP-Monitor/1.1".to_string()
}

fn default_router_address() -> String {
    "127.0.0.1".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

fn default_tls_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_idle_conn_timeout_secs() -> u64 {
    90
}

fn default_max_idle_per_transport() -> usize {
    100
}

fn default_failed_endpoint_ttl_secs() -> u64 {
    30
}

fn default_route_service_timeout_secs() -> u64 {
    60
}

fn default_max_header_bytes() -> usize {
    1024 * 1024
}

fn default_sticky_cookies() -> Vec<String> {
    vec!["JSESSIONID".to_string()]
}

fn default_route_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}
