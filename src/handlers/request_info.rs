//! Per-request state threaded through the pipeline
//!
//! Created once at chain entry and passed as an explicit argument to every
//! handler; later stages fill in routing, detour and attempt state, and
//! the access log reads it after the response completes.

use crate::error::{Result, RouterError};
use crate::registry::{Endpoint, Pool, TransportKey};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A client-requested instance restriction from `X-CF-App-Instance`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInstance {
    pub app_id: String,
    pub index: u32,
}

impl AppInstance {
    /// Parse "app_id:index"; both parts must be non-empty
    pub fn parse(raw: &str) -> Option<Self> {
        let (app_id, index) = raw.split_once(':')?;
        if app_id.is_empty() {
            return None;
        }
        let index = index.parse().ok()?;
        Some(Self {
            app_id: app_id.to_string(),
            index,
        })
    }
}

/// Outcome of one backend attempt
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    /// "address:port" of the endpoint tried
    pub endpoint: String,
    /// Wall time of the attempt
    pub latency: Duration,
    /// Failure class, "ok" on success
    pub class: String,
}

/// Per-request scratch state
pub struct RequestInfo {
    /// Arrival time, monotonic
    pub received_at: Instant,
    /// Arrival time, wall clock (for the access log)
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Client connection peer
    pub peer_addr: SocketAddr,
    /// The client connection is TLS
    pub client_tls: bool,
    /// PEM of the verified client certificate, on mTLS connections
    pub peer_cert_pem: Option<String>,
    /// Per-request id; set by the request-id handler
    pub request_id: String,
    /// Trace id after normalisation
    pub trace_id: Option<String>,
    /// Span id after normalisation
    pub span_id: Option<String>,
    /// Host the request resolved to (port stripped, lowercased)
    pub host: String,
    /// Raw request-target exactly as received, preserved byte-for-byte
    pub raw_path_and_query: String,
    /// Pool the request routed to; set by the lookup handler
    pub pool: Option<Arc<Pool>>,
    /// Instance restriction parsed from `X-CF-App-Instance`
    pub app_instance: Option<AppInstance>,
    /// Route service URL when the request must detour outbound
    pub route_service_url: Option<String>,
    /// The request arrived back from a route service with a valid signature
    pub route_service_return: bool,
    /// Endpoint selected by the most recent attempt
    pub endpoint: Option<Arc<Endpoint>>,
    /// Endpoints already failed within this request
    pub failed_endpoints: Vec<TransportKey>,
    /// Attempt log for metrics and the access log
    pub attempts: Vec<AttemptRecord>,
    /// Set immediately before the first backend attempt
    pub app_request_started_at: Option<Instant>,
    /// Set after the backend exchange completes
    pub app_request_finished_at: Option<Instant>,
    /// Snapshot of headers sent to the backend
    pub backend_req_headers: Option<http::HeaderMap>,
    /// The request is a platform health probe; skip access logging
    pub is_health_probe: bool,
    /// Answer with `Connection: close`
    pub close_connection: bool,
    /// Flipped when the client upload stream errors mid-request
    pub client_body_aborted: Arc<AtomicBool>,
}

impl RequestInfo {
    /// Capture entry state from the incoming request
    pub fn new(peer_addr: SocketAddr, client_tls: bool, parts: &http::request::Parts) -> Self {
        let raw_path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let host = parts
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.host())
            .unwrap_or_default()
            .to_string();

        Self {
            received_at: Instant::now(),
            started_at: chrono::Utc::now(),
            peer_addr,
            client_tls,
            peer_cert_pem: None,
            request_id: String::new(),
            trace_id: None,
            span_id: None,
            host,
            raw_path_and_query,
            pool: None,
            app_instance: None,
            route_service_url: None,
            route_service_return: false,
            endpoint: None,
            failed_endpoints: Vec::new(),
            attempts: Vec::new(),
            app_request_started_at: None,
            app_request_finished_at: None,
            backend_req_headers: None,
            is_health_probe: false,
            close_connection: false,
            client_body_aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The resolved pool; absent only on pipeline misuse
    pub fn pool(&self) -> Result<&Arc<Pool>> {
        self.pool
            .as_ref()
            .ok_or(RouterError::RequestInfoMissing("route pool"))
    }

    /// Whether the request is an outbound route-service detour
    pub fn is_route_service_detour(&self) -> bool {
        self.route_service_url.is_some() && !self.route_service_return
    }

    /// Record one attempt outcome
    pub fn record_attempt(&mut self, endpoint: &str, latency: Duration, class: &str) {
        let attempt = self.attempts.len() as u32 + 1;
        self.attempts.push(AttemptRecord {
            attempt,
            endpoint: endpoint.to_string(),
            latency,
            class: class.to_string(),
        });
    }
}
