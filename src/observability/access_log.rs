//! Structured access log — one JSON entry per proxied request
//!
//! Entries are emitted on the `access_log` tracing target after the last
//! response byte is flushed to the client, never before.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// One backend attempt, appended when attempt details are enabled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptDetail {
    /// 1-based attempt number
    pub attempt: u32,
    /// "address:port" of the endpoint tried
    pub endpoint: String,
    /// Time spent on this attempt
    pub latency_ms: u64,
    /// Failure class, or "ok" for the successful attempt
    pub class: String,
}

/// A single access log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    /// RFC 3339 timestamp of request arrival
    pub timestamp: String,
    /// Peer address of the client connection
    pub client_ip: String,
    /// HTTP method
    pub method: String,
    /// Raw request path and query
    pub path: String,
    /// Host header value
    pub host: String,
    /// Final response status
    pub status: u16,
    /// Bytes of response body written to the client
    pub response_bytes: u64,
    /// Total request duration in milliseconds
    pub duration_ms: u64,
    /// Per-request id, also returned as X-Vcap-Request-Id
    pub request_id: String,
    /// Zipkin/W3C trace id, when tracing is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Application the request routed to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Endpoint that produced the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Instance index of that endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_index: Option<u32>,
    /// Number of backend attempts made
    pub attempts: u32,
    /// Per-attempt details when enabled in config
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attempt_details: Vec<AttemptDetail>,
    /// Whether the request detoured through a route service
    pub route_service: bool,
    /// X-Forwarded-For as sent to the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_forwarded_for: Option<String>,
    /// Client User-Agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Access log sink
pub struct AccessLogger {
    total_entries: AtomicU64,
    include_attempts: bool,
}

impl AccessLogger {
    /// Create a logger; `include_attempts` keeps per-attempt detail
    pub fn new(include_attempts: bool) -> Self {
        Self {
            total_entries: AtomicU64::new(0),
            include_attempts,
        }
    }

    /// Whether attempt details should be collected at all
    pub fn include_attempts(&self) -> bool {
        self.include_attempts
    }

    /// Emit one entry
    pub fn emit(&self, mut entry: AccessLogEntry) {
        if !self.include_attempts {
            entry.attempt_details.clear();
        }
        self.total_entries.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "access_log",
            client_ip = entry.client_ip,
            method = entry.method,
            path = entry.path,
            host = entry.host,
            status = entry.status,
            duration_ms = entry.duration_ms,
            response_bytes = entry.response_bytes,
            endpoint = entry.endpoint.as_deref().unwrap_or("-"),
            attempts = entry.attempts,
            "{}",
            serde_json::to_string(&entry).unwrap_or_default()
        );
    }

    /// Number of entries emitted so far
    pub fn total_entries(&self) -> u64 {
        self.total_entries.load(Ordering::Relaxed)
    }
}
