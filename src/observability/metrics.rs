//! Proxy reporter — counters for routing outcomes and backend failures
//!
//! In-process metrics without external dependencies; rendered as JSON
//! snapshots or Prometheus text format for the admin surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Point-in-time view of all counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total requests entering the pipeline
    pub total_requests: u64,
    /// Responses by status class (2xx, 3xx, 4xx, 5xx)
    pub status_classes: HashMap<String, u64>,
    /// Named failure counters (backend_conn_failed, bad_gateway, ...)
    pub counters: HashMap<String, u64>,
    /// Sum of routing response latency in milliseconds
    pub latency_ms_sum: u64,
    /// Number of latency samples
    pub latency_count: u64,
}

/// Counter collector threaded through the pipeline
pub struct ProxyReporter {
    total_requests: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    latency_ms_sum: AtomicU64,
    latency_count: AtomicU64,
    counters: RwLock<HashMap<String, u64>>,
}

impl ProxyReporter {
    /// Create a new reporter with all counters at zero
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            status_2xx: AtomicU64::new(0),
            status_3xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
            latency_ms_sum: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Count a request entering the pipeline
    pub fn capture_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a routing response by status class
    pub fn capture_routing_response(&self, status: u16) {
        match status / 100 {
            2 => self.status_2xx.fetch_add(1, Ordering::Relaxed),
            3 => self.status_3xx.fetch_add(1, Ordering::Relaxed),
            4 => self.status_4xx.fetch_add(1, Ordering::Relaxed),
            5 => self.status_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    /// Record end-to-end routing latency
    pub fn capture_routing_latency(&self, elapsed_ms: u64) {
        self.latency_ms_sum.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump a named failure counter
    pub fn capture(&self, counter: &str) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        *counters.entry(counter.to_string()).or_insert(0) += 1;
    }

    /// Count a request that arrived without Content-Length
    pub fn capture_missing_content_length(&self) {
        self.capture("missing_content_length");
    }

    /// Count a query string using semicolon separators
    pub fn capture_semicolon_query(&self) {
        self.capture("semicolon_query_params");
    }

    /// Read a named counter
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Total requests seen
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut status_classes = HashMap::new();
        status_classes.insert("2xx".to_string(), self.status_2xx.load(Ordering::Relaxed));
        status_classes.insert("3xx".to_string(), self.status_3xx.load(Ordering::Relaxed));
        status_classes.insert("4xx".to_string(), self.status_4xx.load(Ordering::Relaxed));
        status_classes.insert("5xx".to_string(), self.status_5xx.load(Ordering::Relaxed));

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            status_classes,
            counters: self
                .counters
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            latency_ms_sum: self.latency_ms_sum.load(Ordering::Relaxed),
            latency_count: self.latency_count.load(Ordering::Relaxed),
        }
    }

    /// Render counters in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP router_requests_total Total number of requests\n");
        output.push_str("# TYPE router_requests_total counter\n");
        output.push_str(&format!("router_requests_total {}\n", snap.total_requests));

        output.push_str("# HELP router_responses_total Responses by status class\n");
        output.push_str("# TYPE router_responses_total counter\n");
        for class in ["2xx", "3xx", "4xx", "5xx"] {
            let count = snap.status_classes.get(class).unwrap_or(&0);
            output.push_str(&format!(
                "router_responses_total{{status_class=\"{}\"}} {}\n",
                class, count
            ));
        }

        if !snap.counters.is_empty() {
            output.push_str("# HELP router_events_total Named routing events\n");
            output.push_str("# TYPE router_events_total counter\n");
            let mut names: Vec<&String> = snap.counters.keys().collect();
            names.sort();
            for name in names {
                output.push_str(&format!(
                    "router_events_total{{event=\"{}\"}} {}\n",
                    name, snap.counters[name]
                ));
            }
        }

        output.push_str("# HELP router_latency_ms_sum Total routing latency\n");
        output.push_str("# TYPE router_latency_ms_sum counter\n");
        output.push_str(&format!("router_latency_ms_sum {}\n", snap.latency_ms_sum));
        output.push_str(&format!("router_latency_ms_count {}\n", snap.latency_count));

        output
    }
}

impl Default for ProxyReporter {
    fn default() -> Self {
        Self::new()
    }
}
