//! Endpoint pool — the live backends for one routable host+path
//!
//! Owned by the route registry and mutated by route discovery; the request
//! path only selects endpoints, marks them failed for a bounded time, and
//! feeds back response times for least-response-time balancing.

use crate::registry::endpoint::{Endpoint, TransportKey};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Endpoint selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceStrategy {
    RoundRobin,
    LeastResponseTime,
}

#[derive(Debug)]
struct PoolEntry {
    endpoint: Arc<Endpoint>,
    failed_at: Option<Instant>,
    /// Exponentially weighted response time in microseconds; 0 = no sample
    response_time_us: u64,
}

impl PoolEntry {
    fn in_quarantine(&self, ttl: Duration, now: Instant) -> bool {
        match self.failed_at {
            Some(at) => now.duration_since(at) < ttl,
            None => false,
        }
    }
}

/// Live endpoints for a single routable identity
#[derive(Debug)]
pub struct Pool {
    host: String,
    context_path: String,
    route_service_url: RwLock<Option<String>>,
    entries: RwLock<Vec<PoolEntry>>,
    next: AtomicUsize,
    strategy: BalanceStrategy,
    failed_ttl: Duration,
    overloaded: AtomicBool,
}

impl Pool {
    /// Create an empty pool for a host and context path
    pub fn new(
        host: impl Into<String>,
        context_path: impl Into<String>,
        strategy: BalanceStrategy,
        failed_ttl: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            context_path: context_path.into(),
            route_service_url: RwLock::new(None),
            entries: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            strategy,
            failed_ttl,
            overloaded: AtomicBool::new(false),
        }
    }

    /// The host this pool serves
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The path prefix this pool serves
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    /// Bind (or clear) the route service fronting this pool
    pub fn set_route_service_url(&self, url: Option<String>) {
        *self.route_service_url.write().unwrap_or_else(|e| e.into_inner()) = url;
    }

    /// Route service URL, when one fronts this pool
    pub fn route_service_url(&self) -> Option<String> {
        self.route_service_url
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether the pool currently refuses work (suggests 503)
    pub fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Relaxed)
    }

    /// Flip the overload flag
    pub fn set_overloaded(&self, overloaded: bool) {
        self.overloaded.store(overloaded, Ordering::Relaxed);
    }

    /// Add an endpoint, replacing any existing one with the same transport
    /// key. Replacement clears quarantine.
    pub fn register(&self, endpoint: Endpoint) {
        let key = endpoint.transport_key();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = PoolEntry {
            endpoint: Arc::new(endpoint),
            failed_at: None,
            response_time_us: 0,
        };
        match entries
            .iter_mut()
            .find(|e| e.endpoint.transport_key() == key)
        {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    /// Remove an endpoint by transport key; returns whether it was present
    pub fn unregister(&self, key: &TransportKey) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.endpoint.transport_key() != *key);
        entries.len() != before
    }

    /// True when no endpoints are registered at all
    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Number of registered endpoints
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Pick the next endpoint for an attempt.
    ///
    /// `sticky` is a private instance id from an affinity cookie; it wins
    /// when that endpoint is registered, not quarantined and not excluded.
    /// `exclude` holds transport keys already failed within this request.
    pub fn next_endpoint(
        &self,
        sticky: Option<&str>,
        exclude: &[TransportKey],
    ) -> Option<Arc<Endpoint>> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        let eligible: Vec<&PoolEntry> = entries
            .iter()
            .filter(|e| !e.in_quarantine(self.failed_ttl, now))
            .filter(|e| !exclude.contains(&e.endpoint.transport_key()))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        if let Some(id) = sticky {
            if let Some(entry) = eligible
                .iter()
                .find(|e| e.endpoint.private_instance_id == id)
            {
                return Some(entry.endpoint.clone());
            }
        }

        match self.strategy {
            BalanceStrategy::RoundRobin => {
                let idx = self.next.fetch_add(1, Ordering::Relaxed) % eligible.len();
                Some(eligible[idx].endpoint.clone())
            }
            BalanceStrategy::LeastResponseTime => eligible
                .iter()
                .min_by_key(|e| e.response_time_us)
                .map(|e| e.endpoint.clone()),
        }
    }

    /// Pick the endpoint for a specific application instance, if present
    /// and not excluded
    pub fn endpoint_for_instance(
        &self,
        app_id: &str,
        index: u32,
        exclude: &[TransportKey],
    ) -> Option<Arc<Endpoint>> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| !e.in_quarantine(self.failed_ttl, now))
            .filter(|e| !exclude.contains(&e.endpoint.transport_key()))
            .find(|e| e.endpoint.app_id == app_id && e.endpoint.private_instance_index == index)
            .map(|e| e.endpoint.clone())
    }

    /// Quarantine an endpoint for the configured TTL so concurrent
    /// requests also avoid it
    pub fn mark_failed(&self, key: &TransportKey) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.endpoint.transport_key() == *key)
        {
            entry.failed_at = Some(Instant::now());
        }
    }

    /// Clear quarantine after a successful round trip
    pub fn mark_updated(&self, key: &TransportKey) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.endpoint.transport_key() == *key)
        {
            entry.failed_at = None;
        }
    }

    /// Feed a response time sample into the balancer
    pub fn record_response_time(&self, key: &TransportKey, elapsed: Duration) {
        let sample = elapsed.as_micros() as u64;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.endpoint.transport_key() == *key)
        {
            entry.response_time_us = if entry.response_time_us == 0 {
                sample
            } else {
                // 3:1 weighting toward history
                (entry.response_time_us * 3 + sample) / 4
            };
        }
    }

    /// Snapshot of all registered endpoints
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.endpoint.clone())
            .collect()
    }
}
