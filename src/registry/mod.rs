//! Route registry — maps routable host+path identities to endpoint pools
//!
//! Route discovery owns mutation; the request path only performs lookups.
//! Lookup strips any port from the Host header, lowercases it, and walks
//! path prefixes longest-first. A `*.domain` wildcard pool matches any
//! single-level subdomain when no exact host matches.

pub mod endpoint;
pub mod pool;

pub use endpoint::{BackendProtocol, Endpoint, TransportKey};
pub use pool::{BalanceStrategy, Pool};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Hook invoked when an endpoint leaves the registry, so the transport
/// cache can drop its connections
pub type EndpointRemovalHook = Box<dyn Fn(&TransportKey) + Send + Sync>;

struct RouteEntry {
    /// Path prefix including the leading slash, "/" for the bare host
    path: String,
    pool: Arc<Pool>,
}

/// Concurrent host+path route table
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, Vec<RouteEntry>>>,
    strategy: BalanceStrategy,
    failed_ttl: Duration,
    removal_hooks: RwLock<Vec<EndpointRemovalHook>>,
}

impl RouteRegistry {
    /// Create an empty registry
    pub fn new(strategy: BalanceStrategy, failed_ttl: Duration) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            strategy,
            failed_ttl,
            removal_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a hook fired for every endpoint removed from any pool
    pub fn on_endpoint_removed(&self, hook: EndpointRemovalHook) {
        self.removal_hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Fetch or create the pool for a routable identity
    pub fn pool_for(&self, host: &str, path: &str) -> Arc<Pool> {
        let host = normalize_host(host);
        let path = normalize_path(path);
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let entries = routes.entry(host.clone()).or_default();
        if let Some(entry) = entries.iter().find(|e| e.path == path) {
            return entry.pool.clone();
        }
        let pool = Arc::new(Pool::new(
            host,
            path.clone(),
            self.strategy,
            self.failed_ttl,
        ));
        entries.push(RouteEntry {
            path,
            pool: pool.clone(),
        });
        // longest prefix first so lookup can take the first match
        entries.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        pool
    }

    /// Register an endpoint under a routable identity
    pub fn register(&self, host: &str, path: &str, endpoint: Endpoint) -> Arc<Pool> {
        let pool = self.pool_for(host, path);
        pool.register(endpoint);
        pool
    }

    /// Remove an endpoint from one routable identity, firing removal hooks
    pub fn unregister(&self, host: &str, path: &str, key: &TransportKey) {
        let host = normalize_host(host);
        let path = normalize_path(path);
        let removed = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes
                .get(&host)
                .and_then(|entries| entries.iter().find(|e| e.path == path))
                .map(|entry| entry.pool.unregister(key))
                .unwrap_or(false)
        };
        if removed {
            for hook in self
                .removal_hooks
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
            {
                hook(key);
            }
        }
    }

    /// Longest-prefix lookup. The host may carry a port; matching is
    /// case-insensitive on the host and prefix-based on the path.
    pub fn lookup(&self, host: &str, path: &str) -> Option<Arc<Pool>> {
        let host = normalize_host(host);
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());

        if let Some(pool) = Self::match_entries(routes.get(host.as_str()), path) {
            return Some(pool);
        }

        // wildcard fallback: a.b.example.com -> *.b.example.com
        if let Some((_, rest)) = host.split_once('.') {
            let wildcard = format!("*.{}", rest);
            if let Some(pool) = Self::match_entries(routes.get(wildcard.as_str()), path) {
                return Some(pool);
            }
        }
        None
    }

    fn match_entries(entries: Option<&Vec<RouteEntry>>, path: &str) -> Option<Arc<Pool>> {
        let entries = entries?;
        entries
            .iter()
            .find(|e| path_matches(path, &e.path))
            .map(|e| e.pool.clone())
    }

    /// Number of distinct routable identities
    pub fn route_count(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|v| v.len())
            .sum()
    }
}

/// Strip any `:port` suffix and lowercase
fn normalize_host(host: &str) -> String {
    let bare = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    bare.to_ascii_lowercase()
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Prefix match on whole path segments: "/api" matches "/api" and
/// "/api/v1" but not "/apiary"
fn path_matches(request_path: &str, route_path: &str) -> bool {
    if route_path == "/" {
        return true;
    }
    match request_path.strip_prefix(route_path) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> RouteRegistry {
        RouteRegistry::new(BalanceStrategy::RoundRobin, Duration::from_secs(30))
    }

    #[test]
    fn test_lookup_miss() {
        let r = registry();
        assert!(r.lookup("app.example.com", "/").is_none());
    }

    #[test]
    fn test_register_and_lookup() {
        let r = registry();
        r.register("app.example.com", "/", Endpoint::new("10.0.0.1", 8080));
        let pool = r.lookup("app.example.com", "/anything").unwrap();
        assert_eq!(pool.host(), "app.example.com");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_lookup_strips_port_and_case() {
        let r = registry();
        r.register("app.example.com", "/", Endpoint::new("10.0.0.1", 8080));
        assert!(r.lookup("App.Example.COM:8443", "/").is_some());
        assert!(r.lookup("app.example.com:80", "/x").is_some());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let r = registry();
        r.register("app.example.com", "/", Endpoint::new("10.0.0.1", 8080));
        r.register("app.example.com", "/api", Endpoint::new("10.0.0.2", 8080));
        r.register(
            "app.example.com",
            "/api/v2",
            Endpoint::new("10.0.0.3", 8080),
        );

        let root = r.lookup("app.example.com", "/index.html").unwrap();
        assert_eq!(root.context_path(), "/");

        let api = r.lookup("app.example.com", "/api/users").unwrap();
        assert_eq!(api.context_path(), "/api");

        let v2 = r.lookup("app.example.com", "/api/v2/users").unwrap();
        assert_eq!(v2.context_path(), "/api/v2");
    }

    #[test]
    fn test_prefix_respects_segment_boundaries() {
        let r = registry();
        r.register("app.example.com", "/api", Endpoint::new("10.0.0.1", 8080));
        assert!(r.lookup("app.example.com", "/apiary").is_none());
        assert!(r.lookup("app.example.com", "/api").is_some());
        assert!(r.lookup("app.example.com", "/api/").is_some());
    }

    #[test]
    fn test_wildcard_host() {
        let r = registry();
        r.register("*.apps.example.com", "/", Endpoint::new("10.0.0.1", 8080));
        assert!(r.lookup("foo.apps.example.com", "/").is_some());
        assert!(r.lookup("bar.apps.example.com", "/x").is_some());
        assert!(r.lookup("apps.example.com", "/").is_none());
    }

    #[test]
    fn test_exact_host_beats_wildcard() {
        let r = registry();
        r.register("*.apps.example.com", "/", Endpoint::new("10.0.0.1", 8080));
        r.register(
            "special.apps.example.com",
            "/",
            Endpoint::new("10.0.0.2", 8080),
        );
        let pool = r.lookup("special.apps.example.com", "/").unwrap();
        assert_eq!(pool.endpoints()[0].address, "10.0.0.2");
    }

    #[test]
    fn test_pool_for_is_idempotent() {
        let r = registry();
        let a = r.pool_for("app.example.com", "/");
        let b = r.pool_for("app.example.com", "/");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(r.route_count(), 1);
    }

    #[test]
    fn test_unregister_fires_removal_hook() {
        let r = registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        r.on_endpoint_removed(Box::new(move |_key| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let ep = Endpoint::new("10.0.0.1", 8080);
        let key = ep.transport_key();
        r.register("app.example.com", "/", ep);

        r.unregister("app.example.com", "/", &key);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // absent endpoint: no hook
        r.unregister("app.example.com", "/", &key);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_pool_still_found() {
        let r = registry();
        let ep = Endpoint::new("10.0.0.1", 8080);
        let key = ep.transport_key();
        r.register("app.example.com", "/", ep);
        r.unregister("app.example.com", "/", &key);

        let pool = r.lookup("app.example.com", "/").unwrap();
        assert!(pool.is_empty());
    }
}
