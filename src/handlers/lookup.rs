//! Lookup handler — resolves the request to an endpoint pool

use crate::error::Result;
use crate::handlers::{error_response, AppInstance, Handler, ProxyBody, RequestInfo};
use crate::headers;
use crate::observability::ProxyReporter;
use crate::registry::RouteRegistry;
use async_trait::async_trait;
use http::{Response, StatusCode};
use std::sync::Arc;

/// Matches host+path against the route registry and attaches the pool to
/// the request. Also consumes the `X-CF-App-Instance` restriction so the
/// round tripper can honor it.
pub struct LookupHandler {
    registry: Arc<RouteRegistry>,
    reporter: Arc<ProxyReporter>,
    empty_pool_404: bool,
}

impl LookupHandler {
    pub fn new(
        registry: Arc<RouteRegistry>,
        reporter: Arc<ProxyReporter>,
        empty_pool_404: bool,
    ) -> Self {
        Self {
            registry,
            reporter,
            empty_pool_404,
        }
    }

    fn not_found(&self, host: &str) -> Response<ProxyBody> {
        self.reporter.capture("unknown_route");
        error_response(
            StatusCode::NOT_FOUND,
            "unknown_route",
            &format!("404 Not Found: Requested route ('{}') does not exist.", host),
        )
    }
}

#[async_trait]
impl Handler for LookupHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        // instance restriction is parsed before routing so a malformed
        // header fails fast
        if let Some(raw) = parts.headers.get(headers::CF_APP_INSTANCE) {
            let parsed = raw.to_str().ok().and_then(AppInstance::parse);
            match parsed {
                Some(instance) => info.app_instance = Some(instance),
                None => {
                    self.reporter.capture("invalid_cf_app_instance_header");
                    return Ok(Some(error_response(
                        StatusCode::BAD_REQUEST,
                        "invalid_cf_app_instance_header",
                        "400 Bad Request: Invalid X-CF-App-Instance header",
                    )));
                }
            }
        }

        let path = parts.uri.path();
        let pool = match self.registry.lookup(&info.host, path) {
            Some(pool) => pool,
            None => return Ok(Some(self.not_found(&info.host))),
        };

        if pool.is_empty() || pool.is_overloaded() {
            self.reporter.capture("empty_pool");
            if self.empty_pool_404 && !pool.is_overloaded() {
                return Ok(Some(self.not_found(&info.host)));
            }
            return Ok(Some(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "empty_pool",
                "503 Service Unavailable: no endpoints registered for the route",
            )));
        }

        info.host = pool.host().to_string();
        info.pool = Some(pool);
        Ok(None)
    }

    fn name(&self) -> &str {
        "lookup"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::request;
    use crate::registry::{BalanceStrategy, Endpoint};
    use std::time::Duration;

    fn setup(empty_pool_404: bool) -> (Arc<RouteRegistry>, Arc<ProxyReporter>, LookupHandler) {
        let registry = Arc::new(RouteRegistry::new(
            BalanceStrategy::RoundRobin,
            Duration::from_secs(30),
        ));
        let reporter = Arc::new(ProxyReporter::new());
        let handler = LookupHandler::new(registry.clone(), reporter.clone(), empty_pool_404);
        (registry, reporter, handler)
    }

    fn with_host(host: &str) -> (http::request::Parts, RequestInfo) {
        let (mut parts, mut info) = request("GET", "/x");
        parts
            .headers
            .insert(http::header::HOST, host.parse().unwrap());
        info.host = host.to_string();
        (parts, info)
    }

    #[tokio::test]
    async fn test_miss_is_404() {
        let (_registry, reporter, handler) = setup(false);
        let (mut parts, mut info) = with_host("nowhere.example.com");
        let response = handler.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(headers::CF_ROUTER_ERROR).unwrap(),
            "unknown_route"
        );
        assert_eq!(reporter.counter("unknown_route"), 1);
    }

    #[tokio::test]
    async fn test_hit_attaches_pool() {
        let (registry, _reporter, handler) = setup(false);
        registry.register("app.example.com", "/", Endpoint::new("10.0.0.1", 8080));
        let (mut parts, mut info) = with_host("app.example.com:8081");
        let result = handler.handle(&mut parts, &mut info).await.unwrap();
        assert!(result.is_none());
        assert!(info.pool.is_some());
        // host normalised to the pool identity
        assert_eq!(info.host, "app.example.com");
    }

    #[tokio::test]
    async fn test_empty_pool_503() {
        let (registry, reporter, handler) = setup(false);
        let ep = Endpoint::new("10.0.0.1", 8080);
        let key = ep.transport_key();
        registry.register("app.example.com", "/", ep);
        registry.unregister("app.example.com", "/", &key);

        let (mut parts, mut info) = with_host("app.example.com");
        let response = handler.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(headers::CF_ROUTER_ERROR).unwrap(),
            "empty_pool"
        );
        assert_eq!(reporter.counter("empty_pool"), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_404_policy() {
        let (registry, _reporter, handler) = setup(true);
        let ep = Endpoint::new("10.0.0.1", 8080);
        let key = ep.transport_key();
        registry.register("app.example.com", "/", ep);
        registry.unregister("app.example.com", "/", &key);

        let (mut parts, mut info) = with_host("app.example.com");
        let response = handler.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_overloaded_pool_503_even_with_404_policy() {
        let (registry, _reporter, handler) = setup(true);
        let pool = registry.register("app.example.com", "/", Endpoint::new("10.0.0.1", 8080));
        pool.set_overloaded(true);

        let (mut parts, mut info) = with_host("app.example.com");
        let response = handler.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_valid_app_instance_header_parsed() {
        let (registry, _reporter, handler) = setup(false);
        registry.register("app.example.com", "/", Endpoint::new("10.0.0.1", 8080));
        let (mut parts, mut info) = with_host("app.example.com");
        parts
            .headers
            .insert(headers::CF_APP_INSTANCE, "app-guid:2".parse().unwrap());
        let result = handler.handle(&mut parts, &mut info).await.unwrap();
        assert!(result.is_none());
        let instance = info.app_instance.unwrap();
        assert_eq!(instance.app_id, "app-guid");
        assert_eq!(instance.index, 2);
    }

    #[tokio::test]
    async fn test_malformed_app_instance_header_400() {
        let (registry, reporter, handler) = setup(false);
        registry.register("app.example.com", "/", Endpoint::new("10.0.0.1", 8080));
        let (mut parts, mut info) = with_host("app.example.com");
        parts
            .headers
            .insert(headers::CF_APP_INSTANCE, "garbage".parse().unwrap());
        let response = handler.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(headers::CF_ROUTER_ERROR).unwrap(),
            "invalid_cf_app_instance_header"
        );
        assert_eq!(reporter.counter("invalid_cf_app_instance_header"), 1);
    }
}
