//! Route service detour — signed redirect-and-return protocol
//!
//! A pool may be fronted by an external route service. Requests for such
//! a pool are sealed with a signature and sent to the route service; when
//! the service forwards them back with a fresh signature they proceed to
//! a backend like any other request.

pub mod signature;

pub use signature::{SignatureKey, SignaturePayload};

use crate::config::RouteServiceConfig;
use crate::error::Result;
use crate::handlers::{error_response, Handler, ProxyBody, RequestInfo};
use crate::headers;
use crate::observability::ProxyReporter;
use async_trait::async_trait;
use http::{Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// Why a carried signature was rejected
#[derive(Debug, PartialEq, Eq)]
enum SignatureError {
    Invalid,
    Expired,
}

/// Per-request detour state machine (inbound / returning / outbound /
/// rejected)
pub struct RouteServiceHandler {
    key: Option<SignatureKey>,
    timeout: Duration,
    recommend_https: bool,
    reporter: Arc<ProxyReporter>,
}

impl RouteServiceHandler {
    pub fn new(config: &RouteServiceConfig, reporter: Arc<ProxyReporter>) -> Result<Self> {
        let key = if config.signing_key.is_empty() {
            None
        } else {
            Some(SignatureKey::new(&config.signing_key)?)
        };
        Ok(Self {
            key,
            timeout: config.timeout(),
            recommend_https: config.recommend_https,
            reporter,
        })
    }

    /// Whether the request carries a valid, fresh route service signature.
    /// Used by earlier handlers to relax sanitization for returning
    /// traffic.
    pub fn is_route_service_traffic(&self, parts: &http::request::Parts) -> bool {
        let (Some(sig), Some(meta)) = (
            parts.headers.get(headers::CF_PROXY_SIGNATURE),
            parts.headers.get(headers::CF_PROXY_METADATA),
        ) else {
            return false;
        };
        let (Ok(sig), Ok(meta)) = (sig.to_str(), meta.to_str()) else {
            return false;
        };
        self.validate(sig, meta).is_ok()
    }

    fn validate(&self, sig: &str, meta: &str) -> std::result::Result<SignaturePayload, SignatureError> {
        let key = self.key.as_ref().ok_or(SignatureError::Invalid)?;
        let payload = key.decode(sig, meta).map_err(|_| SignatureError::Invalid)?;
        let age = chrono::Utc::now().timestamp() - payload.signed_time;
        if age > self.timeout.as_secs() as i64 {
            return Err(SignatureError::Expired);
        }
        Ok(payload)
    }

    fn forwarded_url(&self, info: &RequestInfo) -> String {
        let scheme = if self.recommend_https || info.client_tls {
            "https"
        } else {
            "http"
        };
        format!("{}://{}{}", scheme, info.host, info.raw_path_and_query)
    }
}

#[async_trait]
impl Handler for RouteServiceHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        let pool = info.pool()?.clone();
        let Some(route_service_url) = pool.route_service_url() else {
            return Ok(None);
        };

        if self.key.is_none() {
            self.reporter.capture("route_service_unsupported");
            return Ok(Some(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "route_service_unsupported",
                "503 Service Unavailable: route services are not enabled",
            )));
        }

        let carried = match (
            parts.headers.get(headers::CF_PROXY_SIGNATURE),
            parts.headers.get(headers::CF_PROXY_METADATA),
        ) {
            (Some(sig), Some(meta)) => match (sig.to_str(), meta.to_str()) {
                (Ok(sig), Ok(meta)) => Some((sig.to_string(), meta.to_string())),
                _ => {
                    return Ok(Some(self.rejected(SignatureError::Invalid)));
                }
            },
            _ => None,
        };

        if let Some((sig, meta)) = carried {
            // returning leg: the signature proves the route service round
            // trip already happened
            return match self.validate(&sig, &meta) {
                Ok(_payload) => {
                    parts.headers.remove(headers::CF_PROXY_SIGNATURE);
                    parts.headers.remove(headers::CF_PROXY_METADATA);
                    parts.headers.remove(headers::CF_FORWARDED_URL);
                    info.route_service_return = true;
                    Ok(None)
                }
                Err(reason) => Ok(Some(self.rejected(reason))),
            };
        }

        // outbound leg: seal the current URL and detour
        let key = self.key.as_ref().ok_or_else(|| {
            crate::error::RouterError::Other("signature key vanished".to_string())
        })?;
        let forwarded_url = self.forwarded_url(info);
        let payload = SignaturePayload {
            forwarded_url: forwarded_url.clone(),
            signed_time: chrono::Utc::now().timestamp(),
        };
        let (sig, meta) = key.encode(&payload)?;

        for (name, value) in [
            (headers::CF_PROXY_SIGNATURE, sig),
            (headers::CF_PROXY_METADATA, meta),
            (headers::CF_FORWARDED_URL, forwarded_url),
        ] {
            if let Ok(v) = value.parse() {
                parts.headers.insert(name, v);
            }
        }
        info.route_service_url = Some(route_service_url);
        self.reporter.capture("route_service_outbound");
        Ok(None)
    }

    fn name(&self) -> &str {
        "route-service"
    }
}

impl RouteServiceHandler {
    fn rejected(&self, reason: SignatureError) -> Response<ProxyBody> {
        self.reporter.capture("route_service_invalid_signature");
        let body = match reason {
            SignatureError::Expired => "400 Bad Request: route service signature expired",
            SignatureError::Invalid => "400 Bad Request: failed to validate route service signature",
        };
        error_response(StatusCode::BAD_REQUEST, "route_service_invalid_signature", body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{request, tls_request};
    use crate::registry::{BalanceStrategy, Endpoint, Pool};

    fn handler(signing_key: &str, timeout_secs: u64) -> RouteServiceHandler {
        let config = RouteServiceConfig {
            signing_key: signing_key.to_string(),
            timeout_secs,
            recommend_https: false,
        };
        RouteServiceHandler::new(&config, Arc::new(ProxyReporter::new())).unwrap()
    }

    fn pool_with_rs(url: Option<&str>) -> Arc<Pool> {
        let pool = Arc::new(Pool::new(
            "app.example.com",
            "/",
            BalanceStrategy::RoundRobin,
            Duration::from_secs(30),
        ));
        pool.register(Endpoint::new("10.0.0.1", 8080));
        pool.set_route_service_url(url.map(str::to_string));
        pool
    }

    fn prepared(url: Option<&str>) -> (http::request::Parts, RequestInfo) {
        let (parts, mut info) = request("GET", "/x?q=1");
        info.host = "app.example.com".to_string();
        info.pool = Some(pool_with_rs(url));
        (parts, info)
    }

    #[tokio::test]
    async fn test_no_route_service_passes_through() {
        let h = handler("secret", 60);
        let (mut parts, mut info) = prepared(None);
        let result = h.handle(&mut parts, &mut info).await.unwrap();
        assert!(result.is_none());
        assert!(info.route_service_url.is_none());
        assert!(parts.headers.get(headers::CF_PROXY_SIGNATURE).is_none());
    }

    #[tokio::test]
    async fn test_outbound_detour_seals_headers() {
        let h = handler("secret", 60);
        let (mut parts, mut info) = prepared(Some("https://rs.example.com/filter"));
        let result = h.handle(&mut parts, &mut info).await.unwrap();
        assert!(result.is_none());
        assert_eq!(
            info.route_service_url.as_deref(),
            Some("https://rs.example.com/filter")
        );
        assert!(info.is_route_service_detour());
        assert!(parts.headers.get(headers::CF_PROXY_SIGNATURE).is_some());
        assert!(parts.headers.get(headers::CF_PROXY_METADATA).is_some());
        assert_eq!(
            parts.headers.get(headers::CF_FORWARDED_URL).unwrap(),
            "http://app.example.com/x?q=1"
        );
    }

    #[tokio::test]
    async fn test_outbound_forwarded_url_https_on_tls() {
        let h = handler("secret", 60);
        let (parts_tls, mut info) = tls_request("GET", "/x?q=1");
        info.host = "app.example.com".to_string();
        info.pool = Some(pool_with_rs(Some("https://rs.example.com")));
        let mut parts = parts_tls;
        h.handle(&mut parts, &mut info).await.unwrap();
        assert!(parts
            .headers
            .get(headers::CF_FORWARDED_URL)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("https://"));
    }

    #[tokio::test]
    async fn test_returning_leg_strips_and_marks() {
        let h = handler("secret", 60);

        // outbound leg seals the headers a route service would echo back
        let (mut parts, mut outbound_info) = prepared(Some("https://rs.example.com"));
        h.handle(&mut parts, &mut outbound_info).await.unwrap();

        // the returning request is a fresh exchange carrying those headers
        let (_, mut return_info) = prepared(Some("https://rs.example.com"));
        let result = h.handle(&mut parts, &mut return_info).await.unwrap();
        assert!(result.is_none());
        assert!(return_info.route_service_return);
        assert!(!return_info.is_route_service_detour());
        assert!(parts.headers.get(headers::CF_PROXY_SIGNATURE).is_none());
        assert!(parts.headers.get(headers::CF_PROXY_METADATA).is_none());
        assert!(parts.headers.get(headers::CF_FORWARDED_URL).is_none());
    }

    #[tokio::test]
    async fn test_forged_signature_rejected() {
        let h = handler("secret", 60);
        let (mut parts, mut info) = prepared(Some("https://rs.example.com"));
        parts
            .headers
            .insert(headers::CF_PROXY_SIGNATURE, "Zm9yZ2Vk".parse().unwrap());
        parts
            .headers
            .insert(headers::CF_PROXY_METADATA, "Zm9yZ2Vk".parse().unwrap());
        let response = h.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(headers::CF_ROUTER_ERROR).unwrap(),
            "route_service_invalid_signature"
        );
    }

    #[tokio::test]
    async fn test_expired_signature_rejected() {
        let config = RouteServiceConfig {
            signing_key: "secret".to_string(),
            timeout_secs: 60,
            recommend_https: false,
        };
        let h = RouteServiceHandler::new(&config, Arc::new(ProxyReporter::new())).unwrap();
        let key = SignatureKey::new("secret").unwrap();
        let stale = SignaturePayload {
            forwarded_url: "http://app.example.com/x".to_string(),
            signed_time: chrono::Utc::now().timestamp() - 3600,
        };
        let (sig, meta) = key.encode(&stale).unwrap();

        let (mut parts, mut info) = prepared(Some("https://rs.example.com"));
        parts
            .headers
            .insert(headers::CF_PROXY_SIGNATURE, sig.parse().unwrap());
        parts
            .headers
            .insert(headers::CF_PROXY_METADATA, meta.parse().unwrap());
        let response = h.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_no_signing_key_is_unsupported() {
        let h = handler("", 60);
        let (mut parts, mut info) = prepared(Some("https://rs.example.com"));
        let response = h.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(headers::CF_ROUTER_ERROR).unwrap(),
            "route_service_unsupported"
        );
    }

    #[tokio::test]
    async fn test_is_route_service_traffic() {
        let h = handler("secret", 60);
        let (mut parts, mut info) = prepared(Some("https://rs.example.com"));
        assert!(!h.is_route_service_traffic(&parts));
        h.handle(&mut parts, &mut info).await.unwrap();
        assert!(h.is_route_service_traffic(&parts));
    }

    #[tokio::test]
    async fn test_missing_pool_is_invariant_error() {
        let h = handler("secret", 60);
        let (mut parts, mut info) = request("GET", "/");
        let err = h.handle(&mut parts, &mut info).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::RouterError::RequestInfoMissing(_)
        ));
    }
}
