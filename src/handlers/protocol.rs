//! Protocol gate — HTTP version enforcement and query hygiene

use crate::error::Result;
use crate::handlers::{error_response, Handler, ProxyBody, RequestInfo};
use crate::observability::ProxyReporter;
use async_trait::async_trait;
use http::{Response, StatusCode, Version};
use std::sync::Arc;

/// Rejects HTTP/2 when disabled and counts requests whose query string
/// uses `;` as a separator, which some backend frameworks misparse.
pub struct ProtocolHandler {
    enable_http2: bool,
    reporter: Arc<ProxyReporter>,
}

impl ProtocolHandler {
    pub fn new(enable_http2: bool, reporter: Arc<ProxyReporter>) -> Self {
        Self {
            enable_http2,
            reporter,
        }
    }
}

#[async_trait]
impl Handler for ProtocolHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        if parts.version == Version::HTTP_2 && !self.enable_http2 {
            info.close_connection = true;
            return Ok(Some(error_response(
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                "unsupported_protocol",
                "Unsupported protocol",
            )));
        }

        if let Some(query) = parts.uri.query() {
            if query.contains(';') {
                self.reporter.capture_semicolon_query();
                tracing::warn!(
                    host = info.host,
                    "query string uses semicolon separators"
                );
            }
        }

        Ok(None)
    }

    fn name(&self) -> &str {
        "protocol"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::request;

    #[tokio::test]
    async fn test_http1_passes() {
        let h = ProtocolHandler::new(false, Arc::new(ProxyReporter::new()));
        let (mut parts, mut info) = request("GET", "/");
        let result = h.handle(&mut parts, &mut info).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_http2_rejected_when_disabled() {
        let h = ProtocolHandler::new(false, Arc::new(ProxyReporter::new()));
        let (mut parts, mut info) = request("GET", "/");
        parts.version = Version::HTTP_2;
        let response = h.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);
        assert!(info.close_connection);
    }

    #[tokio::test]
    async fn test_http2_allowed_when_enabled() {
        let h = ProtocolHandler::new(true, Arc::new(ProxyReporter::new()));
        let (mut parts, mut info) = request("GET", "/");
        parts.version = Version::HTTP_2;
        let result = h.handle(&mut parts, &mut info).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_semicolon_query_counted() {
        let reporter = Arc::new(ProxyReporter::new());
        let h = ProtocolHandler::new(false, reporter.clone());
        let (mut parts, mut info) = request("GET", "/search?a=1;b=2");
        let result = h.handle(&mut parts, &mut info).await.unwrap();
        assert!(result.is_none());
        assert_eq!(reporter.counter("semicolon_query_params"), 1);
    }

    #[tokio::test]
    async fn test_plain_query_not_counted() {
        let reporter = Arc::new(ProxyReporter::new());
        let h = ProtocolHandler::new(false, reporter.clone());
        let (mut parts, mut info) = request("GET", "/search?a=1&b=2");
        h.handle(&mut parts, &mut info).await.unwrap();
        assert_eq!(reporter.counter("semicolon_query_params"), 0);
    }
}
