//! Request size caps — header bytes and declared body length

use crate::error::Result;
use crate::handlers::{error_response, Handler, ProxyBody, RequestInfo};
use async_trait::async_trait;
use http::{Response, StatusCode};

/// Enforces the configured header and body size caps. Header overflow is
/// answered 431; a Content-Length above the body cap is answered 413
/// before any body bytes are pulled from the client.
pub struct MaxRequestSizeHandler {
    max_header_bytes: usize,
    max_body_bytes: u64,
}

impl MaxRequestSizeHandler {
    pub fn new(max_header_bytes: usize, max_body_bytes: u64) -> Self {
        Self {
            max_header_bytes,
            max_body_bytes,
        }
    }

    fn header_bytes(parts: &http::request::Parts) -> usize {
        let request_line = parts.method.as_str().len()
            + parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().len())
                .unwrap_or(1)
            + "HTTP/1.1".len()
            + 4;
        let headers: usize = parts
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len() + 4)
            .sum();
        request_line + headers
    }
}

#[async_trait]
impl Handler for MaxRequestSizeHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        if self.max_header_bytes > 0 && Self::header_bytes(parts) > self.max_header_bytes {
            info.close_connection = true;
            return Ok(Some(error_response(
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                "max_request_size_exceeded",
                "431 Request Header Fields Too Large",
            )));
        }

        if self.max_body_bytes > 0 {
            let declared = parts
                .headers
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(length) = declared {
                if length > self.max_body_bytes {
                    info.close_connection = true;
                    return Ok(Some(error_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "max_request_size_exceeded",
                        "413 Payload Too Large",
                    )));
                }
            }
        }

        Ok(None)
    }

    fn name(&self) -> &str {
        "max-request-size"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::request;
    use crate::headers;

    #[tokio::test]
    async fn test_small_request_passes() {
        let h = MaxRequestSizeHandler::new(8192, 1024);
        let (mut parts, mut info) = request("GET", "/");
        let result = h.handle(&mut parts, &mut info).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_oversized_headers_431() {
        let h = MaxRequestSizeHandler::new(64, 0);
        let (mut parts, mut info) = request("GET", "/");
        parts
            .headers
            .insert("x-padding", "p".repeat(200).parse().unwrap());
        let response = h.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        assert_eq!(
            response.headers().get(headers::CF_ROUTER_ERROR).unwrap(),
            "max_request_size_exceeded"
        );
        assert!(info.close_connection);
    }

    #[tokio::test]
    async fn test_oversized_body_413() {
        let h = MaxRequestSizeHandler::new(0, 100);
        let (mut parts, mut info) = request("POST", "/upload");
        parts
            .headers
            .insert(http::header::CONTENT_LENGTH, "500".parse().unwrap());
        let response = h.handle(&mut parts, &mut info).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_body_within_cap_passes() {
        let h = MaxRequestSizeHandler::new(0, 100);
        let (mut parts, mut info) = request("POST", "/upload");
        parts
            .headers
            .insert(http::header::CONTENT_LENGTH, "99".parse().unwrap());
        let result = h.handle(&mut parts, &mut info).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_zero_caps_disable_checks() {
        let h = MaxRequestSizeHandler::new(0, 0);
        let (mut parts, mut info) = request("POST", "/upload");
        parts
            .headers
            .insert("x-padding", "p".repeat(100_000).parse().unwrap());
        parts
            .headers
            .insert(http::header::CONTENT_LENGTH, "999999999".parse().unwrap());
        let result = h.handle(&mut parts, &mut info).await.unwrap();
        assert!(result.is_none());
    }
}
