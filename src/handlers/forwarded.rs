//! Forwarding headers — X-Forwarded-For and X-Forwarded-Proto

use crate::error::Result;
use crate::handlers::client_cert::SkipSanitizePredicate;
use crate::handlers::{Handler, ProxyBody, RequestInfo};
use crate::headers;
use async_trait::async_trait;
use http::Response;

/// Appends the immediate peer to `X-Forwarded-For` and resolves
/// `X-Forwarded-Proto` per policy before the request leaves for a backend
/// or route service.
pub struct ForwardedHandler {
    force_forwarded_proto_https: bool,
    sanitize_forwarded_proto: bool,
    skip_sanitize: SkipSanitizePredicate,
}

impl ForwardedHandler {
    pub fn new(
        force_forwarded_proto_https: bool,
        sanitize_forwarded_proto: bool,
        skip_sanitize: SkipSanitizePredicate,
    ) -> Self {
        Self {
            force_forwarded_proto_https,
            sanitize_forwarded_proto,
            skip_sanitize,
        }
    }

    fn connection_scheme(info: &RequestInfo) -> &'static str {
        if info.client_tls {
            "https"
        } else {
            "http"
        }
    }
}

#[async_trait]
impl Handler for ForwardedHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        // X-Forwarded-For: append the peer we actually accepted from
        let peer_ip = info.peer_addr.ip().to_string();
        let xff = match parts
            .headers
            .get(headers::X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) if !existing.is_empty() => format!("{}, {}", existing, peer_ip),
            _ => peer_ip,
        };
        if let Ok(value) = xff.parse() {
            parts.headers.insert(headers::X_FORWARDED_FOR, value);
        }

        // X-Forwarded-Proto
        let inbound = parts
            .headers
            .get(headers::X_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let proto = if self.force_forwarded_proto_https {
            "https".to_string()
        } else if (self.skip_sanitize)(parts, info) || !self.sanitize_forwarded_proto {
            // a signed route-service hop (or a trusting config) may carry
            // the original scheme through
            inbound.unwrap_or_else(|| Self::connection_scheme(info).to_string())
        } else {
            Self::connection_scheme(info).to_string()
        };
        if let Ok(value) = proto.parse() {
            parts.headers.insert(headers::X_FORWARDED_PROTO, value);
        }

        Ok(None)
    }

    fn name(&self) -> &str {
        "forwarded"
    }
}
