//! Hop-by-hop header stripping (RFC 7230 §6.1)

use crate::error::Result;
use crate::handlers::{Handler, ProxyBody, RequestInfo};
use async_trait::async_trait;
use http::{HeaderMap, Response};

/// Headers that describe the current connection and must not cross a proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers plus any header named in `Connection` tokens.
/// Applied to requests here and to responses in the proxy engine.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in connection_named {
        headers.remove(name.as_str());
    }
}

/// Strips hop-by-hop headers from the inbound request
pub struct HopByHopHandler;

#[async_trait]
impl Handler for HopByHopHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        _info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        strip_hop_by_hop(&mut parts.headers);
        Ok(None)
    }

    fn name(&self) -> &str {
        "hop-by-hop"
    }
}
