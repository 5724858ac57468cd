//! Trace header normalisation — Zipkin B3 and W3C trace context
//!
//! Inbound trace headers are validated and propagated; missing or
//! malformed ones are regenerated so every backend dispatch carries a
//! consistent trace identity.

use crate::error::Result;
use crate::handlers::{Handler, ProxyBody, RequestInfo};
use crate::headers;
use async_trait::async_trait;
use http::Response;

/// 128-bit lowercase hex trace id
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// 64-bit lowercase hex span id
pub fn generate_span_id() -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[..16].to_string()
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn valid_trace_id(s: &str) -> bool {
    (s.len() == 16 || s.len() == 32) && is_hex(s)
}

fn valid_span_id(s: &str) -> bool {
    s.len() == 16 && is_hex(s)
}

/// Ensures `X-B3-TraceId` / `X-B3-SpanId` are present and well formed
pub struct ZipkinHandler {
    enabled: bool,
}

impl ZipkinHandler {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl Handler for ZipkinHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        if !self.enabled {
            return Ok(None);
        }

        let inbound_trace = parts
            .headers
            .get(headers::B3_TRACE_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| valid_trace_id(v))
            .map(str::to_string);
        let inbound_span = parts
            .headers
            .get(headers::B3_SPAN_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| valid_span_id(v))
            .map(str::to_string);

        let (trace_id, span_id) = match (inbound_trace, inbound_span) {
            (Some(t), Some(s)) => (t, s),
            _ => (generate_trace_id(), generate_span_id()),
        };

        if let (Ok(t), Ok(s)) = (trace_id.parse(), span_id.parse()) {
            parts.headers.insert(headers::B3_TRACE_ID, t);
            parts.headers.insert(headers::B3_SPAN_ID, s);
        }
        info.trace_id = Some(trace_id);
        info.span_id = Some(span_id);
        Ok(None)
    }

    fn name(&self) -> &str {
        "zipkin"
    }
}

/// Ensures a valid W3C `traceparent`, reusing the Zipkin trace id when one
/// was already normalised
pub struct W3cHandler {
    enabled: bool,
}

impl W3cHandler {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn parse_traceparent(value: &str) -> Option<(String, String)> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        if parts.len() != 4 || parts[0] != "00" {
            return None;
        }
        let (trace_id, parent_id, flags) = (parts[1], parts[2], parts[3]);
        if trace_id.len() != 32 || parent_id.len() != 16 || flags.len() != 2 {
            return None;
        }
        if !is_hex(trace_id) || !is_hex(parent_id) || !is_hex(flags) {
            return None;
        }
        Some((trace_id.to_string(), parent_id.to_string()))
    }
}

#[async_trait]
impl Handler for W3cHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        if !self.enabled {
            return Ok(None);
        }

        let inbound = parts
            .headers
            .get(headers::TRACEPARENT)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse_traceparent);

        let trace_id = match inbound {
            Some((trace_id, _parent)) => trace_id,
            None => info
                .trace_id
                .clone()
                .filter(|t| t.len() == 32)
                .unwrap_or_else(generate_trace_id),
        };
        let span_id = generate_span_id();

        let traceparent = format!("00-{}-{}-01", trace_id, span_id);
        if let Ok(value) = traceparent.parse() {
            parts.headers.insert(headers::TRACEPARENT, value);
        }
        if info.trace_id.is_none() {
            info.trace_id = Some(trace_id);
            info.span_id = Some(span_id);
        }
        Ok(None)
    }

    fn name(&self) -> &str {
        "w3c"
    }
}
