//! Request pipeline — ordered handlers applied to every request
//!
//! Each handler either mutates the request and lets the chain continue,
//! or terminates the exchange by returning a response. The order is fixed
//! and load-bearing; it is assembled in `proxy::Proxy::new`.

pub mod client_cert;
pub mod forwarded;
pub mod healthcheck;
pub mod hop_by_hop;
pub mod lookup;
pub mod max_size;
pub mod protocol;
pub mod request_id;
pub mod request_info;
pub mod trace;

pub use request_info::{AppInstance, AttemptRecord, RequestInfo};

use crate::error::{Result, RouterError};
use crate::headers;
use async_trait::async_trait;
use bytes::Bytes;
use http::Response;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use std::sync::Arc;

/// Body type flowing out of the pipeline
pub type ProxyBody = BoxBody<Bytes, RouterError>;

/// A fully buffered body
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// An empty body
pub fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// Minimal text response carrying the operator-facing error class
pub fn error_response(
    status: http::StatusCode,
    router_error: &str,
    body: &str,
) -> Response<ProxyBody> {
    let mut builder = Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8");
    if !router_error.is_empty() {
        builder = builder.header(headers::CF_ROUTER_ERROR, router_error);
    }
    builder
        .body(full_body(body.to_string()))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// One stage of the request pipeline.
///
/// Returning `Ok(None)` passes the (possibly mutated) request to the next
/// stage; returning `Ok(Some(response))` terminates the exchange. A stage
/// that terminated must not have mutated state the engine depends on.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>>;

    /// Handler name for logging
    fn name(&self) -> &str;
}

/// Linear composition of handlers
pub struct Chain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Chain {
    /// Compose handlers in invocation order
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self { handlers }
    }

    /// Run the request through all handlers.
    /// Returns `Some(response)` when a handler short-circuits.
    pub async fn run(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        for handler in &self.handlers {
            if let Some(response) = handler.handle(parts, info).await? {
                tracing::debug!(handler = handler.name(), "handler terminated request");
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Number of handlers in the chain
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
