//! Proxy core — panic guard, handler chain, terminal engine
//!
//! `Proxy::handle` is the entry point for every accepted request: it
//! builds the per-request state, runs the handler chain, and hands
//! surviving requests to the round tripper. A panic or invariant
//! violation anywhere below degrades health and answers 503; the
//! client-abort error is the one failure re-raised to the server so the
//! connection is torn down instead of answered.

pub mod buffer_pool;
pub mod engine;
pub mod error_handler;
pub mod fails;
pub mod round_tripper;
pub mod transport;

use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::handlers::client_cert::{ClientCertHandler, SkipSanitizePredicate};
use crate::handlers::forwarded::ForwardedHandler;
use crate::handlers::healthcheck::HealthcheckHandler;
use crate::handlers::hop_by_hop::HopByHopHandler;
use crate::handlers::lookup::LookupHandler;
use crate::handlers::max_size::MaxRequestSizeHandler;
use crate::handlers::protocol::ProtocolHandler;
use crate::handlers::request_id::RequestIdHandler;
use crate::handlers::trace::{W3cHandler, ZipkinHandler};
use crate::handlers::{Chain, ProxyBody, RequestInfo};
use crate::headers;
use crate::health::{Health, HealthState};
use crate::observability::{AccessLogEntry, AccessLogger, AttemptDetail, ProxyReporter};
use crate::proxy::engine::{CountingBody, Engine};
use crate::proxy::error_handler::{default_error_specs, ErrorHandler};
use crate::proxy::round_tripper::ProxyRoundTripper;
use crate::proxy::transport::{OutBody, TransportFactory};
use crate::registry::RouteRegistry;
use crate::routeservice::RouteServiceHandler;
use bytes::Bytes;
use futures_util::FutureExt;
use http::Response;
use http_body_util::BodyExt;
use hyper::body::Frame;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// Connection-level facts captured at accept time
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub peer_addr: SocketAddr,
    pub tls: bool,
    pub peer_cert_pem: Option<String>,
}

/// The assembled request pipeline and proxy core
pub struct Proxy {
    chain: Chain,
    engine: Arc<Engine>,
    round_tripper: ProxyRoundTripper,
    factory: Arc<TransportFactory>,
    health: Arc<Health>,
    reporter: Arc<ProxyReporter>,
    access_log: Arc<AccessLogger>,
}

impl Proxy {
    /// Build the proxy with the canonical handler order. The transport
    /// factory is wired to the registry's endpoint-removal events so
    /// dead endpoints do not leak connections.
    pub fn new(
        config: &RouterConfig,
        registry: Arc<RouteRegistry>,
        health: Arc<Health>,
        reporter: Arc<ProxyReporter>,
        access_log: Arc<AccessLogger>,
    ) -> Result<Arc<Self>> {
        let factory = Arc::new(TransportFactory::new(&config.backends)?);
        {
            let factory = factory.clone();
            registry.on_endpoint_removed(Box::new(move |key| factory.evict(key)));
        }

        let engine = Arc::new(Engine::new(config));
        let route_service =
            Arc::new(RouteServiceHandler::new(&config.route_services, reporter.clone())?);

        // a signed route-service return over TLS proves the header origin
        let rs = route_service.clone();
        let skip_cert_sanitize: SkipSanitizePredicate =
            Arc::new(move |parts, info| info.client_tls && rs.is_route_service_traffic(parts));
        let rs = route_service.clone();
        let skip_proto_sanitize: SkipSanitizePredicate =
            Arc::new(move |parts, _info| rs.is_route_service_traffic(parts));

        // order is fixed and load-bearing
        let chain = Chain::new(vec![
            Arc::new(ZipkinHandler::new(config.tracing.enable_zipkin)),
            Arc::new(W3cHandler::new(config.tracing.enable_w3c)),
            Arc::new(RequestIdHandler),
            Arc::new(HealthcheckHandler::new(
                config.healthcheck_user_agent.clone(),
                health.clone(),
            )),
            Arc::new(ProtocolHandler::new(config.enable_http2, reporter.clone())),
            Arc::new(LookupHandler::new(
                registry,
                reporter.clone(),
                config.empty_pool_404,
            )),
            Arc::new(MaxRequestSizeHandler::new(
                config.limits.max_header_bytes,
                config.limits.max_body_bytes,
            )),
            Arc::new(ClientCertHandler::new(
                config.forwarding.forwarded_client_cert,
                skip_cert_sanitize,
            )),
            Arc::new(HopByHopHandler),
            Arc::new(ForwardedHandler::new(
                config.forwarding.force_forwarded_proto_https,
                config.forwarding.sanitize_forwarded_proto,
                skip_proto_sanitize,
            )),
            route_service,
        ]);

        let error_handler = ErrorHandler::new(default_error_specs(), reporter.clone());
        let round_tripper = ProxyRoundTripper::new(
            factory.clone(),
            engine.clone(),
            reporter.clone(),
            error_handler,
            config.backends.max_attempts,
            config.backends.response_header_timeout(),
        );

        Ok(Arc::new(Self {
            chain,
            engine,
            round_tripper,
            factory,
            health,
            reporter,
            access_log,
        }))
    }

    /// The transport cache, for the server's idle sweeper
    pub fn transport_factory(&self) -> &Arc<TransportFactory> {
        &self.factory
    }

    /// Entry point for the hyper server
    pub async fn handle(
        self: &Arc<Self>,
        request: hyper::Request<hyper::body::Incoming>,
        ctx: ConnectionContext,
    ) -> Result<Response<ProxyBody>> {
        let (parts, body) = request.into_parts();
        let body = request_has_body(&parts).then(|| body.boxed_unsync());
        self.handle_parts(parts, body, ctx).await
    }

    /// Entry point with the body already adapted; also used by tests
    pub async fn handle_parts(
        self: &Arc<Self>,
        mut parts: http::request::Parts,
        body: Option<OutBody>,
        ctx: ConnectionContext,
    ) -> Result<Response<ProxyBody>> {
        self.reporter.capture_request();
        if parts.headers.get(http::header::CONTENT_LENGTH).is_none() {
            self.reporter.capture_missing_content_length();
        }

        let mut info = RequestInfo::new(ctx.peer_addr, ctx.tls, &parts);
        info.peer_cert_pem = ctx.peer_cert_pem;

        let outcome = AssertUnwindSafe(self.process(&mut parts, body, &mut info))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(RouterError::ClientCanceled)) => {
                // re-raise so the server aborts the connection; the log
                // still records the abandoned exchange
                self.emit_log(&parts, &info, 499, 0);
                Err(RouterError::ClientCanceled)
            }
            Ok(Err(err)) => Ok(self.invariant_failure(&parts, &mut info, err.to_string())),
            Err(panic) => {
                Ok(self.invariant_failure(&parts, &mut info, panic_message(panic)))
            }
        }
    }

    async fn process(
        &self,
        parts: &mut http::request::Parts,
        body: Option<OutBody>,
        info: &mut RequestInfo,
    ) -> Result<Response<ProxyBody>> {
        if let Some(response) = self.chain.run(parts, info).await? {
            return Ok(self.finish(response, parts, info));
        }

        self.engine.prepare_backend_request(parts, info);
        let body = body.map(|inner| AbortTrackingBody::wrap(inner, info.client_body_aborted.clone()));

        info.app_request_started_at = Some(Instant::now());
        let response = self.round_tripper.round_trip(parts, body, info).await?;
        info.app_request_finished_at = Some(Instant::now());

        Ok(self.finish(response, parts, info))
    }

    /// Attach response invariants and arm the access-log finisher. The
    /// entry is emitted only after the last body byte reaches the client.
    fn finish(
        &self,
        mut response: Response<ProxyBody>,
        parts: &http::request::Parts,
        info: &RequestInfo,
    ) -> Response<ProxyBody> {
        if !info.request_id.is_empty()
            && !response.headers().contains_key(headers::VCAP_REQUEST_ID)
        {
            if let Ok(value) = info.request_id.parse() {
                response.headers_mut().insert(headers::VCAP_REQUEST_ID, value);
            }
        }
        if info.close_connection {
            response
                .headers_mut()
                .insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
        }

        let status = response.status().as_u16();
        self.reporter.capture_routing_response(status);

        if info.is_health_probe {
            return response;
        }

        let entry = self.build_entry(parts, info, status);
        let received_at = info.received_at;
        let access_log = self.access_log.clone();
        let reporter = self.reporter.clone();
        CountingBody::wrap(
            response,
            Box::new(move |bytes| {
                let mut entry = entry;
                entry.response_bytes = bytes;
                entry.duration_ms = received_at.elapsed().as_millis() as u64;
                reporter.capture_routing_latency(entry.duration_ms);
                access_log.emit(entry);
            }),
        )
    }

    fn build_entry(
        &self,
        parts: &http::request::Parts,
        info: &RequestInfo,
        status: u16,
    ) -> AccessLogEntry {
        let attempt_details = if self.access_log.include_attempts() {
            info.attempts
                .iter()
                .map(|a| AttemptDetail {
                    attempt: a.attempt,
                    endpoint: a.endpoint.clone(),
                    latency_ms: a.latency.as_millis() as u64,
                    class: a.class.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };

        AccessLogEntry {
            timestamp: info.started_at.to_rfc3339(),
            client_ip: info.peer_addr.ip().to_string(),
            method: parts.method.to_string(),
            path: info.raw_path_and_query.clone(),
            host: info.host.clone(),
            status,
            response_bytes: 0,
            duration_ms: 0,
            request_id: info.request_id.clone(),
            trace_id: info.trace_id.clone(),
            app_id: info
                .endpoint
                .as_ref()
                .filter(|e| !e.app_id.is_empty())
                .map(|e| e.app_id.clone()),
            endpoint: info.endpoint.as_ref().map(|e| e.authority()),
            app_index: info
                .endpoint
                .as_ref()
                .map(|e| e.private_instance_index),
            attempts: info.attempts.len() as u32,
            attempt_details,
            route_service: info.route_service_url.is_some() || info.route_service_return,
            x_forwarded_for: parts
                .headers
                .get(headers::X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            user_agent: parts
                .headers
                .get(http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }

    fn emit_log(&self, parts: &http::request::Parts, info: &RequestInfo, status: u16, bytes: u64) {
        if info.is_health_probe {
            return;
        }
        let mut entry = self.build_entry(parts, info, status);
        entry.response_bytes = bytes;
        entry.duration_ms = info.received_at.elapsed().as_millis() as u64;
        self.reporter.capture_routing_response(status);
        self.access_log.emit(entry);
    }

    /// A panic or pipeline-invariant violation: degrade, log, 503, close
    fn invariant_failure(
        &self,
        parts: &http::request::Parts,
        info: &mut RequestInfo,
        detail: String,
    ) -> Response<ProxyBody> {
        tracing::error!(
            detail,
            method = %parts.method,
            path = info.raw_path_and_query,
            "request pipeline invariant violated"
        );
        self.health.set_health(HealthState::Degraded);
        info.close_connection = true;

        let response = crate::handlers::error_response(
            http::StatusCode::SERVICE_UNAVAILABLE,
            "",
            "503 Service Unavailable",
        );
        self.finish(response, parts, info)
    }
}

/// Whether the request declares a body worth streaming
fn request_has_body(parts: &http::request::Parts) -> bool {
    if parts.headers.contains_key(http::header::TRANSFER_ENCODING) {
        return true;
    }
    parts
        .headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|length| length > 0)
        .unwrap_or(false)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

/// Flags the request as client-aborted when the upload stream errors, so
/// the round tripper classifies the failure as a cancellation instead of
/// a backend fault
struct AbortTrackingBody {
    inner: OutBody,
    aborted: Arc<AtomicBool>,
}

impl AbortTrackingBody {
    fn wrap(inner: OutBody, aborted: Arc<AtomicBool>) -> OutBody {
        Self { inner, aborted }.boxed_unsync()
    }
}

impl http_body::Body for AbortTrackingBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Err(e))) => {
                this.aborted.store(true, Ordering::SeqCst);
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}
