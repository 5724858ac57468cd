//! Proxy round tripper — endpoint selection, retry, failure discipline
//!
//! Runs at most `max_attempts` attempts against distinct endpoints and
//! always resolves to a response through the error table; raw errors
//! never reach the client. Connections are acquired before the request
//! body is consumed so dial and TLS failures stay retriable; once body
//! bytes have flowed, the request is pinned to its attempt.

use crate::error::{Result, RouterError};
use crate::handlers::{ProxyBody, RequestInfo};
use crate::headers;
use crate::observability::ProxyReporter;
use crate::proxy::engine::Engine;
use crate::proxy::error_handler::ErrorHandler;
use crate::proxy::fails::{ClassifierChain, FailureClass};
use crate::proxy::transport::{DispatchError, OutBody, Transport, TransportFactory};
use crate::registry::Endpoint;
use futures_util::StreamExt;
use http::{HeaderMap, Response};
use http_body_util::{BodyDataStream, BodyExt, Empty};
use hyper::body::Frame;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An empty backend request body
pub fn empty_out_body() -> OutBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// Resilient dispatcher behind the proxy engine
pub struct ProxyRoundTripper {
    factory: Arc<TransportFactory>,
    engine: Arc<Engine>,
    classifiers: ClassifierChain,
    error_handler: ErrorHandler,
    reporter: Arc<ProxyReporter>,
    max_attempts: u32,
    response_header_timeout: Option<Duration>,
}

impl ProxyRoundTripper {
    pub fn new(
        factory: Arc<TransportFactory>,
        engine: Arc<Engine>,
        reporter: Arc<ProxyReporter>,
        error_handler: ErrorHandler,
        max_attempts: u32,
        response_header_timeout: Option<Duration>,
    ) -> Self {
        Self {
            factory,
            engine,
            classifiers: ClassifierChain::default_chain(),
            error_handler,
            reporter,
            max_attempts,
            response_header_timeout,
        }
    }

    /// Dispatch the prepared request. Outbound route-service detours use
    /// the route-service transport with exactly one attempt; everything
    /// else runs the endpoint attempt loop.
    pub async fn round_trip(
        &self,
        parts: &http::request::Parts,
        body: Option<OutBody>,
        info: &mut RequestInfo,
    ) -> Result<Response<ProxyBody>> {
        if info.is_route_service_detour() {
            self.route_service_trip(parts, body, info).await
        } else {
            self.backend_trip(parts, body, info).await
        }
    }

    async fn backend_trip(
        &self,
        parts: &http::request::Parts,
        mut body: Option<OutBody>,
        info: &mut RequestInfo,
    ) -> Result<Response<ProxyBody>> {
        let pool = info.pool()?.clone();
        let sticky = sticky_instance_id(&parts.headers);
        let mut tried_any = false;

        for attempt in 1..=self.max_attempts {
            let endpoint = match &info.app_instance {
                Some(instance) => pool.endpoint_for_instance(
                    &instance.app_id,
                    instance.index,
                    &info.failed_endpoints,
                ),
                None => {
                    let sticky_hint = if attempt == 1 { sticky.as_deref() } else { None };
                    pool.next_endpoint(sticky_hint, &info.failed_endpoints)
                }
            };
            let Some(endpoint) = endpoint else {
                let class = if tried_any {
                    FailureClass::AttemptsExhausted
                } else {
                    FailureClass::NoEndpoints
                };
                return Ok(self.error_handler.respond(class));
            };
            tried_any = true;
            info.endpoint = Some(endpoint.clone());

            let key = endpoint.transport_key();
            let transport = self.factory.backend(&key);
            let attempt_start = Instant::now();

            // acquire before touching the body: dial and TLS failures
            // leave the request replayable
            let sender = match transport.acquire().await {
                Ok(sender) => sender,
                Err(err) => {
                    match self.attempt_failed(
                        err, false, attempt, &pool, &key, &endpoint, attempt_start, info,
                    )? {
                        AttemptOutcome::Retry => continue,
                        AttemptOutcome::Terminal(response) => return Ok(response),
                    }
                }
            };

            let had_body = body.is_some();
            let out_body = body.take().unwrap_or_else(empty_out_body);
            let request = build_backend_request(parts, info, out_body);

            match self.dispatch(sender, request, &transport, &endpoint).await {
                Ok(response) => {
                    pool.mark_updated(&key);
                    pool.record_response_time(&key, attempt_start.elapsed());
                    info.record_attempt(&endpoint.authority(), attempt_start.elapsed(), "ok");
                    return Ok(self.into_proxy_response(response, parts, info));
                }
                Err(err) => {
                    match self.attempt_failed(
                        err, had_body, attempt, &pool, &key, &endpoint, attempt_start, info,
                    )? {
                        AttemptOutcome::Retry => continue,
                        AttemptOutcome::Terminal(response) => return Ok(response),
                    }
                }
            }
        }

        Ok(self.error_handler.respond(FailureClass::AttemptsExhausted))
    }

    /// Shared failure path for one attempt. Returns whether the loop may
    /// try another endpoint or must answer now.
    #[allow(clippy::too_many_arguments)]
    fn attempt_failed(
        &self,
        err: DispatchError,
        body_consumed: bool,
        attempt: u32,
        pool: &Arc<crate::registry::Pool>,
        key: &crate::registry::TransportKey,
        endpoint: &Arc<Endpoint>,
        attempt_start: Instant,
        info: &mut RequestInfo,
    ) -> Result<AttemptOutcome> {
        let class = if info.client_body_aborted.load(Ordering::SeqCst) {
            FailureClass::Canceled
        } else {
            self.classifiers.classify(&err)
        };
        info.record_attempt(&endpoint.authority(), attempt_start.elapsed(), class.as_str());
        tracing::warn!(
            endpoint = %endpoint.authority(),
            attempt,
            class = class.as_str(),
            error = %err,
            "backend attempt failed"
        );

        if class == FailureClass::Canceled {
            self.reporter.capture(self.error_handler.metric_for(class));
            return Err(RouterError::ClientCanceled);
        }

        if class.is_retriable() {
            // quarantine for everyone, and for this request specifically
            info.failed_endpoints.push(key.clone());
            pool.mark_failed(key);
            if class == FailureClass::HostnameInvalid {
                // a certificate for the wrong name means our view of this
                // endpoint is stale
                tracing::info!(endpoint = %endpoint.authority(), "stale endpoint suspected, pool refresh advised");
            }
        }

        let can_retry = class.is_retriable() && !body_consumed && attempt < self.max_attempts;
        if can_retry {
            self.reporter.capture(self.error_handler.metric_for(class));
            return Ok(AttemptOutcome::Retry);
        }

        if class.is_retriable() {
            // out of attempts (or the body is gone): the per-attempt
            // metric still records what actually went wrong
            self.reporter.capture(self.error_handler.metric_for(class));
            return Ok(AttemptOutcome::Terminal(
                self.error_handler.respond(FailureClass::AttemptsExhausted),
            ));
        }
        Ok(AttemptOutcome::Terminal(self.error_handler.respond(class)))
    }

    async fn dispatch(
        &self,
        mut sender: hyper::client::conn::http1::SendRequest<OutBody>,
        request: hyper::Request<OutBody>,
        transport: &Arc<Transport>,
        endpoint: &Arc<Endpoint>,
    ) -> std::result::Result<Response<hyper::body::Incoming>, DispatchError> {
        let authority = endpoint.authority();
        let send = sender.send_request(request);
        let result = match self.response_header_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Err(_) => return Err(DispatchError::ResponseHeaderTimeout { authority }),
                Ok(result) => result,
            },
            None => send.await,
        };
        match result {
            Ok(response) => {
                transport.checkin(sender);
                Ok(response)
            }
            Err(source) => Err(DispatchError::RequestFailed { authority, source }),
        }
    }

    fn into_proxy_response(
        &self,
        response: Response<hyper::body::Incoming>,
        parts: &http::request::Parts,
        info: &mut RequestInfo,
    ) -> Response<ProxyBody> {
        let (mut resp_parts, incoming) = response.into_parts();
        self.engine
            .modify_response(&mut resp_parts, &parts.headers, info);

        // a client that pinned an instance learns which one answered
        if let Some(instance) = &info.app_instance {
            let value = format!("{}:{}", instance.app_id, instance.index);
            if let Ok(value) = value.parse() {
                resp_parts.headers.insert(headers::CF_APP_INSTANCE, value);
            }
        }

        let body = self.engine.relay(incoming);
        Response::from_parts(resp_parts, body)
    }

    /// One attempt against the route service; no pool, no per-endpoint
    /// classification.
    async fn route_service_trip(
        &self,
        parts: &http::request::Parts,
        body: Option<OutBody>,
        info: &mut RequestInfo,
    ) -> Result<Response<ProxyBody>> {
        let url = info
            .route_service_url
            .clone()
            .ok_or(RouterError::RequestInfoMissing("route service url"))?;

        let mut request_headers = parts.headers.clone();
        // the route service is addressed by its own URL
        request_headers.remove(http::header::HOST);

        let mut builder = self
            .factory
            .route_service_client()
            .request(parts.method.clone(), &url)
            .headers(request_headers);
        if let Some(body) = body {
            builder = builder.body(reqwest::Body::wrap_stream(BodyDataStream::new(body)));
        }

        let attempt_start = Instant::now();
        let result = builder.send().await;

        match result {
            Ok(response) => {
                info.record_attempt(&url, attempt_start.elapsed(), "ok");
                let status = response.status();
                let response_headers = response.headers().clone();
                let stream = response
                    .bytes_stream()
                    .map(|chunk| chunk.map(Frame::data).map_err(RouterError::from));
                let body: ProxyBody = crate::proxy::engine::channel_body(stream);

                let mut out = Response::new(body);
                *out.status_mut() = status;
                *out.headers_mut() = response_headers;
                let (mut resp_parts, body) = out.into_parts();
                self.engine
                    .modify_response(&mut resp_parts, &parts.headers, info);
                Ok(Response::from_parts(resp_parts, body))
            }
            Err(err) => {
                let class = if info.client_body_aborted.load(Ordering::SeqCst) {
                    FailureClass::Canceled
                } else {
                    FailureClass::RouteServiceFailed
                };
                info.record_attempt(&url, attempt_start.elapsed(), class.as_str());
                tracing::warn!(url, error = %err, "route service request failed");
                if class == FailureClass::Canceled {
                    self.reporter.capture(self.error_handler.metric_for(class));
                    return Err(RouterError::ClientCanceled);
                }
                Ok(self.error_handler.respond(class))
            }
        }
    }
}

enum AttemptOutcome {
    Retry,
    Terminal(Response<ProxyBody>),
}

/// Read the sticky affinity cookie from the request
pub fn sticky_instance_id(request_headers: &HeaderMap) -> Option<String> {
    for value in request_headers.get_all(http::header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some(id) = pair.strip_prefix(headers::VCAP_ID_COOKIE) {
                let id = id.strip_prefix('=').unwrap_or("");
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
        }
    }
    None
}

fn build_backend_request(
    parts: &http::request::Parts,
    info: &RequestInfo,
    body: OutBody,
) -> hyper::Request<OutBody> {
    let uri = Engine::origin_form_uri(&info.raw_path_and_query);
    let mut request = hyper::Request::new(body);
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = uri;
    *request.version_mut() = http::Version::HTTP_11;
    *request.headers_mut() = parts.headers.clone();
    if !request.headers().contains_key(http::header::HOST) {
        if let Ok(value) = info.host.parse() {
            request.headers_mut().insert(http::header::HOST, value);
        }
    }
    request
}
