//! Terminal error mapping — failure class to response and metric
//!
//! The round tripper never surfaces a raw error to the client; every
//! terminal failure resolves through this closed table.

use crate::handlers::{error_response, ProxyBody};
use crate::observability::ProxyReporter;
use crate::proxy::fails::FailureClass;
use http::{Response, StatusCode};
use std::sync::Arc;

/// One row of the error table
pub struct ErrorSpec {
    pub class: FailureClass,
    pub status: StatusCode,
    /// Value for `X-Cf-RouterError`; empty = header omitted
    pub router_error: &'static str,
    /// Counter bumped on the reporter
    pub metric: &'static str,
    /// Client-visible body
    pub body: &'static str,
}

/// The closed, deterministic default table
pub fn default_error_specs() -> Vec<ErrorSpec> {
    let tls_handshake = StatusCode::from_u16(526).unwrap_or(StatusCode::BAD_GATEWAY);
    let client_closed = StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST);
    vec![
        ErrorSpec {
            class: FailureClass::DialTimeout,
            status: StatusCode::BAD_GATEWAY,
            router_error: "endpoint_failure",
            metric: "backend_conn_failed",
            body: "502 Bad Gateway: connection to the backend timed out",
        },
        ErrorSpec {
            class: FailureClass::DialFailed,
            status: StatusCode::BAD_GATEWAY,
            router_error: "endpoint_failure",
            metric: "backend_conn_failed",
            body: "502 Bad Gateway: could not connect to the backend",
        },
        ErrorSpec {
            class: FailureClass::TlsHandshakeFailed,
            status: tls_handshake,
            router_error: "endpoint_failure",
            metric: "backend_tls_failed",
            body: "526 SSL Handshake Failed: backend TLS handshake failed",
        },
        ErrorSpec {
            class: FailureClass::HostnameInvalid,
            status: StatusCode::SERVICE_UNAVAILABLE,
            router_error: "backend_invalid_id",
            metric: "backend_invalid_id",
            body: "503 Service Unavailable: backend identity could not be verified",
        },
        ErrorSpec {
            class: FailureClass::ResponseHeaderTimeout,
            status: StatusCode::GATEWAY_TIMEOUT,
            router_error: "endpoint_failure",
            metric: "backend_response_timeout",
            body: "504 Gateway Timeout: backend did not respond in time",
        },
        ErrorSpec {
            class: FailureClass::Canceled,
            status: client_closed,
            router_error: "",
            metric: "client_canceled",
            body: "",
        },
        ErrorSpec {
            class: FailureClass::AttemptsExhausted,
            status: StatusCode::BAD_GATEWAY,
            router_error: "endpoint_failure",
            metric: "backend_exhausted_conns",
            body: "502 Bad Gateway: all backend attempts failed",
        },
        ErrorSpec {
            class: FailureClass::NoEndpoints,
            status: StatusCode::SERVICE_UNAVAILABLE,
            router_error: "no_endpoints",
            metric: "bad_gateway",
            body: "503 Service Unavailable: no running instances",
        },
        ErrorSpec {
            class: FailureClass::RouteServiceFailed,
            status: StatusCode::BAD_GATEWAY,
            router_error: "route_service_failure",
            metric: "route_service_failed",
            body: "502 Bad Gateway: route service request failed",
        },
        ErrorSpec {
            class: FailureClass::Other,
            status: StatusCode::BAD_GATEWAY,
            router_error: "endpoint_failure",
            metric: "backend_other",
            body: "502 Bad Gateway: backend request failed",
        },
    ]
}

/// Maps a terminal failure class to the client response and metric
pub struct ErrorHandler {
    specs: Vec<ErrorSpec>,
    reporter: Arc<ProxyReporter>,
}

impl ErrorHandler {
    pub fn new(specs: Vec<ErrorSpec>, reporter: Arc<ProxyReporter>) -> Self {
        Self { specs, reporter }
    }

    fn spec_for(&self, class: FailureClass) -> &ErrorSpec {
        self.specs
            .iter()
            .find(|s| s.class == class)
            .or_else(|| self.specs.iter().find(|s| s.class == FailureClass::Other))
            .unwrap_or(&FALLBACK)
    }

    /// Resolve a terminal failure into a response, bumping its metric
    pub fn respond(&self, class: FailureClass) -> Response<ProxyBody> {
        let spec = self.spec_for(class);
        self.reporter.capture(spec.metric);
        error_response(spec.status, spec.router_error, spec.body)
    }

    /// The status a class maps to, without producing a response
    pub fn status_for(&self, class: FailureClass) -> StatusCode {
        self.spec_for(class).status
    }

    /// The metric a class maps to
    pub fn metric_for(&self, class: FailureClass) -> &'static str {
        self.spec_for(class).metric
    }
}

static FALLBACK: ErrorSpec = ErrorSpec {
    class: FailureClass::Other,
    status: StatusCode::BAD_GATEWAY,
    router_error: "endpoint_failure",
    metric: "backend_other",
    body: "502 Bad Gateway",
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers;

    fn handler() -> (Arc<ProxyReporter>, ErrorHandler) {
        let reporter = Arc::new(ProxyReporter::new());
        (
            reporter.clone(),
            ErrorHandler::new(default_error_specs(), reporter),
        )
    }

    #[test]
    fn test_dial_timeout_maps_to_502() {
        let (reporter, h) = handler();
        let resp = h.respond(FailureClass::DialTimeout);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers().get(headers::CF_ROUTER_ERROR).unwrap(),
            "endpoint_failure"
        );
        assert_eq!(reporter.counter("backend_conn_failed"), 1);
    }

    #[test]
    fn test_tls_maps_to_526() {
        let (reporter, h) = handler();
        let resp = h.respond(FailureClass::TlsHandshakeFailed);
        assert_eq!(resp.status().as_u16(), 526);
        assert_eq!(reporter.counter("backend_tls_failed"), 1);
    }

    #[test]
    fn test_hostname_invalid_maps_to_503() {
        let (reporter, h) = handler();
        let resp = h.respond(FailureClass::HostnameInvalid);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get(headers::CF_ROUTER_ERROR).unwrap(),
            "backend_invalid_id"
        );
        assert_eq!(reporter.counter("backend_invalid_id"), 1);
    }

    #[test]
    fn test_exhausted_maps_to_502() {
        let (reporter, h) = handler();
        let resp = h.respond(FailureClass::AttemptsExhausted);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(reporter.counter("backend_exhausted_conns"), 1);
    }

    #[test]
    fn test_no_endpoints_maps_to_503_bad_gateway_metric() {
        let (reporter, h) = handler();
        let resp = h.respond(FailureClass::NoEndpoints);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get(headers::CF_ROUTER_ERROR).unwrap(),
            "no_endpoints"
        );
        assert_eq!(reporter.counter("bad_gateway"), 1);
    }

    #[test]
    fn test_canceled_maps_to_499() {
        let (reporter, h) = handler();
        let resp = h.respond(FailureClass::Canceled);
        assert_eq!(resp.status().as_u16(), 499);
        assert!(resp.headers().get(headers::CF_ROUTER_ERROR).is_none());
        assert_eq!(reporter.counter("client_canceled"), 1);
    }

    #[test]
    fn test_unknown_class_falls_back_to_other() {
        let reporter = Arc::new(ProxyReporter::new());
        // a table missing most rows
        let h = ErrorHandler::new(
            vec![ErrorSpec {
                class: FailureClass::Other,
                status: StatusCode::BAD_GATEWAY,
                router_error: "endpoint_failure",
                metric: "backend_other",
                body: "nope",
            }],
            reporter.clone(),
        );
        let resp = h.respond(FailureClass::DialTimeout);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(reporter.counter("backend_other"), 1);
    }

    #[test]
    fn test_status_and_metric_lookups() {
        let (_, h) = handler();
        assert_eq!(
            h.status_for(FailureClass::ResponseHeaderTimeout),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(h.metric_for(FailureClass::NoEndpoints), "bad_gateway");
    }
}
