//! Platform header names shared across the pipeline

/// Identifies the error class to operators on terminal responses
pub const CF_ROUTER_ERROR: &str = "X-Cf-RouterError";
/// Per-request id, set on requests and responses
pub const VCAP_REQUEST_ID: &str = "X-Vcap-Request-Id";
/// Client-requested instance restriction, "app_id:index"
pub const CF_APP_INSTANCE: &str = "X-CF-App-Instance";
/// Route service signature (encrypted payload)
pub const CF_PROXY_SIGNATURE: &str = "X-CF-Proxy-Signature";
/// Route service signature metadata (nonce)
pub const CF_PROXY_METADATA: &str = "X-CF-Proxy-Metadata";
/// URL the route service must forward the request back to
pub const CF_FORWARDED_URL: &str = "X-CF-Forwarded-Url";
/// Appended chain of client addresses
pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
/// Scheme the client used to reach the platform edge
pub const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
/// Client certificate chain forwarded to backends
pub const X_FORWARDED_CLIENT_CERT: &str = "X-Forwarded-Client-Cert";
/// Unix-millis timestamp of arrival at the edge; never overwritten
pub const X_REQUEST_START: &str = "X-Request-Start";
/// Zipkin B3 trace id
pub const B3_TRACE_ID: &str = "X-B3-TraceId";
/// Zipkin B3 span id
pub const B3_SPAN_ID: &str = "X-B3-SpanId";
/// W3C trace context
pub const TRACEPARENT: &str = "traceparent";
/// Request-trace opt-in key
pub const VCAP_TRACE: &str = "X-Vcap-Trace";
/// Router address echoed when request tracing is enabled
pub const VCAP_ROUTER: &str = "X-Vcap-Router";
/// Backend address echoed when request tracing is enabled
pub const VCAP_BACKEND: &str = "X-Vcap-Backend";
/// Route endpoint echoed when request tracing is enabled
pub const CF_ROUTE_ENDPOINT: &str = "X-Cf-RouteEndpoint";
/// Sticky affinity cookie holding the private instance id
pub const VCAP_ID_COOKIE: &str = "__VCAP_ID__";
