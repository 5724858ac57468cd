//! Proxy engine — request director, response modifier, streaming relay
//!
//! The director rewrites the outgoing request while preserving the raw
//! request-target byte-for-byte; the response modifier strips upstream
//! hop-by-hop headers and applies platform response headers; the relay
//! streams the upstream body to the client through pooled buffers with a
//! bounded flush interval. Nothing is ever buffered in full.

use crate::config::{RouterConfig, StickyConfig};
use crate::error::RouterError;
use crate::handlers::hop_by_hop::strip_hop_by_hop;
use crate::handlers::{ProxyBody, RequestInfo};
use crate::headers;
use crate::proxy::buffer_pool::{BufferPool, PooledBuffer};
use bytes::Bytes;
use http::HeaderMap;
use http_body_util::BodyExt;
use hyper::body::Frame;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// Flush cadence for chunked upstream responses
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Stateless per-request transforms plus the relay machinery
pub struct Engine {
    buffer_pool: Arc<BufferPool>,
    flush_interval: Duration,
    sticky: StickyConfig,
    trace_key: String,
    router_address: String,
}

impl Engine {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            buffer_pool: BufferPool::with_defaults(),
            flush_interval: FLUSH_INTERVAL,
            sticky: config.sticky.clone(),
            trace_key: config.trace_key.clone(),
            router_address: config.router_address.clone(),
        }
    }

    /// The copy-buffer pool, shared with tests
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Director: final mutations before the request leaves the router.
    /// `X-Request-Start` is set only when absent, never overwritten.
    pub fn prepare_backend_request(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) {
        if !parts.headers.contains_key(headers::X_REQUEST_START) {
            let millis = chrono::Utc::now().timestamp_millis().to_string();
            if let Ok(value) = millis.parse() {
                parts.headers.insert(headers::X_REQUEST_START, value);
            }
        }

        // consumed by the lookup handler; backends never see it
        parts.headers.remove(headers::CF_APP_INSTANCE);

        // backends never see detour signatures; a request still carrying
        // them here is on its way to a backend, not a route service
        if !info.is_route_service_detour() {
            parts.headers.remove(headers::CF_PROXY_SIGNATURE);
            parts.headers.remove(headers::CF_PROXY_METADATA);
        }

        info.backend_req_headers = Some(parts.headers.clone());
    }

    /// The origin-form URI for a backend dispatch, preserving the raw
    /// request-target (`//`-prefixed paths included)
    pub fn origin_form_uri(raw_path_and_query: &str) -> http::Uri {
        http::Uri::builder()
            .path_and_query(raw_path_and_query)
            .build()
            .unwrap_or_else(|_| http::Uri::from_static("/"))
    }

    /// Response modifier: strips upstream hop-by-hop headers, echoes the
    /// request id, applies trace headers and sticky-session affinity.
    pub fn modify_response(
        &self,
        parts: &mut http::response::Parts,
        request_headers: &HeaderMap,
        info: &RequestInfo,
    ) {
        strip_hop_by_hop(&mut parts.headers);

        if let Ok(value) = info.request_id.parse() {
            parts.headers.insert(headers::VCAP_REQUEST_ID, value);
        }

        if !self.trace_key.is_empty() {
            let traced = request_headers
                .get(headers::VCAP_TRACE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v == self.trace_key)
                .unwrap_or(false);
            if traced {
                if let Ok(value) = self.router_address.parse::<http::HeaderValue>() {
                    parts.headers.insert(headers::VCAP_ROUTER, value);
                }
                if let Some(endpoint) = &info.endpoint {
                    if let Ok(value) = endpoint.authority().parse::<http::HeaderValue>() {
                        parts.headers.insert(headers::VCAP_BACKEND, value.clone());
                        parts.headers.insert(headers::CF_ROUTE_ENDPOINT, value);
                    }
                }
            }
        }

        self.apply_sticky_affinity(parts, info);
    }

    /// When the app set one of its session cookies, pin the client to
    /// the endpoint that answered by appending the affinity cookie.
    fn apply_sticky_affinity(&self, parts: &mut http::response::Parts, info: &RequestInfo) {
        let Some(endpoint) = &info.endpoint else {
            return;
        };
        if endpoint.private_instance_id.is_empty() {
            return;
        }

        let mut app_cookie_secure = false;
        let mut matched = false;
        for value in parts.headers.get_all(http::header::SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let name = raw.split('=').next().unwrap_or("").trim();
            if self.sticky.cookie_names.iter().any(|c| c == name) {
                matched = true;
                if raw.to_ascii_lowercase().contains("secure") {
                    app_cookie_secure = true;
                }
            }
        }
        if !matched {
            return;
        }

        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly",
            headers::VCAP_ID_COOKIE,
            endpoint.private_instance_id
        );
        if self.sticky.secure_cookie || app_cookie_secure {
            cookie.push_str("; Secure");
        }
        if !self.sticky.same_site.is_empty() {
            cookie.push_str("; SameSite=");
            cookie.push_str(&self.sticky.same_site);
        }
        if let Ok(value) = cookie.parse() {
            parts.headers.append(http::header::SET_COOKIE, value);
        }
    }

    /// Stream the upstream body to the client through pooled buffers,
    /// flushing at the configured interval. Trailers are forwarded.
    pub fn relay<B>(&self, upstream: B) -> ProxyBody
    where
        B: http_body::Body<Data = Bytes, Error = hyper::Error> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(8);
        let pool = self.buffer_pool.clone();
        let flush_interval = self.flush_interval;
        tokio::spawn(async move {
            relay_loop(upstream, tx, pool, flush_interval).await;
        });
        ChannelBody { rx }.boxed()
    }
}

async fn relay_loop<B>(
    mut upstream: B,
    tx: mpsc::Sender<Result<Frame<Bytes>, RouterError>>,
    pool: Arc<BufferPool>,
    flush_interval: Duration,
) where
    B: http_body::Body<Data = Bytes, Error = hyper::Error> + Send + Unpin + 'static,
{
    let mut buf = pool.get();
    let threshold = buf.capacity().max(1);
    let mut flush_deadline: Option<tokio::time::Instant> = None;

    loop {
        let frame = if let Some(deadline) = flush_deadline {
            match tokio::time::timeout_at(deadline, upstream.frame()).await {
                Err(_) => {
                    if !flush(&mut buf, &tx).await {
                        return;
                    }
                    flush_deadline = None;
                    continue;
                }
                Ok(frame) => frame,
            }
        } else {
            upstream.frame().await
        };

        match frame {
            Some(Ok(frame)) => {
                if frame.is_data() {
                    let Ok(data) = frame.into_data() else { continue };
                    if buf.is_empty() && data.len() >= threshold {
                        // oversized chunk, no point copying it
                        if tx.send(Ok(Frame::data(data))).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    buf.extend_from_slice(&data);
                    if buf.len() >= threshold {
                        if !flush(&mut buf, &tx).await {
                            return;
                        }
                        flush_deadline = None;
                    } else if flush_deadline.is_none() {
                        flush_deadline = Some(tokio::time::Instant::now() + flush_interval);
                    }
                } else if let Ok(trailers) = frame.into_trailers() {
                    if !flush(&mut buf, &tx).await {
                        return;
                    }
                    if tx.send(Ok(Frame::trailers(trailers))).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                let _ = flush(&mut buf, &tx).await;
                let _ = tx.send(Err(RouterError::Upstream(e))).await;
                return;
            }
            None => {
                let _ = flush(&mut buf, &tx).await;
                return;
            }
        }
    }
}

async fn flush(
    buf: &mut PooledBuffer,
    tx: &mpsc::Sender<Result<Frame<Bytes>, RouterError>>,
) -> bool {
    if buf.is_empty() {
        return true;
    }
    let data = Bytes::copy_from_slice(buf);
    buf.clear();
    tx.send(Ok(Frame::data(data))).await.is_ok()
}

/// Body backed by the relay channel
struct ChannelBody {
    rx: mpsc::Receiver<Result<Frame<Bytes>, RouterError>>,
}

impl http_body::Body for ChannelBody {
    type Data = Bytes;
    type Error = RouterError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, RouterError>>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Body fed by an already-running stream task; used for route service
/// responses whose underlying stream cannot be boxed directly
pub fn channel_body<S>(stream: S) -> ProxyBody
where
    S: futures_util::Stream<Item = Result<Frame<Bytes>, RouterError>> + Send + 'static,
{
    use futures_util::StreamExt;
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        while let Some(item) = stream.next().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    ChannelBody { rx }.boxed()
}

/// Completion hook fired with the number of body bytes written
pub type Finisher = Box<dyn FnOnce(u64) + Send + Sync>;

/// Wraps the terminal response body, counting bytes and firing the
/// completion hook exactly once after the last frame, or on drop when the
/// client disconnects mid-body.
pub struct CountingBody {
    inner: ProxyBody,
    bytes: u64,
    finisher: Option<Finisher>,
}

impl CountingBody {
    pub fn new(inner: ProxyBody, finisher: Finisher) -> Self {
        Self {
            inner,
            bytes: 0,
            finisher: Some(finisher),
        }
    }

    /// Convenience: wrap the body of a response in place
    pub fn wrap(response: http::Response<ProxyBody>, finisher: Finisher) -> http::Response<ProxyBody> {
        let (parts, body) = response.into_parts();
        http::Response::from_parts(parts, Self::new(body, finisher).boxed())
    }

    fn finish(&mut self) {
        if let Some(finisher) = self.finisher.take() {
            finisher(self.bytes);
        }
    }
}

impl http_body::Body for CountingBody {
    type Data = Bytes;
    type Error = RouterError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, RouterError>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::request;
    use crate::handlers::full_body;
    use crate::registry::Endpoint;
    use http_body_util::Full;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    fn engine() -> Engine {
        Engine::new(&RouterConfig::default())
    }

    fn engine_with(config: RouterConfig) -> Engine {
        Engine::new(&config)
    }

    // --- director ---

    #[tokio::test]
    async fn test_director_sets_x_request_start_once() {
        let e = engine();
        let (mut parts, mut info) = request("GET", "/x");
        e.prepare_backend_request(&mut parts, &mut info);
        let first = parts
            .headers
            .get(headers::X_REQUEST_START)
            .unwrap()
            .clone();

        // a second pass must not overwrite
        e.prepare_backend_request(&mut parts, &mut info);
        assert_eq!(parts.headers.get(headers::X_REQUEST_START).unwrap(), &first);
    }

    #[tokio::test]
    async fn test_director_preserves_existing_x_request_start() {
        let e = engine();
        let (mut parts, mut info) = request("GET", "/x");
        parts
            .headers
            .insert(headers::X_REQUEST_START, "1234".parse().unwrap());
        e.prepare_backend_request(&mut parts, &mut info);
        assert_eq!(parts.headers.get(headers::X_REQUEST_START).unwrap(), "1234");
    }

    #[tokio::test]
    async fn test_director_strips_instance_and_signature_headers() {
        let e = engine();
        let (mut parts, mut info) = request("GET", "/x");
        parts
            .headers
            .insert(headers::CF_APP_INSTANCE, "app:0".parse().unwrap());
        parts
            .headers
            .insert(headers::CF_PROXY_SIGNATURE, "sig".parse().unwrap());
        parts
            .headers
            .insert(headers::CF_PROXY_METADATA, "meta".parse().unwrap());
        e.prepare_backend_request(&mut parts, &mut info);
        assert!(parts.headers.get(headers::CF_APP_INSTANCE).is_none());
        assert!(parts.headers.get(headers::CF_PROXY_SIGNATURE).is_none());
        assert!(parts.headers.get(headers::CF_PROXY_METADATA).is_none());
        assert!(info.backend_req_headers.is_some());
    }

    #[tokio::test]
    async fn test_director_keeps_signature_for_detour() {
        let e = engine();
        let (mut parts, mut info) = request("GET", "/x");
        info.route_service_url = Some("https://rs.example.com".to_string());
        parts
            .headers
            .insert(headers::CF_PROXY_SIGNATURE, "sig".parse().unwrap());
        e.prepare_backend_request(&mut parts, &mut info);
        assert!(parts.headers.get(headers::CF_PROXY_SIGNATURE).is_some());
    }

    #[test]
    fn test_origin_form_uri_preserves_double_slash() {
        let uri = Engine::origin_form_uri("//tenant//files?x=1");
        assert_eq!(uri.path(), "//tenant//files");
        assert_eq!(uri.query(), Some("x=1"));
    }

    #[test]
    fn test_origin_form_uri_fallback() {
        let uri = Engine::origin_form_uri("not a uri");
        assert_eq!(uri.path(), "/");
    }

    // --- response modifier ---

    #[tokio::test]
    async fn test_modify_response_strips_hop_by_hop_and_sets_request_id() {
        let e = engine();
        let (_, mut info) = request("GET", "/x");
        info.request_id = "req-1234".to_string();

        let (mut parts, _) = http::Response::builder()
            .header("transfer-encoding", "chunked")
            .header("connection", "keep-alive")
            .header("content-type", "text/plain")
            .body(())
            .unwrap()
            .into_parts();
        e.modify_response(&mut parts, &HeaderMap::new(), &info);

        assert!(parts.headers.get("transfer-encoding").is_none());
        assert!(parts.headers.get("connection").is_none());
        assert_eq!(parts.headers.get(headers::VCAP_REQUEST_ID).unwrap(), "req-1234");
        assert!(parts.headers.get("content-type").is_some());
    }

    #[tokio::test]
    async fn test_trace_headers_require_matching_key() {
        let mut config = RouterConfig::default();
        config.trace_key = "trace-me".to_string();
        config.router_address = "10.255.0.1".to_string();
        let e = engine_with(config);

        let (_, mut info) = request("GET", "/x");
        let mut endpoint = Endpoint::new("10.0.1.5", 61001);
        endpoint.private_instance_id = "inst".to_string();
        info.endpoint = Some(Arc::new(endpoint));

        // wrong key: nothing added
        let mut request_headers = HeaderMap::new();
        request_headers.insert(headers::VCAP_TRACE, "wrong".parse().unwrap());
        let (mut parts, _) = http::Response::builder().body(()).unwrap().into_parts();
        e.modify_response(&mut parts, &request_headers, &info);
        assert!(parts.headers.get(headers::VCAP_ROUTER).is_none());

        // right key: router + backend headers
        request_headers.insert(headers::VCAP_TRACE, "trace-me".parse().unwrap());
        let (mut parts, _) = http::Response::builder().body(()).unwrap().into_parts();
        e.modify_response(&mut parts, &request_headers, &info);
        assert_eq!(parts.headers.get(headers::VCAP_ROUTER).unwrap(), "10.255.0.1");
        assert_eq!(parts.headers.get(headers::VCAP_BACKEND).unwrap(), "10.0.1.5:61001");
        assert_eq!(
            parts.headers.get(headers::CF_ROUTE_ENDPOINT).unwrap(),
            "10.0.1.5:61001"
        );
    }

    #[tokio::test]
    async fn test_sticky_affinity_cookie_appended() {
        let e = engine();
        let (_, mut info) = request("GET", "/x");
        let mut endpoint = Endpoint::new("10.0.1.5", 61001);
        endpoint.private_instance_id = "instance-77".to_string();
        info.endpoint = Some(Arc::new(endpoint));

        let (mut parts, _) = http::Response::builder()
            .header(http::header::SET_COOKIE, "JSESSIONID=abc; Path=/; Secure")
            .body(())
            .unwrap()
            .into_parts();
        e.modify_response(&mut parts, &HeaderMap::new(), &info);

        let cookies: Vec<&str> = parts
            .headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        assert_eq!(cookies.len(), 2);
        let affinity = cookies
            .iter()
            .find(|c| c.starts_with(headers::VCAP_ID_COOKIE))
            .unwrap();
        assert!(affinity.contains("instance-77"));
        assert!(affinity.contains("HttpOnly"));
        // app cookie was Secure, so the affinity cookie follows
        assert!(affinity.contains("Secure"));
    }

    #[tokio::test]
    async fn test_no_sticky_cookie_without_app_session() {
        let e = engine();
        let (_, mut info) = request("GET", "/x");
        let mut endpoint = Endpoint::new("10.0.1.5", 61001);
        endpoint.private_instance_id = "instance-77".to_string();
        info.endpoint = Some(Arc::new(endpoint));

        let (mut parts, _) = http::Response::builder()
            .header(http::header::SET_COOKIE, "other=1")
            .body(())
            .unwrap()
            .into_parts();
        e.modify_response(&mut parts, &HeaderMap::new(), &info);
        assert_eq!(parts.headers.get_all(http::header::SET_COOKIE).iter().count(), 1);
    }

    // --- relay ---

    #[tokio::test]
    async fn test_relay_passes_data_through() {
        let e = engine();
        let upstream = Full::new(Bytes::from_static(b"hello world"))
            .map_err(|never: std::convert::Infallible| match never {});
        let boxed: crate::proxy::transport::OutBody = upstream.boxed_unsync();
        let mut body = e.relay(BodyShim(boxed));
        let mut collected = Vec::new();
        while let Some(frame) = body.frame().await {
            let frame = frame.unwrap();
            if let Some(data) = frame.data_ref() {
                collected.extend_from_slice(data);
            }
        }
        assert_eq!(collected, b"hello world");
    }

    /// Adapts an OutBody (hyper::Error) for relay tests
    struct BodyShim(crate::proxy::transport::OutBody);

    impl http_body::Body for BodyShim {
        type Data = Bytes;
        type Error = hyper::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
            Pin::new(&mut self.get_mut().0).poll_frame(cx)
        }
    }

    // --- counting body ---

    #[tokio::test]
    async fn test_counting_body_reports_bytes_on_completion() {
        let counted = Arc::new(AtomicU64::new(u64::MAX));
        let counted_clone = counted.clone();
        let body = CountingBody::new(
            full_body("twelve bytes"),
            Box::new(move |bytes| counted_clone.store(bytes, Ordering::SeqCst)),
        );
        let mut body = body.boxed();
        while let Some(frame) = body.frame().await {
            frame.unwrap();
        }
        assert_eq!(counted.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_counting_body_fires_once_on_drop() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        let body = CountingBody::new(
            full_body("abandoned"),
            Box::new(move |bytes| fired_clone.lock().unwrap().push(bytes)),
        );
        drop(body);
        let calls = fired.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], 0);
    }

    #[tokio::test]
    async fn test_counting_body_wrap_preserves_parts() {
        let response = http::Response::builder()
            .status(http::StatusCode::CREATED)
            .body(full_body("x"))
            .unwrap();
        let wrapped = CountingBody::wrap(response, Box::new(|_| {}));
        assert_eq!(wrapped.status(), http::StatusCode::CREATED);
    }
}
