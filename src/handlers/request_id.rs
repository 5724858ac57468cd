//! Request id handler — X-Vcap-Request-Id

use crate::error::Result;
use crate::handlers::{Handler, ProxyBody, RequestInfo};
use crate::headers;
use async_trait::async_trait;
use http::Response;

/// Stamps every request with a fresh `X-Vcap-Request-Id`. Any inbound
/// value is replaced; clients cannot choose their own id. The same id is
/// echoed on the response by the proxy engine.
pub struct RequestIdHandler;

#[async_trait]
impl Handler for RequestIdHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        let id = uuid::Uuid::new_v4().to_string();
        if let Ok(value) = id.parse() {
            parts.headers.insert(headers::VCAP_REQUEST_ID, value);
        }
        info.request_id = id;
        Ok(None)
    }

    fn name(&self) -> &str {
        "vcap-request-id"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::request;

    #[tokio::test]
    async fn test_sets_request_id() {
        let h = RequestIdHandler;
        let (mut parts, mut info) = request("GET", "/");
        h.handle(&mut parts, &mut info).await.unwrap();
        let header = parts
            .headers
            .get(headers::VCAP_REQUEST_ID)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(header, info.request_id);
        assert_eq!(header.len(), 36);
    }

    #[tokio::test]
    async fn test_replaces_inbound_id() {
        let h = RequestIdHandler;
        let (mut parts, mut info) = request("GET", "/");
        parts
            .headers
            .insert(headers::VCAP_REQUEST_ID, "client-chosen".parse().unwrap());
        h.handle(&mut parts, &mut info).await.unwrap();
        assert_ne!(
            parts.headers.get(headers::VCAP_REQUEST_ID).unwrap(),
            "client-chosen"
        );
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let h = RequestIdHandler;
        let (mut parts_a, mut info_a) = request("GET", "/");
        let (mut parts_b, mut info_b) = request("GET", "/");
        h.handle(&mut parts_a, &mut info_a).await.unwrap();
        h.handle(&mut parts_b, &mut info_b).await.unwrap();
        assert_ne!(info_a.request_id, info_b.request_id);
    }
}
