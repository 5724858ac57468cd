//! Client certificate handler — X-Forwarded-Client-Cert policy

use crate::config::ForwardedClientCert;
use crate::error::Result;
use crate::handlers::{Handler, ProxyBody, RequestInfo};
use crate::headers;
use async_trait::async_trait;
use http::Response;
use std::sync::Arc;

/// Decides, per request, that sanitization must be skipped. Wired to the
/// route-service validator: a signed return over TLS proves the header
/// was set by a trusted hop.
pub type SkipSanitizePredicate =
    Arc<dyn Fn(&http::request::Parts, &RequestInfo) -> bool + Send + Sync>;

/// Applies the configured `X-Forwarded-Client-Cert` policy before the
/// request reaches the backend.
pub struct ClientCertHandler {
    policy: ForwardedClientCert,
    skip_sanitize: SkipSanitizePredicate,
}

impl ClientCertHandler {
    pub fn new(policy: ForwardedClientCert, skip_sanitize: SkipSanitizePredicate) -> Self {
        Self {
            policy,
            skip_sanitize,
        }
    }

    /// Predicate that never skips; for configurations without route services
    pub fn never_skip() -> SkipSanitizePredicate {
        Arc::new(|_, _| false)
    }
}

#[async_trait]
impl Handler for ClientCertHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        if (self.skip_sanitize)(parts, info) {
            return Ok(None);
        }

        match self.policy {
            ForwardedClientCert::AlwaysForward => {}
            ForwardedClientCert::Forward => {
                // only mTLS connections may carry the header through
                if !(info.client_tls && info.peer_cert_pem.is_some()) {
                    parts.headers.remove(headers::X_FORWARDED_CLIENT_CERT);
                }
            }
            ForwardedClientCert::SanitizeSet => {
                parts.headers.remove(headers::X_FORWARDED_CLIENT_CERT);
                if info.client_tls {
                    if let Some(pem) = &info.peer_cert_pem {
                        let sanitized: String =
                            pem.chars().filter(|c| !matches!(c, '\r' | '\n')).collect();
                        if let Ok(value) = sanitized.parse() {
                            parts
                                .headers
                                .insert(headers::X_FORWARDED_CLIENT_CERT, value);
                        }
                    }
                }
            }
            ForwardedClientCert::AlwaysSanitize => {
                parts.headers.remove(headers::X_FORWARDED_CLIENT_CERT);
            }
        }

        Ok(None)
    }

    fn name(&self) -> &str {
        "client-cert"
    }
}
