//! Health probe handler — short-circuits platform liveness pings

use crate::error::Result;
use crate::handlers::{full_body, Handler, ProxyBody, RequestInfo};
use crate::health::{Health, HealthState};
use async_trait::async_trait;
use http::{Response, StatusCode};
use std::sync::Arc;

/// Detects the platform health checker by User-Agent and answers without
/// touching the routing core. Probe responses always close the connection
/// so the checker measures a fresh accept each time.
pub struct HealthcheckHandler {
    user_agent: String,
    health: Arc<Health>,
}

impl HealthcheckHandler {
    pub fn new(user_agent: impl Into<String>, health: Arc<Health>) -> Self {
        Self {
            user_agent: user_agent.into(),
            health,
        }
    }
}

#[async_trait]
impl Handler for HealthcheckHandler {
    async fn handle(
        &self,
        parts: &mut http::request::Parts,
        info: &mut RequestInfo,
    ) -> Result<Option<Response<ProxyBody>>> {
        let is_probe = parts
            .headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|ua| ua == self.user_agent)
            .unwrap_or(false);
        if !is_probe {
            return Ok(None);
        }

        info.is_health_probe = true;
        info.close_connection = true;

        let builder = Response::builder()
            .header(http::header::CACHE_CONTROL, "private, max-age=0")
            .header(http::header::EXPIRES, "0")
            .header(http::header::CONNECTION, "close");

        let response = if self.health.health() == HealthState::Healthy {
            builder
                .status(StatusCode::OK)
                .body(full_body("ok\n"))
                .unwrap()
        } else {
            builder
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(full_body(""))
                .unwrap()
        };
        Ok(Some(response))
    }

    fn name(&self) -> &str {
        "healthcheck"
    }
}
