//! Backend endpoint descriptor

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Application protocol spoken to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProtocol {
    Http1,
    Http2,
}

impl Default for BackendProtocol {
    fn default() -> Self {
        Self::Http1
    }
}

/// Identity under which a transport is cached and reused.
///
/// Two endpoints with the same address and TLS identity share one
/// transport; an endpoint that changes TLS identity gets a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportKey {
    /// "address:port" of the endpoint
    pub authority: String,
    /// Expected certificate name, when dialing TLS
    pub server_cert_domain_san: Option<String>,
    /// Whether the connection is TLS at all
    pub use_tls: bool,
}

impl std::fmt::Display for TransportKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.use_tls {
            write!(
                f,
                "tls://{}#{}",
                self.authority,
                self.server_cert_domain_san.as_deref().unwrap_or("")
            )
        } else {
            write!(f, "tcp://{}", self.authority)
        }
    }
}

/// One backend instance of an application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP or hostname the instance listens on
    pub address: String,
    /// Port the instance listens on
    pub port: u16,
    /// Owning application id
    pub app_id: String,
    /// Platform-private instance id, used for sticky affinity
    pub private_instance_id: String,
    /// Zero-based instance index within the application
    pub private_instance_index: u32,
    /// Free-form routing tags attached to log entries
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Dial the instance over TLS
    #[serde(default)]
    pub use_tls: bool,
    /// SAN the instance certificate must carry; also used as SNI
    #[serde(default)]
    pub server_cert_domain_san: Option<String>,
    /// Protocol spoken once connected
    #[serde(default)]
    pub protocol: BackendProtocol,
}

impl Endpoint {
    /// Shorthand constructor for a plaintext HTTP/1.1 endpoint
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            app_id: String::new(),
            private_instance_id: String::new(),
            private_instance_index: 0,
            tags: HashMap::new(),
            use_tls: false,
            server_cert_domain_san: None,
            protocol: BackendProtocol::Http1,
        }
    }

    /// "address:port" string used for dialing and logging
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// The transport cache identity for this endpoint
    pub fn transport_key(&self) -> TransportKey {
        TransportKey {
            authority: self.authority(),
            server_cert_domain_san: if self.use_tls {
                self.server_cert_domain_san.clone()
            } else {
                None
            },
            use_tls: self.use_tls,
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.transport_key() == other.transport_key()
    }
}

impl Eq for Endpoint {}
