//! Centralized error types for the router core

use thiserror::Error;

/// Router error types
#[derive(Debug, Error)]
pub enum RouterError {
    /// Configuration file parsing or validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Per-request state was missing where the pipeline guarantees it.
    /// Indicates handler-chain misuse, not a client problem.
    #[error("Request info missing: {0}")]
    RequestInfoMissing(&'static str),

    /// No route matched the request host and path
    #[error("No route for {0}")]
    RouteNotFound(String),

    /// Route matched but the pool has no endpoints
    #[error("Pool for {0} has no endpoints")]
    PoolEmpty(String),

    /// Route service signature failed to validate
    #[error("Route service signature invalid: {0}")]
    RouteServiceSignature(String),

    /// The client went away mid-request; propagated so the server
    /// tears the connection down instead of answering
    #[error("Client canceled the request")]
    ClientCanceled,

    /// TLS configuration or handshake setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Upstream HTTP error surfaced through a body or connection
    #[error("Upstream HTTP error: {0}")]
    Upstream(#[from] hyper::Error),

    /// Route service HTTP error
    #[error("Route service error: {0}")]
    RouteService(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, RouterError>;
