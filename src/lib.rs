//! # Trellis Router
//!
//! A layer-7 HTTP/HTTPS reverse proxy for multi-tenant application
//! platforms. Requests are matched to a pool of backend instances by
//! host and path, forwarded to a chosen endpoint (optionally through an
//! external route service), and streamed back to the client.
//!
//! ## Architecture
//!
//! ```text
//! Listener → Handler Chain → Route Service Detour → Round Tripper → Backend
//! ```
//!
//! ## Core pieces
//!
//! - **Handler chain**: panic guard, trace/id normalisation, health
//!   probes, protocol gate, route lookup, header policies — applied in a
//!   fixed order to every request
//! - **Round tripper**: endpoint selection with retries, sticky
//!   sessions, failure classification and a closed error table
//! - **Transport factory**: cached backend connections keyed by address
//!   and TLS identity, evicted when endpoints leave the registry
//! - **Route services**: signed redirect-and-return detours through
//!   external request filters
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use trellis_router::{config::RouterConfig, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> trellis_router::Result<()> {
//!     let config = RouterConfig::from_file("router.toml").await?;
//!     let server = Server::new(config)?;
//!     let (handles, _addrs) = server.run().await?;
//!     for handle in handles {
//!         let _ = handle.await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod headers;
pub mod health;
pub mod observability;
pub mod proxy;
pub mod registry;
pub mod routeservice;
pub mod server;

pub use error::{Result, RouterError};
pub use health::{Health, HealthState};
pub use server::Server;
