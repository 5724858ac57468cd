//! Observability — access log entries and proxy counters

pub mod access_log;
pub mod metrics;

pub use access_log::{AccessLogEntry, AccessLogger, AttemptDetail};
pub use metrics::{MetricsSnapshot, ProxyReporter};
