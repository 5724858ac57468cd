//! Router health state — atomic Healthy/Degraded flag
//!
//! A panic or invariant violation in the request pipeline degrades the
//! router so the platform health checker can pull this instance out of
//! rotation. The state is read on every health probe.

use std::sync::atomic::{AtomicU8, Ordering};

/// Health state of this router instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Accepting and proxying traffic
    Healthy,
    /// A pipeline invariant was violated; the instance should be drained
    Degraded,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Shared health flag, safe for concurrent store/load
#[derive(Debug)]
pub struct Health {
    state: AtomicU8,
}

const HEALTHY: u8 = 0;
const DEGRADED: u8 = 1;

impl Health {
    /// Create a new health flag in the Healthy state
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(HEALTHY),
        }
    }

    /// Read the current state
    pub fn health(&self) -> HealthState {
        match self.state.load(Ordering::Relaxed) {
            HEALTHY => HealthState::Healthy,
            _ => HealthState::Degraded,
        }
    }

    /// Store a new state
    pub fn set_health(&self, state: HealthState) {
        let raw = match state {
            HealthState::Healthy => HEALTHY,
            HealthState::Degraded => DEGRADED,
        };
        self.state.store(raw, Ordering::Relaxed);
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}
