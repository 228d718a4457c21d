//! Readiness flags polled by the health endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// `ready` is set once the topology is built and the run started;
/// `shutting_down` once cleanup begins. Only ever read by health checks.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
}

/// Point-in-time copy of the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub ready: bool,
    pub shutting_down: bool,
}

impl HealthState {
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Ready and not shutting down.
    pub fn is_healthy(&self) -> bool {
        self.is_ready() && !self.is_shutting_down()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            ready: self.is_ready(),
            shutting_down: self.is_shutting_down(),
        }
    }
}
