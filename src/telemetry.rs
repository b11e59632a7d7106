//! Verdict telemetry hook.
//!
//! A [`TelemetrySink`] observes every verdict a handle produces. Sinks are
//! advisory: they must not block, and nothing a sink does (or fails to do)
//! can change a verdict. Identifiers are hashed before they reach a sink so
//! raw user tokens never leave the decision path.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::algorithms::Verdict;
use crate::config::Algorithm;

/// Receives one event per verdict.
pub trait TelemetrySink: Send + Sync {
    /// Record a verdict. Implementations must return promptly; dropping
    /// the event is always acceptable.
    fn record(&self, policy_key: &str, algorithm: Algorithm, verdict: Verdict, identifier_hash: u64);
}

/// Hash an identifier for telemetry purposes.
pub(crate) fn hash_identifier(identifier: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    identifier.hash(&mut hasher);
    hasher.finish()
}

/// A sink that discards every event. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _policy_key: &str, _algorithm: Algorithm, _verdict: Verdict, _identifier_hash: u64) {}
}

/// A sink keeping running totals with atomic counters.
#[derive(Debug, Default)]
pub struct CounterTelemetry {
    total: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl CounterTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total verdicts recorded.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Verdicts that allowed the request.
    pub fn allowed(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    /// Verdicts that denied the request.
    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for CounterTelemetry {
    fn record(&self, _policy_key: &str, _algorithm: Algorithm, verdict: Verdict, _identifier_hash: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match verdict {
            Verdict::Allowed => self.allowed.fetch_add(1, Ordering::Relaxed),
            Verdict::Denied => self.denied.fetch_add(1, Ordering::Relaxed),
        };
    }
}
