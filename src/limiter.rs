//! The per-policy limiter handle.
//!
//! A [`LimiterHandle`] binds one policy's algorithm, backend, and
//! parameters behind a single verdict call. Handles are built by the
//! [`Registry`](crate::registry::Registry) and are cheap to share.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, trace};

use crate::algorithms::{Decision, RateLimitAlgorithm};
use crate::config::{Algorithm, Backend};
use crate::context::Context;
use crate::error::{RateLimitError, Result};
use crate::telemetry::{hash_identifier, TelemetrySink};

/// A configured, ready-to-use limiter for one policy.
pub struct LimiterHandle {
    policy_key: String,
    algorithm: Algorithm,
    backend: Backend,
    limiter: Arc<dyn RateLimitAlgorithm>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl LimiterHandle {
    pub(crate) fn new(
        policy_key: String,
        algorithm: Algorithm,
        backend: Backend,
        limiter: Arc<dyn RateLimitAlgorithm>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self { policy_key, algorithm, backend, limiter, telemetry }
    }

    /// The policy key this handle was built for.
    pub fn policy_key(&self) -> &str {
        &self.policy_key
    }

    /// The decision algorithm behind this handle.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The storage backend behind this handle.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Decide whether the request identified by `identifier` is admitted
    /// now.
    ///
    /// Backend faults are returned, never converted into a verdict:
    /// treating `BackendUnavailable` as allow or deny is the caller's
    /// policy. A context that is already cancelled fails with `Cancelled`
    /// before the backend is contacted and before any state changes.
    pub async fn decide(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        ctx.ensure_active()?;
        if identifier.is_empty() {
            return Err(RateLimitError::Internal("identifier must be non-empty".into()));
        }

        match self.limiter.check(ctx, identifier).await {
            Ok(decision) => {
                self.telemetry.record(
                    &self.policy_key,
                    self.algorithm,
                    decision.verdict,
                    hash_identifier(identifier),
                );
                trace!(
                    policy_key = %self.policy_key,
                    algorithm = %self.algorithm,
                    backend = %self.backend,
                    identifier,
                    verdict = %decision.verdict,
                    "verdict"
                );
                Ok(decision)
            }
            Err(err) => {
                if !matches!(err, RateLimitError::Cancelled) {
                    error!(
                        policy_key = %self.policy_key,
                        algorithm = %self.algorithm,
                        backend = %self.backend,
                        identifier,
                        error = %err,
                        "rate limit check failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Drop local per-identifier state untouched for longer than
    /// `max_idle`. No-op for remote backends.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        self.limiter.sweep_idle(max_idle)
    }
}

impl std::fmt::Debug for LimiterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterHandle")
            .field("policy_key", &self.policy_key)
            .field("algorithm", &self.algorithm)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::fixed_window::FixedWindowLocal;
    use crate::clock::ManualClock;
    use crate::telemetry::CounterTelemetry;
    use std::time::Duration;

    fn handle(telemetry: Arc<CounterTelemetry>) -> LimiterHandle {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(FixedWindowLocal::new("api", Duration::from_secs(1), 2, clock));
        LimiterHandle::new(
            "api".into(),
            Algorithm::FixedWindow,
            Backend::InMemory,
            limiter,
            telemetry,
        )
    }

    #[tokio::test]
    async fn records_telemetry_per_verdict() {
        let telemetry = Arc::new(CounterTelemetry::new());
        let handle = handle(telemetry.clone());
        let ctx = Context::background();

        assert!(handle.decide(&ctx, "u1").await.unwrap().is_allowed());
        assert!(handle.decide(&ctx, "u1").await.unwrap().is_allowed());
        assert!(!handle.decide(&ctx, "u1").await.unwrap().is_allowed());

        assert_eq!(telemetry.total(), 3);
        assert_eq!(telemetry.allowed(), 2);
        assert_eq!(telemetry.denied(), 1);
    }

    #[tokio::test]
    async fn pre_cancelled_context_fails_without_mutating_state() {
        let telemetry = Arc::new(CounterTelemetry::new());
        let handle = handle(telemetry.clone());
        let (ctx, cancel) = Context::cancellable();
        cancel.cancel();

        let err = handle.decide(&ctx, "u1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Cancelled));
        assert_eq!(telemetry.total(), 0);

        // The budget is untouched: both slots are still available.
        let ctx = Context::background();
        assert!(handle.decide(&ctx, "u1").await.unwrap().is_allowed());
        assert!(handle.decide(&ctx, "u1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn empty_identifier_is_rejected() {
        let handle = handle(Arc::new(CounterTelemetry::new()));
        let ctx = Context::background();
        let err = handle.decide(&ctx, "").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Internal(_)));
    }
}
