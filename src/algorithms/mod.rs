//! Rate limiting algorithms.
//!
//! Each algorithm comes in three flavors, one per storage backend; every
//! `(algorithm, backend)` pair is its own concrete type behind the
//! [`RateLimitAlgorithm`] trait, selected once at handle construction.
//! The dispatch cost is one indirect call per verdict.

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;

/// The boolean outcome of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied,
}

impl Verdict {
    pub fn is_allowed(self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allowed => f.write_str("allowed"),
            Verdict::Denied => f.write_str("denied"),
        }
    }
}

/// A verdict plus advisory diagnostics.
///
/// `remaining` and `retry_after` are best-effort hints (integer-rounded
/// where the underlying state is fractional); correctness rests on
/// `verdict` alone.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub verdict: Verdict,
    /// Units still available after this verdict, where the algorithm can
    /// tell cheaply.
    pub remaining: Option<u64>,
    /// Earliest delay after which a retry could plausibly succeed.
    pub retry_after: Option<Duration>,
}

impl Decision {
    pub fn allowed() -> Self {
        Self { verdict: Verdict::Allowed, remaining: None, retry_after: None }
    }

    pub fn denied() -> Self {
        Self { verdict: Verdict::Denied, remaining: None, retry_after: None }
    }

    pub fn with_remaining(mut self, remaining: u64) -> Self {
        self.remaining = Some(remaining);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict.is_allowed()
    }
}

/// A configured decision routine for one policy on one backend.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    /// Decide whether the request identified by `identifier` is admitted
    /// now. Exactly one state-mutating backend operation on the allowed
    /// path; at most one on the denied path.
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision>;

    /// Drop local state untouched for longer than `max_idle`. Remote
    /// backends expire state via TTLs and return 0 here.
    fn sweep_idle(&self, max_idle: Duration) -> usize {
        let _ = max_idle;
        0
    }
}

/// Backend key for an identifier under a policy.
pub(crate) fn storage_key(policy_key: &str, identifier: &str) -> String {
    format!("{}:{}", policy_key, identifier)
}
