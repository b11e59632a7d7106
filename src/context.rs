//! Cancellation and deadline propagation for verdict calls.
//!
//! Every [`decide`](crate::limiter::LimiterHandle::decide) call takes a
//! [`Context`]. A context that is already cancelled (or past its deadline)
//! fails the call with [`RateLimitError::Cancelled`] before the backend is
//! contacted and before any state changes. The remaining deadline budget is
//! applied as a timeout on in-flight remote calls; if it expires while a
//! call is in flight the result is reported as `BackendUnavailable`, since
//! the server-side update may or may not have committed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{RateLimitError, Result};

/// Carries cancellation and an optional deadline across a verdict call.
///
/// Contexts are cheap to clone; clones share the same cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context with an absolute deadline.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self { cancelled: None, deadline: Some(deadline) }
    }

    /// A cancellable context plus the handle that cancels it.
    pub fn cancellable() -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Self { cancelled: Some(flag.clone()), deadline: None };
        (ctx, CancelHandle { flag })
    }

    /// Attach a deadline to this context, keeping its cancellation flag.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// True once the context has been cancelled or its deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        if let Some(flag) = &self.cancelled {
            if flag.load(Ordering::Relaxed) {
                return true;
            }
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Time left until the deadline, if one is set.
    ///
    /// Returns `Some(Duration::ZERO)` for an already-expired deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails with [`RateLimitError::Cancelled`] if the context is done.
    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(RateLimitError::Cancelled);
        }
        Ok(())
    }
}

/// Cancels the [`Context`] it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Cancel the associated context. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}
