//! Fixed window counter.
//!
//! Time is cut into adjacent intervals of `window` length; each allowed
//! request increments the current interval's counter and a request is
//! admitted iff the counter stays within `limit`. At a window boundary up
//! to `2 * limit` requests can land inside one sliding span of `window`;
//! that is the classic artefact of this algorithm, accepted by construction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{storage_key, Decision, RateLimitAlgorithm};
use crate::clock::Clock;
use crate::context::Context;
use crate::error::{RateLimitError, Result};
use crate::local::StateTable;
use crate::memcached::{AddOutcome, SharedMemcachedStore};
use crate::redis::RedisBackend;

/// In-memory fixed window counter.
///
/// Holds an explicit `window_end` per identifier. Denied requests do not
/// inflate the counter: the stored count never exceeds `limit`.
pub struct FixedWindowLocal {
    policy_key: String,
    window_ms: u64,
    limit: u64,
    clock: Arc<dyn Clock>,
    counters: StateTable<WindowState>,
}

struct WindowState {
    count: u64,
    window_end_ms: u64,
}

impl FixedWindowLocal {
    pub fn new(policy_key: impl Into<String>, window: Duration, limit: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy_key: policy_key.into(),
            window_ms: window.as_millis() as u64,
            limit,
            clock,
            counters: StateTable::new(),
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowLocal {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        ctx.ensure_active()?;
        let now = self.clock.now_millis();
        let window_ms = self.window_ms;
        let limit = self.limit;

        self.counters.with_entry(
            identifier,
            now,
            || WindowState { count: 0, window_end_ms: 0 },
            |state| {
                if now >= state.window_end_ms {
                    state.count = 0;
                    state.window_end_ms = now + window_ms;
                }
                if state.count < limit {
                    state.count += 1;
                    Decision::allowed().with_remaining(limit - state.count)
                } else {
                    debug!(policy_key = %self.policy_key, identifier, "fixed window limit reached");
                    Decision::denied()
                        .with_remaining(0)
                        .with_retry_after(Duration::from_millis(state.window_end_ms.saturating_sub(now)))
                }
            },
        )
    }

    fn sweep_idle(&self, max_idle: Duration) -> usize {
        self.counters.purge_idle(max_idle, self.clock.now_millis())
    }
}

/// Counts per window inside a hash, keyed by the window's start timestamp;
/// stale windows ride out the key's TTL instead of needing cleanup.
/// Over-limit requests still increment. The counter is bounded only by the
/// TTL, and the verdict only ever compares `count <= limit`.
const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local expiry_sec = tonumber(ARGV[4])

local window_start = math.floor(now_ms / window_ms) * window_ms
local field = tostring(window_start)

local count = redis.call('HINCRBY', key, field, 1)
if count == 1 then
    redis.call('EXPIRE', key, expiry_sec)
end

if count <= limit then
    return {1, limit - count}
else
    return {0, 0}
end
"#;

/// Redis fixed window counter.
///
/// The window boundary is derived from the client's clock inside the
/// script, so skew between clients costs at most one extra window.
pub struct FixedWindowRedis {
    policy_key: String,
    window: Duration,
    limit: u64,
    backend: RedisBackend,
    script: redis::Script,
    clock: Arc<dyn Clock>,
}

impl FixedWindowRedis {
    pub fn new(
        policy_key: impl Into<String>,
        window: Duration,
        limit: u64,
        backend: RedisBackend,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy_key: policy_key.into(),
            window,
            limit,
            backend,
            script: redis::Script::new(FIXED_WINDOW_SCRIPT),
            clock,
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowRedis {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        let key = storage_key(&self.policy_key, identifier);
        let now_ms = self.clock.now_millis();
        let window_ms = self.window.as_millis() as u64;
        // TTL must cover the whole window; round up, floor at one second.
        let expiry_sec = (self.window.as_secs_f64().ceil() as u64).max(1);

        let mut invocation = self.script.key(&key);
        invocation.arg(now_ms).arg(window_ms).arg(self.limit).arg(expiry_sec);
        let (allowed, remaining): (i64, u64) = self.backend.eval(ctx, &invocation).await?;

        match allowed {
            1 => Ok(Decision::allowed().with_remaining(remaining)),
            0 => Ok(Decision::denied().with_remaining(0)),
            other => Err(RateLimitError::Internal(format!(
                "fixed window script returned unexpected verdict {}",
                other
            ))),
        }
    }
}

/// Memcached fixed window counter.
///
/// `add` creates the counter with the window's TTL; later requests
/// `increment` it, which leaves the TTL untouched: the window is pinned
/// by whichever request created the key.
pub struct FixedWindowMemcached {
    policy_key: String,
    window: Duration,
    limit: u64,
    store: SharedMemcachedStore,
}

impl FixedWindowMemcached {
    pub fn new(
        policy_key: impl Into<String>,
        window: Duration,
        limit: u64,
        store: SharedMemcachedStore,
    ) -> Self {
        Self { policy_key: policy_key.into(), window, limit, store }
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowMemcached {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        let key = storage_key(&self.policy_key, identifier);
        let store = self.store.clone();
        let window = self.window;

        let count = crate::memcached::run_blocking(ctx, move || {
            match store.add(&key, b"1", window)? {
                AddOutcome::Stored => Ok(1),
                AddOutcome::AlreadyExists => store.increment(&key, 1),
            }
        })
        .await?;

        if count <= self.limit {
            Ok(Decision::allowed().with_remaining(self.limit - count))
        } else {
            debug!(policy_key = %self.policy_key, identifier, count, "fixed window limit reached");
            Ok(Decision::denied().with_remaining(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memcached::testing::MockMemcached;

    fn local(limit: u64, window: Duration) -> (FixedWindowLocal, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = FixedWindowLocal::new("api", window, limit, clock.clone());
        (limiter, clock)
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_denies() {
        let (limiter, clock) = local(3, Duration::from_secs(1));
        let ctx = Context::background();

        for _ in 0..3 {
            assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        }
        clock.advance(Duration::from_millis(100));
        let decision = limiter.check(&ctx, "u1").await.unwrap();
        assert!(!decision.is_allowed());
        assert_eq!(decision.remaining, Some(0));
        // Window opened at t=0, so 900ms remain.
        assert_eq!(decision.retry_after, Some(Duration::from_millis(900)));
    }

    #[tokio::test]
    async fn window_resets_after_duration() {
        let (limiter, clock) = local(3, Duration::from_secs(1));
        let ctx = Context::background();

        for _ in 0..3 {
            assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        }
        clock.advance(Duration::from_millis(1500));
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn denied_requests_do_not_consume_the_next_window() {
        let (limiter, clock) = local(2, Duration::from_secs(1));
        let ctx = Context::background();

        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        // A burst of denials must not carry into the next window.
        for _ in 0..10 {
            assert!(!limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        }
        clock.advance(Duration::from_secs(1));
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn identifiers_do_not_share_windows() {
        let (limiter, _clock) = local(1, Duration::from_secs(1));
        let ctx = Context::background();

        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        assert!(limiter.check(&ctx, "u2").await.unwrap().is_allowed());
        assert!(!limiter.check(&ctx, "u1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn sweep_drops_idle_identifiers() {
        let (limiter, clock) = local(3, Duration::from_secs(1));
        let ctx = Context::background();

        limiter.check(&ctx, "u1").await.unwrap();
        clock.advance(Duration::from_secs(120));
        limiter.check(&ctx, "u2").await.unwrap();

        assert_eq!(limiter.sweep_idle(Duration::from_secs(60)), 1);
    }

    #[tokio::test]
    async fn memcached_counter_pins_ttl_on_first_add() {
        let mock = MockMemcached::shared();
        let limiter =
            FixedWindowMemcached::new("api", Duration::from_secs(2), 2, mock.clone());
        let ctx = Context::background();

        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        assert_eq!(mock.ttl_of("api:u1"), Some(Duration::from_secs(2)));
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        let decision = limiter.check(&ctx, "u1").await.unwrap();
        assert!(!decision.is_allowed());
        // Remote counters keep incrementing past the limit.
        assert!(!limiter.check(&ctx, "u1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn memcached_failures_surface_as_errors() {
        let mock = MockMemcached::shared();
        mock.fail_writes.store(true, std::sync::atomic::Ordering::Relaxed);
        let limiter = FixedWindowMemcached::new("api", Duration::from_secs(1), 2, mock);
        let ctx = Context::background();

        let err = limiter.check(&ctx, "u1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn cancelled_context_skips_the_backend() {
        let mock = MockMemcached::shared();
        let limiter = FixedWindowMemcached::new("api", Duration::from_secs(1), 2, mock.clone());
        let (ctx, handle) = Context::cancellable();
        handle.cancel();

        let err = limiter.check(&ctx, "u1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Cancelled));
        assert!(!mock.contains("api:u1"));
    }
}
