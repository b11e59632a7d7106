//! Token bucket.
//!
//! A bucket holds up to `capacity` tokens and refills continuously at
//! `rate` tokens per second. Each verdict tries to consume one token.
//! New buckets start full, so a fresh identifier can burst up to
//! `capacity` on first contact. Token counts are real-valued internally;
//! denied requests still persist the refill accounting so time is never
//! credited twice.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{storage_key, Decision, RateLimitAlgorithm};
use crate::clock::Clock;
use crate::context::Context;
use crate::error::{RateLimitError, Result};
use crate::local::StateTable;
use crate::memcached::{AddOutcome, CasOutcome, SharedMemcachedStore};
use crate::redis::RedisBackend;

/// Key TTL that keeps an idle bucket alive long enough to matter: twice
/// the time a drained bucket takes to refill completely.
pub(crate) fn bucket_ttl(capacity: u64, rate: f64) -> Duration {
    Duration::from_secs_f64((capacity as f64 / rate * 2.0).max(1.0))
}

struct BucketState {
    tokens: f64,
    last_refill_ms: u64,
}

/// In-memory token bucket.
pub struct TokenBucketLocal {
    policy_key: String,
    rate: f64,
    capacity: u64,
    clock: Arc<dyn Clock>,
    buckets: StateTable<BucketState>,
}

impl TokenBucketLocal {
    pub fn new(policy_key: impl Into<String>, rate: f64, capacity: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy_key: policy_key.into(),
            rate,
            capacity,
            clock,
            buckets: StateTable::new(),
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketLocal {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        ctx.ensure_active()?;
        let now = self.clock.now_millis();
        let rate = self.rate;
        let capacity = self.capacity as f64;

        self.buckets.with_entry(
            identifier,
            now,
            || BucketState { tokens: self.capacity as f64, last_refill_ms: now },
            |state| {
                let elapsed_ms = now.saturating_sub(state.last_refill_ms);
                state.tokens = (state.tokens + elapsed_ms as f64 / 1000.0 * rate).min(capacity);
                state.last_refill_ms = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    Decision::allowed().with_remaining(state.tokens.floor() as u64)
                } else {
                    debug!(policy_key = %self.policy_key, identifier, tokens = state.tokens, "token bucket empty");
                    let wait = (1.0 - state.tokens) / rate;
                    Decision::denied()
                        .with_remaining(0)
                        .with_retry_after(Duration::from_secs_f64(wait))
                }
            },
        )
    }

    fn sweep_idle(&self, max_idle: Duration) -> usize {
        self.buckets.purge_idle(max_idle, self.clock.now_millis())
    }
}

/// Hash fields: `tokens` (real-valued), `last_refill_time` (ms). State is
/// written on every verdict, allowed or denied, so refill accounting
/// always advances with the clock.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local ttl = math.ceil(capacity / rate * 2)
if ttl < 1 then ttl = 1 end

local state = redis.call('HMGET', key, 'tokens', 'last_refill_time')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])

if tokens == nil then
    tokens = capacity
    last_refill = now_ms
else
    local elapsed_ms = now_ms - last_refill
    if elapsed_ms < 0 then elapsed_ms = 0 end
    tokens = tokens + elapsed_ms / 1000 * rate
    if tokens > capacity then tokens = capacity end
    last_refill = now_ms
end

local allowed = 0
if tokens >= requested then
    allowed = 1
    tokens = tokens - requested
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill_time', last_refill)
redis.call('EXPIRE', key, ttl)

return {allowed, math.floor(tokens)}
"#;

/// Redis token bucket.
pub struct TokenBucketRedis {
    policy_key: String,
    rate: f64,
    capacity: u64,
    backend: RedisBackend,
    script: redis::Script,
    clock: Arc<dyn Clock>,
}

impl TokenBucketRedis {
    pub fn new(
        policy_key: impl Into<String>,
        rate: f64,
        capacity: u64,
        backend: RedisBackend,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy_key: policy_key.into(),
            rate,
            capacity,
            backend,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
            clock,
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketRedis {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        let key = storage_key(&self.policy_key, identifier);
        let now_ms = self.clock.now_millis();

        let mut invocation = self.script.key(&key);
        invocation.arg(self.capacity).arg(self.rate).arg(now_ms).arg(1u64);
        let (allowed, remaining): (i64, u64) = self.backend.eval(ctx, &invocation).await?;

        match allowed {
            1 => Ok(Decision::allowed().with_remaining(remaining)),
            0 => Ok(Decision::denied().with_remaining(remaining)),
            other => Err(RateLimitError::Internal(format!(
                "token bucket script returned unexpected verdict {}",
                other
            ))),
        }
    }
}

/// Stored bucket shape: `{"tokens": n, "last_refill": "<RFC3339>"}`.
#[derive(Debug, Serialize, Deserialize)]
struct StoredBucket {
    tokens: f64,
    #[serde(with = "humantime_serde")]
    last_refill: SystemTime,
}

/// Memcached token bucket.
///
/// The whole read-refill-consume-write cycle is committed with a single
/// CAS (or `add` for a fresh bucket). A lost race surfaces as
/// `BackendContention`; only the sliding-log path retries internally.
pub struct TokenBucketMemcached {
    policy_key: String,
    rate: f64,
    capacity: u64,
    store: SharedMemcachedStore,
    clock: Arc<dyn Clock>,
}

impl TokenBucketMemcached {
    pub fn new(
        policy_key: impl Into<String>,
        rate: f64,
        capacity: u64,
        store: SharedMemcachedStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { policy_key: policy_key.into(), rate, capacity, store, clock }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketMemcached {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        let key = storage_key(&self.policy_key, identifier);
        let now = self.clock.now();
        let rate = self.rate;
        let capacity = self.capacity as f64;
        let ttl = bucket_ttl(self.capacity, self.rate);
        let store = self.store.clone();

        crate::memcached::run_blocking(ctx, move || {
            let current = store.get(&key)?;
            let (mut bucket, token) = match current {
                None => (StoredBucket { tokens: capacity, last_refill: now }, None),
                Some(value) => {
                    let bucket: StoredBucket = serde_json::from_slice(&value.bytes)?;
                    (bucket, Some(value.token))
                }
            };

            let elapsed = now.duration_since(bucket.last_refill).unwrap_or_default();
            bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * rate).min(capacity);
            bucket.last_refill = now;

            let decision = if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                Decision::allowed().with_remaining(bucket.tokens.floor() as u64)
            } else {
                let wait = (1.0 - bucket.tokens) / rate;
                Decision::denied()
                    .with_remaining(0)
                    .with_retry_after(Duration::from_secs_f64(wait))
            };

            // Persist on both paths: denial still advances last_refill.
            let bytes = serde_json::to_vec(&bucket)?;
            match token {
                None => match store.add(&key, &bytes, ttl)? {
                    AddOutcome::Stored => Ok(decision),
                    AddOutcome::AlreadyExists => Err(RateLimitError::BackendContention { attempts: 1 }),
                },
                Some(token) => match store.cas(&key, &bytes, ttl, token)? {
                    CasOutcome::Stored => Ok(decision),
                    CasOutcome::Conflict | CasOutcome::Missing => {
                        Err(RateLimitError::BackendContention { attempts: 1 })
                    }
                },
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memcached::testing::MockMemcached;
    use std::sync::atomic::Ordering;

    fn local(rate: f64, capacity: u64) -> (TokenBucketLocal, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = TokenBucketLocal::new("api", rate, capacity, clock.clone());
        (limiter, clock)
    }

    #[tokio::test]
    async fn burst_then_refill() {
        // Mirrors the worked example: rate 1/s, capacity 2.
        let (limiter, clock) = local(1.0, 2);
        let ctx = Context::background();

        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());

        clock.advance(Duration::from_millis(100));
        let denied = limiter.check(&ctx, "u1").await.unwrap();
        assert!(!denied.is_allowed());

        clock.advance(Duration::from_millis(900));
        // t=1s: exactly one token has accrued since the drain.
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());

        clock.advance(Duration::from_secs(2));
        // t=3s: bucket refilled to capacity.
        let decision = limiter.check(&ctx, "u1").await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining, Some(1));
    }

    #[tokio::test]
    async fn new_bucket_starts_full() {
        let (limiter, _clock) = local(0.5, 3);
        let ctx = Context::background();

        for _ in 0..3 {
            assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        }
        assert!(!limiter.check(&ctx, "u1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn denied_requests_advance_refill_accounting() {
        let (limiter, clock) = local(1.0, 1);
        let ctx = Context::background();

        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());

        // Two denied probes 400ms apart: the fractional accruals must add
        // up rather than reset, so a token is ready at t=1s.
        clock.advance(Duration::from_millis(400));
        assert!(!limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        clock.advance(Duration::from_millis(400));
        assert!(!limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        clock.advance(Duration::from_millis(200));
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn refill_clamps_at_capacity() {
        let (limiter, clock) = local(10.0, 2);
        let ctx = Context::background();

        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());

        clock.advance(Duration::from_secs(3600));
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        assert!(!limiter.check(&ctx, "u1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn denial_reports_time_until_next_token() {
        let (limiter, _clock) = local(2.0, 1);
        let ctx = Context::background();

        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        let denied = limiter.check(&ctx, "u1").await.unwrap();
        assert!(!denied.is_allowed());
        // One token at 2/s is 500ms away.
        assert_eq!(denied.retry_after, Some(Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn memcached_bucket_round_trips_state() {
        let mock = MockMemcached::shared();
        let clock = Arc::new(ManualClock::new());
        let limiter = TokenBucketMemcached::new("api", 1.0, 2, mock.clone(), clock.clone());
        let ctx = Context::background();

        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        assert!(!limiter.check(&ctx, "u1").await.unwrap().is_allowed());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        // TTL is 2 * capacity / rate = 4s.
        assert_eq!(mock.ttl_of("api:u1"), Some(Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn memcached_bucket_reports_conflict_without_retrying() {
        let mock = MockMemcached::shared();
        let clock = Arc::new(ManualClock::new());
        let limiter = TokenBucketMemcached::new("api", 1.0, 2, mock.clone(), clock);
        let ctx = Context::background();

        assert!(limiter.check(&ctx, "u1").await.unwrap().is_allowed());
        mock.force_cas_conflicts.store(1, Ordering::Relaxed);

        let err = limiter.check(&ctx, "u1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::BackendContention { attempts: 1 }));
    }

    #[test]
    fn ttl_scales_with_drain_time() {
        assert_eq!(bucket_ttl(10, 1.0), Duration::from_secs(20));
        assert_eq!(bucket_ttl(1, 4.0), Duration::from_secs(1));
    }
}
