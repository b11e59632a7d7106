//! Leaky bucket.
//!
//! The dual of the token bucket: each admitted request pours one unit into
//! the bucket and the bucket drains at `rate` units per second. A request
//! is admitted iff, after drain accounting, the post-admit level fits
//! within `capacity`. New buckets start empty. The drain accounting is
//! persisted on every verdict; a denial leaves the level itself unchanged.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Decision, RateLimitAlgorithm};
use crate::clock::Clock;
use crate::context::Context;
use crate::error::{RateLimitError, Result};
use crate::local::StateTable;
use crate::memcached::{AddOutcome, CasOutcome, SharedMemcachedStore};
use crate::redis::RedisBackend;

use super::token_bucket::bucket_ttl;

struct LevelState {
    level: f64,
    last_leak_ms: u64,
}

/// In-memory leaky bucket.
pub struct LeakyBucketLocal {
    policy_key: String,
    rate: f64,
    capacity: u64,
    clock: Arc<dyn Clock>,
    buckets: StateTable<LevelState>,
}

impl LeakyBucketLocal {
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
impl RateLimitAlgorithm for LeakyBucketLocal {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        ctx.ensure_active()?;
        let now = self.clock.now_millis();
        let rate = self.rate;
        let capacity = self.capacity as f64;

        self.buckets.with_entry(
            identifier,
            now,
            || LevelState { level: 0.0, last_leak_ms: now },
            |state| {
                let elapsed_ms = now.saturating_sub(state.last_leak_ms);
                state.level = (state.level - elapsed_ms as f64 / 1000.0 * rate).max(0.0);
                state.last_leak_ms = now;

                if state.level + 1.0 <= capacity {
                    state.level += 1.0;
                    Decision::allowed().with_remaining((capacity - state.level).floor() as u64)
                } else {
                    debug!(policy_key = %self.policy_key, identifier, level = state.level, "leaky bucket full");
                    let excess = state.level + 1.0 - capacity;
                    Decision::denied()
                        .with_remaining(0)
                        .with_retry_after(Duration::from_secs_f64(excess / rate))
                }
            },
        )
    }

    fn sweep_idle(&self, max_idle: Duration) -> usize {
        self.buckets.purge_idle(max_idle, self.clock.now_millis())
    }
}

/// State is a JSON string `{"currentLevel": n, "lastLeak": ms}`. Written on
/// every verdict so the drain accounting always advances.
const LEAKY_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local res = redis.call('GET', key)
local level = 0
local last_leak = now
if res then
    local state = cjson.decode(res)
    level = tonumber(state['currentLevel'])
    last_leak = tonumber(state['lastLeak'])
end

local elapsed = (now - last_leak) / 1000
if elapsed < 0 then elapsed = 0 end
level = level - elapsed * rate
if level < 0 then level = 0 end

local allowed = 0
if level + 1 <= capacity then
    level = level + 1
    allowed = 1
end

local ttl = math.ceil(capacity / rate * 2)
if ttl < 1 then ttl = 1 end

redis.call('SET', key, cjson.encode({currentLevel = level, lastLeak = now}))
redis.call('EXPIRE', key, ttl)

local remaining = math.floor(capacity - level)
if remaining < 0 then remaining = 0 end
return {allowed, remaining}
"#;

/// Redis leaky bucket.
pub struct LeakyBucketRedis {
    policy_key: String,
    rate: f64,
    capacity: u64,
    backend: RedisBackend,
    script: redis::Script,
    clock: Arc<dyn Clock>,
}

impl LeakyBucketRedis {
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
            script: redis::Script::new(LEAKY_BUCKET_SCRIPT),
            clock,
        }
    }

    fn redis_key(&self, identifier: &str) -> String {
        format!("leaky_bucket:{}:{}", self.policy_key, identifier)
    }
}

#[async_trait]
impl RateLimitAlgorithm for LeakyBucketRedis {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        let key = self.redis_key(identifier);
        let now_ms = self.clock.now_millis();

        let mut invocation = self.script.key(&key);
        invocation.arg(self.capacity).arg(self.rate).arg(now_ms);
        let (allowed, remaining): (i64, u64) = self.backend.eval(ctx, &invocation).await?;

        match allowed {
            1 => Ok(Decision::allowed().with_remaining(remaining)),
            0 => Ok(Decision::denied().with_remaining(remaining)),
            other => Err(RateLimitError::Internal(format!(
                "leaky bucket script returned unexpected verdict {}",
                other
            ))),
        }
    }
}

/// Stored bucket shape: `{"level": n, "last_leak": "<RFC3339>"}`.
#[derive(Debug, Serialize, Deserialize)]
struct StoredLevel {
    level: f64,
    #[serde(with = "humantime_serde")]
    last_leak: SystemTime,
}

/// Memcached leaky bucket: single-shot CAS like the token bucket.
pub struct LeakyBucketMemcached {
    policy_key: String,
    rate: f64,
    capacity: u64,
    store: SharedMemcachedStore,
    clock: Arc<dyn Clock>,
}

impl LeakyBucketMemcached {
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
impl RateLimitAlgorithm for LeakyBucketMemcached {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        let key = format!("leaky_bucket:{}:{}", self.policy_key, identifier);
        let now = self.clock.now();
        let rate = self.rate;
        let capacity = self.capacity as f64;
        let ttl = bucket_ttl(self.capacity, self.rate);
        let store = self.store.clone();

        crate::memcached::run_blocking(ctx, move || {
            let current = store.get(&key)?;
            let (mut bucket, token) = match current {
                None => (StoredLevel { level: 0.0, last_leak: now }, None),
                Some(value) => {
                    let bucket: StoredLevel = serde_json::from_slice(&value.bytes)?;
                    (bucket, Some(value.token))
                }
            };

            let elapsed = now.duration_since(bucket.last_leak).unwrap_or_default();
            bucket.level = (bucket.level - elapsed.as_secs_f64() * rate).max(0.0);
            bucket.last_leak = now;

            let decision = if bucket.level + 1.0 <= capacity {
                bucket.level += 1.0;
                Decision::allowed().with_remaining((capacity - bucket.level).floor() as u64)
            } else {
                let excess = bucket.level + 1.0 - capacity;
                Decision::denied()
                    .with_remaining(0)
                    .with_retry_after(Duration::from_secs_f64(excess / rate))
            };

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
