//! Sliding window counter.
//!
//! The local and Redis variants approximate a true sliding window with two
//! adjacent fixed buckets: the previous bucket's count is weighted by how
//! much of it still overlaps the sliding span, and a request is admitted
//! iff `curr_count + w_prev * prev_count < limit` (the estimate is taken
//! before the admit increment). The Memcached variant stores the exact log
//! of request timestamps instead and updates it under CAS, since Memcached
//! has no server-side scripting.

use std::sync::Arc;
use std::time::Duration;

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

/// CAS attempts before the Memcached log variant gives up with
/// `BackendContention`.
const CAS_MAX_ATTEMPTS: u32 = 3;

struct SlidingState {
    prev_count: u64,
    curr_count: u64,
    window_start_ms: u64,
}

/// In-memory sliding window counter.
pub struct SlidingWindowLocal {
    policy_key: String,
    window_ms: u64,
    limit: u64,
    clock: Arc<dyn Clock>,
    counters: StateTable<SlidingState>,
}

impl SlidingWindowLocal {
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
impl RateLimitAlgorithm for SlidingWindowLocal {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        ctx.ensure_active()?;
        let now = self.clock.now_millis();
        let window_ms = self.window_ms;
        let limit = self.limit;

        self.counters.with_entry(
            identifier,
            now,
            || SlidingState { prev_count: 0, curr_count: 0, window_start_ms: now },
            |state| {
                // Slide before deciding.
                let elapsed = now.saturating_sub(state.window_start_ms);
                if elapsed >= window_ms {
                    if elapsed < 2 * window_ms {
                        state.prev_count = state.curr_count;
                        state.curr_count = 0;
                        state.window_start_ms += window_ms;
                    } else {
                        // Both buckets are stale.
                        state.prev_count = 0;
                        state.curr_count = 0;
                        state.window_start_ms = now;
                    }
                }

                let elapsed = now.saturating_sub(state.window_start_ms);
                let w_prev =
                    ((window_ms.saturating_sub(elapsed)) as f64 / window_ms as f64).clamp(0.0, 1.0);
                let estimate = state.curr_count as f64 + w_prev * state.prev_count as f64;

                if estimate < limit as f64 {
                    state.curr_count += 1;
                    let remaining = (limit as f64 - estimate - 1.0).max(0.0) as u64;
                    Decision::allowed().with_remaining(remaining)
                } else {
                    debug!(policy_key = %self.policy_key, identifier, estimate, "sliding window limit reached");
                    Decision::denied().with_remaining(0)
                }
            },
        )
    }

    fn sweep_idle(&self, max_idle: Duration) -> usize {
        self.counters.purge_idle(max_idle, self.clock.now_millis())
    }
}

/// Hash fields: `pc` (previous count), `cc` (current count), `cws`
/// (current window start, ms). Denied requests write nothing; the key
/// expires three windows after the last admit so both buckets outlive any
/// span that could still weight them.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'pc', 'cc', 'cws')
local prev_count = tonumber(state[1]) or 0
local curr_count = tonumber(state[2]) or 0
local window_start = tonumber(state[3])

if window_start == nil then
    prev_count = 0
    curr_count = 0
    window_start = now
else
    local elapsed = now - window_start
    if elapsed >= window_ms then
        if elapsed < 2 * window_ms then
            prev_count = curr_count
            curr_count = 0
            window_start = window_start + window_ms
        else
            prev_count = 0
            curr_count = 0
            window_start = now
        end
    end
end

local elapsed = now - window_start
if elapsed < 0 then elapsed = 0 end
local w_prev = (window_ms - elapsed) / window_ms
if w_prev < 0 then w_prev = 0 end
if w_prev > 1 then w_prev = 1 end

local estimate = curr_count + w_prev * prev_count

if estimate < limit then
    redis.call('HSET', key, 'pc', prev_count, 'cc', curr_count + 1, 'cws', window_start)
    redis.call('PEXPIRE', key, window_ms * 3)
    local remaining = math.floor(limit - estimate - 1)
    if remaining < 0 then remaining = 0 end
    return {1, remaining}
else
    return {0, 0}
end
"#;

/// Redis sliding window counter.
pub struct SlidingWindowRedis {
    policy_key: String,
    window: Duration,
    limit: u64,
    backend: RedisBackend,
    script: redis::Script,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowRedis {
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
            script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
            clock,
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowRedis {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        let key = storage_key(&self.policy_key, identifier);
        let now_ms = self.clock.now_millis();
        let window_ms = self.window.as_millis() as u64;

        let mut invocation = self.script.key(&key);
        invocation.arg(now_ms).arg(window_ms).arg(self.limit);
        let (allowed, remaining): (i64, u64) = self.backend.eval(ctx, &invocation).await?;

        match allowed {
            1 => Ok(Decision::allowed().with_remaining(remaining)),
            0 => Ok(Decision::denied().with_remaining(0)),
            other => Err(RateLimitError::Internal(format!(
                "sliding window script returned unexpected verdict {}",
                other
            ))),
        }
    }
}

/// Stored log shape: `{"timestamps":[ms, ...]}`, kept sorted.
#[derive(Debug, Serialize, Deserialize)]
struct TimestampLog {
    timestamps: Vec<u64>,
}

/// Memcached sliding window, log variant.
///
/// Exact semantics at O(limit) state per identifier: every verdict prunes
/// timestamps outside the window and counts the survivors. The
/// read-prune-append cycle is committed with CAS; conflicting writers
/// force a bounded retry, and exhaustion fails the verdict with
/// `BackendContention` rather than guessing.
pub struct SlidingWindowMemcached {
    policy_key: String,
    window: Duration,
    limit: u64,
    store: SharedMemcachedStore,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowMemcached {
    pub fn new(
        policy_key: impl Into<String>,
        window: Duration,
        limit: u64,
        store: SharedMemcachedStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { policy_key: policy_key.into(), window, limit, store, clock }
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowMemcached {
    async fn check(&self, ctx: &Context, identifier: &str) -> Result<Decision> {
        let key = storage_key(&self.policy_key, identifier);
        let now_ms = self.clock.now_millis();
        let window_ms = self.window.as_millis() as u64;
        let ttl = self.window;
        let limit = self.limit;
        let store = self.store.clone();
        let policy_key = self.policy_key.clone();

        crate::memcached::run_blocking(ctx, move || {
            for _attempt in 0..CAS_MAX_ATTEMPTS {
                let current = store.get(&key)?;
                let (mut kept, token) = match current {
                    None => (Vec::new(), None),
                    Some(value) => {
                        let log: TimestampLog = serde_json::from_slice(&value.bytes)?;
                        let cutoff = now_ms.saturating_sub(window_ms);
                        let mut kept: Vec<u64> =
                            log.timestamps.into_iter().filter(|ts| *ts >= cutoff).collect();
                        kept.sort_unstable();
                        (kept, Some(value.token))
                    }
                };

                if kept.len() as u64 >= limit {
                    // Denied verdicts write nothing; stale entries get
                    // pruned by the next admit or by the key TTL.
                    debug!(policy_key = %policy_key, count = kept.len(), "sliding log limit reached");
                    let retry_at = kept[0] + window_ms;
                    return Ok(Decision::denied()
                        .with_remaining(0)
                        .with_retry_after(Duration::from_millis(retry_at.saturating_sub(now_ms))));
                }

                kept.push(now_ms);
                let remaining = limit - kept.len() as u64;
                let bytes = serde_json::to_vec(&TimestampLog { timestamps: kept })?;
                match token {
                    None => match store.add(&key, &bytes, ttl)? {
                        AddOutcome::Stored => {
                            return Ok(Decision::allowed().with_remaining(remaining));
                        }
                        // Another client created the log first; re-read.
                        AddOutcome::AlreadyExists => continue,
                    },
                    Some(token) => match store.cas(&key, &bytes, ttl, token)? {
                        CasOutcome::Stored => {
                            return Ok(Decision::allowed().with_remaining(remaining));
                        }
                        CasOutcome::Conflict | CasOutcome::Missing => continue,
                    },
                }
            }
            Err(RateLimitError::BackendContention { attempts: CAS_MAX_ATTEMPTS })
        })
        .await
    }
}
