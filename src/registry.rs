//! Registry and factory.
//!
//! The registry turns an ordered policy catalog into a keyed set of
//! [`LimiterHandle`]s. Validation is strict and happens up front: any
//! invalid policy fails the whole build and no partial registry is
//! returned. At most one client per backend kind is dialed and shared by
//! every policy of that kind. The registry is consulted once at startup;
//! it is not on the verdict path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::algorithms::fixed_window::{FixedWindowLocal, FixedWindowMemcached, FixedWindowRedis};
use crate::algorithms::leaky_bucket::{LeakyBucketLocal, LeakyBucketMemcached, LeakyBucketRedis};
use crate::algorithms::sliding_window::{
    SlidingWindowLocal, SlidingWindowMemcached, SlidingWindowRedis,
};
use crate::algorithms::token_bucket::{TokenBucketLocal, TokenBucketMemcached, TokenBucketRedis};
use crate::algorithms::RateLimitAlgorithm;
use crate::clock::{Clock, SystemClock};
use crate::config::{config_error, Algorithm, Backend, PolicyConfig};
use crate::context::Context;
use crate::error::{RateLimitError, Result};
use crate::limiter::LimiterHandle;
use crate::memcached::{MemcachedBackend, SharedMemcachedStore};
use crate::redis::RedisBackend;
use crate::telemetry::{NoopTelemetry, TelemetrySink};

#[derive(Default)]
struct BackendClients {
    redis: Option<RedisBackend>,
    memcached: Option<MemcachedBackend>,
}

/// Builds a [`Registry`] with an injected clock or telemetry sink.
pub struct RegistryBuilder {
    policies: Vec<PolicyConfig>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl RegistryBuilder {
    pub fn new(policies: Vec<PolicyConfig>) -> Self {
        Self {
            policies,
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Replace the wall clock. Every handle built by this registry reads
    /// time through it.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach a telemetry sink observing every verdict.
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Validate the catalog, dial the backends, and build all handles.
    pub async fn build(self) -> Result<Registry> {
        Registry::build(self).await
    }
}

/// A process-wide collection of limiter handles keyed by policy key.
pub struct Registry {
    handles: HashMap<String, Arc<LimiterHandle>>,
    clients: Mutex<Option<BackendClients>>,
}

impl Registry {
    /// Start building a registry from a policy catalog.
    pub fn builder(policies: Vec<PolicyConfig>) -> RegistryBuilder {
        RegistryBuilder::new(policies)
    }

    /// Build with the system clock and no telemetry.
    pub async fn from_policies(policies: Vec<PolicyConfig>) -> Result<Self> {
        Self::builder(policies).build().await
    }

    async fn build(builder: RegistryBuilder) -> Result<Self> {
        let RegistryBuilder { policies, clock, telemetry } = builder;

        if policies.is_empty() {
            return Err(RateLimitError::Config("policy catalog is empty".into()));
        }

        // Validate everything before touching the network: either the
        // whole catalog builds or none of it does.
        for policy in &policies {
            policy.validate()?;
        }
        let mut seen = std::collections::HashSet::new();
        for policy in &policies {
            if !seen.insert(policy.key.as_str()) {
                return Err(config_error(&policy.key, "key", "duplicate policy key"));
            }
        }

        let mut clients = BackendClients::default();
        for policy in &policies {
            match policy.backend {
                Backend::Redis if clients.redis.is_none() => {
                    let cfg = policy.redis.as_ref().ok_or_else(|| {
                        config_error(&policy.key, "redis", "required for the redis backend")
                    })?;
                    clients.redis = Some(RedisBackend::connect(cfg).await?);
                }
                Backend::Memcached if clients.memcached.is_none() => {
                    let cfg = policy
                        .memcached
                        .as_ref()
                        .ok_or_else(|| {
                            config_error(&policy.key, "memcached", "required for the memcached backend")
                        })?
                        .clone();
                    let backend = tokio::task::spawn_blocking(move || MemcachedBackend::connect(&cfg))
                        .await
                        .map_err(|e| RateLimitError::Internal(format!("memcached dial task failed: {}", e)))??;
                    clients.memcached = Some(backend);
                }
                _ => {}
            }
        }

        let mut handles = HashMap::with_capacity(policies.len());
        for policy in policies {
            let limiter = build_algorithm(&policy, &clients, clock.clone())?;
            info!(
                policy_key = %policy.key,
                algorithm = %policy.algorithm,
                backend = %policy.backend,
                "limiter ready"
            );
            let handle = LimiterHandle::new(
                policy.key.clone(),
                policy.algorithm,
                policy.backend,
                limiter,
                telemetry.clone(),
            );
            handles.insert(policy.key, Arc::new(handle));
        }

        Ok(Self { handles, clients: Mutex::new(Some(clients)) })
    }

    /// Look up the handle for a policy key.
    pub fn get(&self, policy_key: &str) -> Option<Arc<LimiterHandle>> {
        self.handles.get(policy_key).cloned()
    }

    /// Shorthand: decide on the named policy.
    pub async fn decide(
        &self,
        ctx: &Context,
        policy_key: &str,
        identifier: &str,
    ) -> Result<crate::algorithms::Decision> {
        let handle = self.get(policy_key).ok_or_else(|| {
            RateLimitError::Config(format!("no limiter registered for policy '{}'", policy_key))
        })?;
        handle.decide(ctx, identifier).await
    }

    /// The policy keys this registry serves.
    pub fn policy_keys(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drop local per-identifier state untouched for longer than
    /// `max_idle`, across every local-backed handle. Returns the number of
    /// entries removed.
    ///
    /// Local state is otherwise retained until process exit, so a caller
    /// facing an unbounded identifier set (per-IP limiting on the open
    /// internet, say) should sweep on a timer. Remote backends expire
    /// state via TTL and need no sweeping.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        self.handles.values().map(|h| h.purge_idle(max_idle)).sum()
    }

    /// Close all backend clients. Idempotent: later calls are no-ops.
    ///
    /// Returns the union of per-client close errors; handles that are
    /// still held keep working against local state but will fail remote
    /// calls once their connections wind down.
    pub fn close(&self) -> Result<()> {
        let taken = self
            .clients
            .lock()
            .map_err(|_| RateLimitError::Internal("registry client lock poisoned".into()))?
            .take();

        let Some(clients) = taken else {
            return Ok(());
        };

        // Neither client library exposes a fallible shutdown; dropping the
        // pooled connections is the whole close path.
        drop(clients);
        info!("registry closed");
        Ok(())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("policies", &self.handles.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn window_params(policy: &PolicyConfig) -> Result<(Duration, u64)> {
    let window = policy
        .window
        .as_ref()
        .ok_or_else(|| RateLimitError::Internal("validated policy lost window params".into()))?;
    Ok((window.duration, window.limit))
}

fn bucket_params(policy: &PolicyConfig) -> Result<(f64, u64)> {
    let bucket = policy
        .bucket
        .as_ref()
        .ok_or_else(|| RateLimitError::Internal("validated policy lost bucket params".into()))?;
    Ok((bucket.rate, bucket.capacity))
}

fn build_algorithm(
    policy: &PolicyConfig,
    clients: &BackendClients,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn RateLimitAlgorithm>> {
    let key = policy.key.clone();
    match policy.backend {
        Backend::InMemory => match policy.algorithm {
            Algorithm::FixedWindow => {
                let (window, limit) = window_params(policy)?;
                Ok(Arc::new(FixedWindowLocal::new(key, window, limit, clock)))
            }
            Algorithm::SlidingWindow => {
                let (window, limit) = window_params(policy)?;
                Ok(Arc::new(SlidingWindowLocal::new(key, window, limit, clock)))
            }
            Algorithm::TokenBucket => {
                let (rate, capacity) = bucket_params(policy)?;
                Ok(Arc::new(TokenBucketLocal::new(key, rate, capacity, clock)))
            }
            Algorithm::LeakyBucket => {
                let (rate, capacity) = bucket_params(policy)?;
                Ok(Arc::new(LeakyBucketLocal::new(key, rate, capacity, clock)))
            }
        },
        Backend::Redis => {
            let backend = clients
                .redis
                .clone()
                .ok_or_else(|| config_error(&policy.key, "redis", "redis client was not initialized"))?;
            match policy.algorithm {
                Algorithm::FixedWindow => {
                    let (window, limit) = window_params(policy)?;
                    Ok(Arc::new(FixedWindowRedis::new(key, window, limit, backend, clock)))
                }
                Algorithm::SlidingWindow => {
                    let (window, limit) = window_params(policy)?;
                    Ok(Arc::new(SlidingWindowRedis::new(key, window, limit, backend, clock)))
                }
                Algorithm::TokenBucket => {
                    let (rate, capacity) = bucket_params(policy)?;
                    Ok(Arc::new(TokenBucketRedis::new(key, rate, capacity, backend, clock)))
                }
                Algorithm::LeakyBucket => {
                    let (rate, capacity) = bucket_params(policy)?;
                    Ok(Arc::new(LeakyBucketRedis::new(key, rate, capacity, backend, clock)))
                }
            }
        }
        Backend::Memcached => {
            let store: SharedMemcachedStore = Arc::new(
                clients
                    .memcached
                    .clone()
                    .ok_or_else(|| {
                        config_error(&policy.key, "memcached", "memcached client was not initialized")
                    })?,
            );
            match policy.algorithm {
                Algorithm::FixedWindow => {
                    let (window, limit) = window_params(policy)?;
                    Ok(Arc::new(FixedWindowMemcached::new(key, window, limit, store)))
                }
                Algorithm::SlidingWindow => {
                    let (window, limit) = window_params(policy)?;
                    Ok(Arc::new(SlidingWindowMemcached::new(key, window, limit, store, clock)))
                }
                Algorithm::TokenBucket => {
                    let (rate, capacity) = bucket_params(policy)?;
                    Ok(Arc::new(TokenBucketMemcached::new(key, rate, capacity, store, clock)))
                }
                Algorithm::LeakyBucket => {
                    let (rate, capacity) = bucket_params(policy)?;
                    Ok(Arc::new(LeakyBucketMemcached::new(key, rate, capacity, store, clock)))
                }
            }
        }
    }
}
