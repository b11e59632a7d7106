//! Memcached backend adapter.
//!
//! Memcached has no server-side scripting, so atomic read-modify-write
//! cycles go through `gets`/`cas`: read a value with its CAS token, compute
//! the update, and write it back conditioned on the token. The
//! [`MemcachedStore`] trait captures the handful of operations the
//! algorithms need, which keeps the decision logic testable against an
//! in-process mock; [`MemcachedBackend`] is the real client. The
//! `memcache` crate is synchronous, so calls are moved off the async
//! executor with `spawn_blocking`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use memcache::{CommandError, MemcacheError};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::MemcachedConfig;
use crate::context::Context;
use crate::error::{RateLimitError, Result};

/// A stored value together with its CAS token.
#[derive(Debug, Clone)]
pub struct CasValue {
    pub bytes: Vec<u8>,
    pub token: u64,
}

/// Outcome of an only-if-absent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Stored,
    AlreadyExists,
}

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Stored,
    /// The value changed since it was read; the caller must re-read.
    Conflict,
    /// The key vanished (expired or deleted) since it was read.
    Missing,
}

/// The operations the algorithms bind to. Blocking; bridge through
/// [`run_blocking`] from async code.
pub trait MemcachedStore: Send + Sync {
    /// Fetch a value with its CAS token. `None` on a miss.
    fn get(&self, key: &str) -> Result<Option<CasValue>>;
    /// Unconditional store.
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    /// Store only if the key does not exist.
    fn add(&self, key: &str, value: &[u8], ttl: Duration) -> Result<AddOutcome>;
    /// Atomic counter increment. The key's TTL is left untouched.
    fn increment(&self, key: &str, delta: u64) -> Result<u64>;
    /// Store conditioned on the CAS token from a prior [`get`](Self::get).
    fn cas(&self, key: &str, value: &[u8], ttl: Duration, token: u64) -> Result<CasOutcome>;
}

/// Shared handle to a memcached store.
pub type SharedMemcachedStore = Arc<dyn MemcachedStore>;

/// Memcached TTLs have whole-second resolution; round up with a
/// one-second floor so a TTL never undercuts the span it protects.
pub(crate) fn ttl_seconds(ttl: Duration) -> u32 {
    (ttl.as_secs_f64().ceil() as u32).max(1)
}

/// Runs a blocking store operation off the async executor, honoring the
/// context's cancellation and deadline.
///
/// A deadline that expires while the operation is in flight reports
/// `BackendUnavailable`: the write may or may not have landed.
pub(crate) async fn run_blocking<T, F>(ctx: &Context, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    ctx.ensure_active()?;
    let task = tokio::task::spawn_blocking(f);
    let joined = match ctx.remaining() {
        Some(remaining) => match timeout(remaining, task).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(RateLimitError::BackendUnavailable(
                    "memcached call deadline expired; result unknown".into(),
                ));
            }
        },
        None => task.await,
    };
    joined.map_err(|e| RateLimitError::Internal(format!("memcached worker failed: {}", e)))?
}

/// Real memcached client. The `memcache` crate pools connections
/// internally, so clones share the pool.
#[derive(Clone)]
pub struct MemcachedBackend {
    client: memcache::Client,
}

impl MemcachedBackend {
    /// Connects to the configured servers and probes them with a version
    /// request.
    pub fn connect(cfg: &MemcachedConfig) -> Result<Self> {
        let urls: Vec<String> = cfg.addresses.iter().map(|a| format!("memcache://{}", a)).collect();
        let client = memcache::Client::connect(urls)?;
        client.version()?;
        info!(servers = ?cfg.addresses, "memcached backend connected");
        Ok(Self { client })
    }
}

impl MemcachedStore for MemcachedBackend {
    fn get(&self, key: &str) -> Result<Option<CasValue>> {
        let mut values: HashMap<String, (Vec<u8>, u32, Option<u64>)> = self.client.gets(&[key])?;
        match values.remove(key) {
            Some((bytes, _flags, Some(token))) => Ok(Some(CasValue { bytes, token })),
            Some((_, _, None)) => Err(RateLimitError::Internal(
                "memcached gets returned no cas token".into(),
            )),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.client.set(key, value, ttl_seconds(ttl))?;
        Ok(())
    }

    fn add(&self, key: &str, value: &[u8], ttl: Duration) -> Result<AddOutcome> {
        match self.client.add(key, value, ttl_seconds(ttl)) {
            Ok(()) => Ok(AddOutcome::Stored),
            Err(MemcacheError::CommandError(CommandError::KeyExists)) => {
                Ok(AddOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn increment(&self, key: &str, delta: u64) -> Result<u64> {
        Ok(self.client.increment(key, delta)?)
    }

    fn cas(&self, key: &str, value: &[u8], ttl: Duration, token: u64) -> Result<CasOutcome> {
        match self.client.cas(key, value, ttl_seconds(ttl), token) {
            Ok(true) => Ok(CasOutcome::Stored),
            Ok(false) => {
                debug!(key, "memcached cas conflict");
                Ok(CasOutcome::Conflict)
            }
            Err(MemcacheError::CommandError(CommandError::KeyExists)) => Ok(CasOutcome::Conflict),
            Err(MemcacheError::CommandError(CommandError::KeyNotFound)) => Ok(CasOutcome::Missing),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for MemcachedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcachedBackend").finish_non_exhaustive()
    }
}
