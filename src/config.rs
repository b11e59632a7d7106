//! Policy catalog types.
//!
//! A policy names one limiter: an algorithm, a storage backend, and the
//! parameters both need. Catalogs are plain data: parsing a config file
//! into `Vec<PolicyConfig>` is the caller's job (any serde format works);
//! the [`Registry`](crate::registry::Registry) consumes the parsed list
//! and validates it strictly before building anything.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RateLimitError;

/// Rate limiting algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl Algorithm {
    /// True for the window-based algorithms (which take [`WindowConfig`]).
    pub fn is_windowed(self) -> bool {
        matches!(self, Algorithm::FixedWindow | Algorithm::SlidingWindow)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        };
        f.write_str(name)
    }
}

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    InMemory,
    Redis,
    Memcached,
}

impl Backend {
    fn is_remote(self) -> bool {
        !matches!(self, Backend::InMemory)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::InMemory => "in_memory",
            Backend::Redis => "redis",
            Backend::Memcached => "memcached",
        };
        f.write_str(name)
    }
}

/// Configuration for a single rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Unique key naming this limiter; also namespaces its backend keys.
    pub key: String,
    /// The decision algorithm.
    pub algorithm: Algorithm,
    /// Where per-identifier state lives.
    pub backend: Backend,

    /// Parameters for the window algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowConfig>,
    /// Parameters for the bucket algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<BucketConfig>,

    /// Connection parameters for the Redis backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
    /// Connection parameters for the Memcached backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memcached: Option<MemcachedConfig>,
}

/// Parameters for the fixed and sliding window algorithms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window length. Remote backends require at least one second, since
    /// their key TTLs have whole-second resolution.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Maximum requests allowed within the window.
    pub limit: u64,
}

/// Parameters for the token and leaky bucket algorithms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Units per second: refill speed (token bucket) or drain speed (leaky bucket).
    pub rate: f64,
    /// Maximum stored units.
    pub capacity: u64,
}

fn default_pool_size() -> usize {
    4
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(3)
}

/// Redis connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Server address, `host:port`.
    pub address: String,
    /// Password for AUTH; empty means no auth.
    #[serde(default)]
    pub password: String,
    /// Logical database index.
    #[serde(default)]
    pub db: i64,
    /// Number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Timeout for establishing a connection.
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,
    /// Timeout for reading a reply.
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Timeout for writing a command.
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
}

/// Memcached connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemcachedConfig {
    /// Server addresses, `host:port`. Must be non-empty.
    pub addresses: Vec<String>,
}

/// Builds the construction-time `Config` error the registry reports:
/// the offending policy key, the field, and why it was rejected.
pub(crate) fn config_error(policy_key: &str, field: &str, reason: &str) -> RateLimitError {
    RateLimitError::Config(format!("policy '{}': invalid '{}': {}", policy_key, field, reason))
}

impl PolicyConfig {
    /// Validates this policy's parameters and cross-field requirements.
    ///
    /// All range checks happen here, once, at construction; verdict calls
    /// never re-validate.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.key.is_empty() {
            return Err(RateLimitError::Config(
                "policy with empty 'key': key is required and must be non-empty".into(),
            ));
        }

        if self.algorithm.is_windowed() {
            let window = self
                .window
                .as_ref()
                .ok_or_else(|| config_error(&self.key, "window", "required for window algorithms"))?;
            if window.duration.is_zero() {
                return Err(config_error(&self.key, "window.duration", "must be > 0"));
            }
            if window.limit == 0 {
                return Err(config_error(&self.key, "window.limit", "must be > 0"));
            }
            if self.backend.is_remote() && window.duration < Duration::from_secs(1) {
                return Err(config_error(
                    &self.key,
                    "window.duration",
                    "remote backends floor TTLs to whole seconds; sub-second windows need the in_memory backend",
                ));
            }
        } else {
            let bucket = self
                .bucket
                .as_ref()
                .ok_or_else(|| config_error(&self.key, "bucket", "required for bucket algorithms"))?;
            if !(bucket.rate.is_finite() && bucket.rate > 0.0) {
                return Err(config_error(&self.key, "bucket.rate", "must be a positive number"));
            }
            if bucket.capacity == 0 {
                return Err(config_error(&self.key, "bucket.capacity", "must be > 0"));
            }
        }

        match self.backend {
            Backend::InMemory => {}
            Backend::Redis => {
                let redis = self
                    .redis
                    .as_ref()
                    .ok_or_else(|| config_error(&self.key, "redis", "required for the redis backend"))?;
                if redis.address.is_empty() {
                    return Err(config_error(&self.key, "redis.address", "must be non-empty"));
                }
                if redis.pool_size == 0 {
                    return Err(config_error(&self.key, "redis.pool_size", "must be > 0"));
                }
            }
            Backend::Memcached => {
                let memcached = self.memcached.as_ref().ok_or_else(|| {
                    config_error(&self.key, "memcached", "required for the memcached backend")
                })?;
                if memcached.addresses.is_empty() {
                    return Err(config_error(&self.key, "memcached.addresses", "must be non-empty"));
                }
                if memcached.addresses.iter().any(|a| a.is_empty()) {
                    return Err(config_error(&self.key, "memcached.addresses", "entries must be non-empty"));
                }
            }
        }

        Ok(())
    }
}
