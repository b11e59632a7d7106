//! Multi-algorithm, multi-backend rate limiting.
//!
//! Four classic algorithms (fixed window, sliding window, token bucket,
//! leaky bucket) over three storage backends (in-memory, Redis,
//! Memcached), configured declaratively. Build a [`Registry`] from a
//! policy catalog, then call [`LimiterHandle::decide`] per request.

pub mod algorithms;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod limiter;
mod local;
pub mod memcached;
pub mod redis;
pub mod registry;
pub mod telemetry;

pub use algorithms::{Decision, Verdict};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Algorithm, Backend, BucketConfig, MemcachedConfig, PolicyConfig, RedisConfig, WindowConfig};
pub use context::{CancelHandle, Context};
pub use error::RateLimitError;
pub use limiter::LimiterHandle;
pub use registry::{Registry, RegistryBuilder};
pub use telemetry::{CounterTelemetry, NoopTelemetry, TelemetrySink};
