//! Redis backend adapter.
//!
//! A [`RedisBackend`] owns a small pool of multiplexed connections handed
//! out round-robin. Atomic read-modify-write cycles run as Lua scripts via
//! [`redis::Script`], which invokes by SHA1 digest and re-sends the source
//! only on a `NOSCRIPT` miss, so scripts are effectively registered once
//! per process. Every call is bounded by the configured timeouts and by the
//! caller's context deadline, whichever is tighter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Client, FromRedisValue, ScriptInvocation};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::RedisConfig;
use crate::context::Context;
use crate::error::{RateLimitError, Result};

/// Pooled Redis client shared by every Redis-backed limiter in a registry.
#[derive(Clone)]
pub struct RedisBackend {
    connections: Arc<Vec<MultiplexedConnection>>,
    next: Arc<AtomicUsize>,
    /// Budget for one command round trip (write + read).
    op_timeout: Duration,
}

impl RedisBackend {
    /// Dials `pool_size` connections and pings the server.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self> {
        let url = if cfg.password.is_empty() {
            format!("redis://{}/{}", cfg.address, cfg.db)
        } else {
            format!("redis://:{}@{}/{}", cfg.password, cfg.address, cfg.db)
        };
        let client = Client::open(url)
            .map_err(|e| RateLimitError::Config(format!("invalid redis address '{}': {}", cfg.address, e)))?;

        let mut connections = Vec::with_capacity(cfg.pool_size);
        for _ in 0..cfg.pool_size {
            let conn = timeout(cfg.dial_timeout, client.get_multiplexed_tokio_connection())
                .await
                .map_err(|_| {
                    RateLimitError::BackendUnavailable(format!(
                        "connecting to redis at {} timed out after {:?}",
                        cfg.address, cfg.dial_timeout
                    ))
                })??;
            connections.push(conn);
        }

        let backend = Self {
            connections: Arc::new(connections),
            next: Arc::new(AtomicUsize::new(0)),
            op_timeout: cfg.read_timeout + cfg.write_timeout,
        };
        backend.ping().await?;
        info!(address = %cfg.address, pool_size = cfg.pool_size, "redis backend connected");
        Ok(backend)
    }

    fn connection(&self) -> MultiplexedConnection {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[idx].clone()
    }

    /// Round-trip health probe.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let reply: String = match timeout(self.op_timeout, redis::cmd("PING").query_async(&mut conn)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RateLimitError::BackendUnavailable("redis ping timed out".into()));
            }
        };
        if reply == "PONG" {
            debug!("redis ping ok");
            Ok(())
        } else {
            Err(RateLimitError::Internal(format!("unexpected ping reply: {}", reply)))
        }
    }

    /// Evaluates a prepared script invocation atomically on the server.
    ///
    /// A timeout that fires while the call is in flight is reported as
    /// `BackendUnavailable`: the script is atomic server-side, so the
    /// update either fully committed or was never issued, but this client
    /// no longer knows which.
    pub(crate) async fn eval<T: FromRedisValue>(
        &self,
        ctx: &Context,
        invocation: &ScriptInvocation<'_>,
    ) -> Result<T> {
        ctx.ensure_active()?;
        let budget = match ctx.remaining() {
            Some(remaining) => remaining.min(self.op_timeout),
            None => self.op_timeout,
        };
        let mut conn = self.connection();
        match timeout(budget, invocation.invoke_async(&mut conn)).await {
            Ok(result) => result.map_err(RateLimitError::from),
            Err(_) => Err(RateLimitError::BackendUnavailable(
                "redis call timed out; result unknown".into(),
            )),
        }
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("pool_size", &self.connections.len())
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}
