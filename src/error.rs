//! Error handling for the rate limiting crate.

use std::fmt;

/// Errors that can occur while building or consulting a rate limiter.
///
/// The decision engine never converts an error into a verdict: every
/// failure is surfaced to the caller, who decides whether an unavailable
/// backend maps to allow or deny.
#[derive(Debug, Clone)]
pub enum RateLimitError {
    /// Policy parameters invalid; raised at construction, never at verdict time.
    Config(String),
    /// Network failure, timeout, or unexpected remote error.
    BackendUnavailable(String),
    /// Compare-and-swap retry budget exhausted under concurrent writers.
    BackendContention { attempts: u32 },
    /// Stored state is malformed (JSON shape, field types).
    Decode(String),
    /// The context was cancelled or its deadline expired before the decision committed.
    Cancelled,
    /// Reserved for bugs (e.g. a server script returned an unexpected type).
    Internal(String),
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::Config(msg) => write!(f, "configuration error: {}", msg),
            RateLimitError::BackendUnavailable(msg) => write!(f, "backend unavailable: {}", msg),
            RateLimitError::BackendContention { attempts } => {
                write!(f, "backend contention: CAS failed after {} attempts", attempts)
            }
            RateLimitError::Decode(msg) => write!(f, "stored state malformed: {}", msg),
            RateLimitError::Cancelled => write!(f, "operation cancelled"),
            RateLimitError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for RateLimitError {}

impl From<redis::RedisError> for RateLimitError {
    fn from(error: redis::RedisError) -> Self {
        match error.kind() {
            redis::ErrorKind::TypeError => {
                RateLimitError::Internal(format!("unexpected redis reply: {}", error))
            }
            _ => RateLimitError::BackendUnavailable(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for RateLimitError {
    fn from(error: serde_json::Error) -> Self {
        RateLimitError::Decode(error.to_string())
    }
}

impl From<memcache::MemcacheError> for RateLimitError {
    fn from(error: memcache::MemcacheError) -> Self {
        RateLimitError::BackendUnavailable(error.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RateLimitError>;
