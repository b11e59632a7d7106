//! In-process state storage.
//!
//! One [`StateTable`] backs each local limiter: a map from identifier key
//! to that identifier's state, guarded by a per-entry mutex so distinct
//! identifiers never contend. Entry creation is insert-if-absent under the
//! map's write lock; all mutation happens under the entry's own lock with
//! the map lock released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::{RateLimitError, Result};

struct Slot<S> {
    state: S,
    last_access_ms: u64,
}

struct Entry<S> {
    slot: Mutex<Slot<S>>,
}

/// Concurrent map from identifier key to per-identifier state.
pub(crate) struct StateTable<S> {
    entries: RwLock<HashMap<String, Arc<Entry<S>>>>,
}

impl<S> StateTable<S> {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Runs `f` with exclusive access to the state for `key`, creating it
    /// with `init` on first sight. `now_ms` stamps the entry for idle
    /// sweeping.
    pub fn with_entry<R>(
        &self,
        key: &str,
        now_ms: u64,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> Result<R> {
        let entry = self.entry(key, now_ms, init)?;
        let mut slot = entry
            .slot
            .lock()
            .map_err(|_| RateLimitError::Internal("state lock poisoned".into()))?;
        slot.last_access_ms = now_ms;
        Ok(f(&mut slot.state))
    }

    fn entry(&self, key: &str, now_ms: u64, init: impl FnOnce() -> S) -> Result<Arc<Entry<S>>> {
        {
            let entries = self
                .entries
                .read()
                .map_err(|_| RateLimitError::Internal("state table lock poisoned".into()))?;
            if let Some(entry) = entries.get(key) {
                return Ok(entry.clone());
            }
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| RateLimitError::Internal("state table lock poisoned".into()))?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Entry { slot: Mutex::new(Slot { state: init(), last_access_ms: now_ms }) })
        });
        Ok(entry.clone())
    }

    /// Drops entries untouched for longer than `max_idle`. Returns how many
    /// were removed.
    ///
    /// Local state otherwise lives until process exit; callers that face
    /// unbounded identifier sets should sweep periodically.
    pub fn purge_idle(&self, max_idle: Duration, now_ms: u64) -> usize {
        let max_idle_ms = max_idle.as_millis() as u64;
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let before = entries.len();
        entries.retain(|_, entry| match entry.slot.lock() {
            Ok(slot) => now_ms.saturating_sub(slot.last_access_ms) <= max_idle_ms,
            Err(_) => false,
        });
        before - entries.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}
