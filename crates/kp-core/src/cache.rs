//! Expiring key-value cache
//!
//! A thread-safe map from string keys to values with an optional per-entry
//! TTL. Expiry is checked on every read, so an expired entry is invisible
//! even before the background sweep physically removes it.
//!
//! # Sweeping
//!
//! [`spawn_sweeper`](ExpiringCache::spawn_sweeper) starts a task that wakes
//! every [`DEFAULT_SWEEP_INTERVAL`] and drops expired entries. The task only
//! holds a weak reference, so it exits once the cache itself is dropped.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;

/// Interval between background sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A stored value and its absolute expiry (`None` = never)
#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Absolute expiry for a TTL; zero means never
fn expiry_for(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(Instant::now() + ttl)
    }
}

/// Thread-safe map with per-entry TTL
pub struct ExpiringCache<V> {
    store: RwLock<HashMap<String, Entry<V>>>,
}

impl<V: Clone> ExpiringCache<V> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry<V>>> {
        self.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry<V>>> {
        self.store.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a value that never expires
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, Duration::ZERO);
    }

    /// Store a value that expires after `ttl` (zero = never)
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: expiry_for(ttl),
        };
        self.write().insert(key.into(), entry);
    }

    /// Get an unexpired value
    pub fn get(&self, key: &str) -> Result<V, CacheError> {
        let now = Instant::now();
        match self.read().get(key) {
            Some(entry) if entry.is_live(now) => Ok(entry.value.clone()),
            _ => Err(CacheError::NotFound),
        }
    }

    /// Remove a key; absent keys are ignored
    pub fn delete(&self, key: &str) {
        self.write().remove(key);
    }

    /// All unexpired entries whose key satisfies `matcher` (all when `None`)
    pub fn get_all(&self, matcher: Option<&dyn Fn(&str) -> bool>) -> HashMap<String, V> {
        let now = Instant::now();
        self.read()
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && matcher.map_or(true, |m| m(key.as_str())))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Refresh the expiry of a live entry
    ///
    /// An absent or already expired entry is not revived.
    pub fn update_ttl(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut store = self.write();
        match store.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = expiry_for(ttl);
                Ok(())
            }
            _ => Err(CacheError::NotFound),
        }
    }

    /// Physically remove expired entries, returning how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut store = self.write();
        let before = store.len();
        store.retain(|_, entry| entry.is_live(now));
        before - store.len()
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl<V: Clone + Send + Sync + 'static> ExpiringCache<V> {
    /// Start the background sweep task
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run_sweeper(Arc::downgrade(self), interval, cancel))
    }
}

impl<V: Clone> Default for ExpiringCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically drop expired entries until cancelled or the cache is gone.
pub async fn run_sweeper<V: Clone>(
    cache: Weak<ExpiringCache<V>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    tracing::debug!("Swept {} expired cache entries", removed);
                }
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }
}
