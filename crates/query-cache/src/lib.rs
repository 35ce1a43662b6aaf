//! # Brain Query Cache
//!
//! Memoizes expensive query results with three independent death conditions:
//! LRU capacity eviction, TTL expiry, and generation mismatch after an index
//! write. Identical concurrent lookups collapse into a single in-flight
//! computation; every waiter receives the one result (or the one failure).
//!
//! `invalidate_all` bumps a generation counter instead of walking entries, so
//! invalidation on the write path is O(1). Entries are tagged with the
//! generation read *before* their computation started and validated against
//! the current generation at lookup time, which keeps an entry created
//! concurrently with a write from outliving that write.

use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("compute failed: {0}")]
    Compute(String),
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Counters for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_rate_percent: f64,
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    generation: u64,
}

struct Inner<V> {
    entries: LruCache<String, CacheEntry<V>>,
    in_flight: HashMap<String, broadcast::Sender<Result<V, String>>>,
}

pub struct QueryCache<V: Clone> {
    ttl: Duration,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    inner: Mutex<Inner<V>>,
}

enum Action<V: Clone> {
    Hit(V),
    Join(broadcast::Receiver<Result<V, String>>),
    Lead { generation: u64 },
}

impl<V: Clone> QueryCache<V> {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl: config.ttl,
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                in_flight: HashMap::new(),
            }),
        }
    }

    /// Return the cached value for `key`, or run `compute` to produce it.
    ///
    /// On a hit with a live entry the value is returned without invoking
    /// `compute`. On a miss, `compute` runs exactly once even under
    /// concurrent identical calls: later callers block on the in-flight
    /// computation and share its outcome. A failed computation is stored
    /// nowhere; every waiter gets the failure and the next call retries.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let mut compute = Some(compute);
        loop {
            let action = {
                let mut inner = self.lock_inner();
                let generation = self.generation.load(Ordering::SeqCst);

                let lookup = match inner.entries.get(key) {
                    Some(entry)
                        if entry.generation == generation && Instant::now() <= entry.expires_at =>
                    {
                        Some(entry.value.clone())
                    }
                    Some(_) => {
                        // Superseded by a write or past its TTL.
                        inner.entries.pop(key);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    None => None,
                };

                match lookup {
                    Some(value) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Action::Hit(value)
                    }
                    None => self.join_or_lead(&mut inner, key, generation),
                }
            };

            match action {
                Action::Hit(value) => return Ok(value),
                Action::Lead { generation } => {
                    if let Some(compute) = compute.take() {
                        return self.lead(key, generation, compute()).await;
                    }
                    // A call leads at most once; reaching this means the
                    // in-flight bookkeeping was lost underneath us.
                    return Err(CacheError::Compute(
                        "in-flight computation state lost".to_string(),
                    ));
                }
                Action::Join(mut rx) => match rx.recv().await {
                    Ok(Ok(value)) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Ok(Err(message)) => return Err(CacheError::Compute(message)),
                    // The leader went away without reporting; take over.
                    Err(_closed) => continue,
                },
            }
        }
    }

    /// Invalidate every entry, O(1): lookups validate the stored generation
    /// against the current one instead of this call walking the map.
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        log::debug!("Query cache invalidated");
    }

    /// Drop entries that are expired or superseded. Returns how many were
    /// removed; intended for a periodic janitor task.
    pub fn evict_expired(&self) -> usize {
        let generation = self.generation.load(Ordering::SeqCst);
        let now = Instant::now();
        let mut inner = self.lock_inner();

        let dead: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.generation != generation || now > entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &dead {
            inner.entries.pop(key);
        }

        self.evictions
            .fetch_add(dead.len() as u64, Ordering::Relaxed);
        dead.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_inner().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate_percent = if total > 0 {
            (hits as f64 / total as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            hit_rate_percent,
        }
    }

    fn join_or_lead(&self, inner: &mut Inner<V>, key: &str, generation: u64) -> Action<V> {
        if let Some(tx) = inner.in_flight.get(key) {
            Action::Join(tx.subscribe())
        } else {
            let (tx, _) = broadcast::channel(1);
            inner.in_flight.insert(key.to_string(), tx);
            self.misses.fetch_add(1, Ordering::Relaxed);
            Action::Lead { generation }
        }
    }

    async fn lead<Fut>(&self, key: &str, generation: u64, fut: Fut) -> Result<V, CacheError>
    where
        Fut: Future<Output = anyhow::Result<V>>,
    {
        // If this future is dropped mid-compute the guard clears the
        // in-flight slot, closing the channel so waiters retry instead of
        // hanging.
        let mut guard = FlightGuard {
            cache: self,
            key: key.to_string(),
            done: false,
        };

        let result = fut.await;

        let tx = {
            let mut inner = self.lock_inner();
            guard.done = true;
            let tx = inner.in_flight.remove(key);

            if let Ok(value) = &result {
                if self.generation.load(Ordering::SeqCst) == generation {
                    let entry = CacheEntry {
                        value: value.clone(),
                        expires_at: Instant::now() + self.ttl,
                        generation,
                    };
                    if let Some((evicted_key, _)) = inner.entries.push(key.to_string(), entry) {
                        if evicted_key != key {
                            self.evictions.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                // A write landed while computing: the value is already stale,
                // serve it to this burst of callers but do not store it.
            }
            tx
        };

        match result {
            Ok(value) => {
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(value.clone()));
                }
                Ok(value)
            }
            Err(err) => {
                let message = err.to_string();
                if let Some(tx) = tx {
                    let _ = tx.send(Err(message.clone()));
                }
                Err(CacheError::Compute(message))
            }
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner<V>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct FlightGuard<'a, V: Clone> {
    cache: &'a QueryCache<V>,
    key: String,
    done: bool,
}

impl<V: Clone> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        if !self.done {
            let mut inner = self.cache.lock_inner();
            inner.in_flight.remove(&self.key);
        }
    }
}
