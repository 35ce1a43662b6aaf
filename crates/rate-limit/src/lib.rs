//! # Brain Rate Limit
//!
//! Token-bucket admission control keyed by client identity. Each client gets
//! a budget that refills at a fixed rate up to a fixed burst capacity;
//! `admit` consumes one token or refuses, and never blocks. Budgets for idle
//! clients are reaped so the map stays bounded no matter how many distinct
//! identities show up.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum burst size, in tokens.
    pub capacity: f64,
    /// Refill rate, tokens per second.
    pub refill_per_sec: f64,
    /// Budgets idle for longer than this are reaped.
    pub idle_horizon: Duration,
    /// How often `admit` opportunistically runs the reaper.
    pub reap_interval: Duration,
}

impl RateLimitConfig {
    /// The common configuration: `n` requests per minute with burst `n`, and
    /// an idle horizon of ten refill windows.
    #[must_use]
    pub fn per_minute(n: u32) -> Self {
        Self {
            capacity: f64::from(n),
            refill_per_sec: f64::from(n) / 60.0,
            idle_horizon: Duration::from_secs(600),
            reap_interval: Duration::from_secs(60),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

#[derive(Debug)]
struct ClientBudget {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

struct Buckets {
    budgets: HashMap<String, ClientBudget>,
    last_reap: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    inner: Mutex<Buckets>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Buckets {
                budgets: HashMap::new(),
                last_reap: Instant::now(),
            }),
        }
    }

    /// Admit or refuse one request from `client`. Never blocks.
    ///
    /// The first sighting of an identity creates a full bucket, so a fresh
    /// client can burst up to `capacity` before refill pacing kicks in.
    pub fn admit(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.lock_inner();

        if now.duration_since(inner.last_reap) >= self.config.reap_interval {
            inner.last_reap = now;
            self.reap_locked(&mut inner, now);
        }

        let capacity = self.config.capacity;
        let budget = inner
            .budgets
            .entry(client.to_string())
            .or_insert_with(|| ClientBudget {
                tokens: capacity,
                last_refill: now,
                last_seen: now,
            });

        let elapsed = now.duration_since(budget.last_refill).as_secs_f64();
        budget.tokens = capacity.min(budget.tokens + elapsed * self.config.refill_per_sec);
        budget.last_refill = now;
        budget.last_seen = now;

        if budget.tokens >= 1.0 {
            budget.tokens -= 1.0;
            true
        } else {
            log::debug!("Rate limit refused client {client}");
            false
        }
    }

    /// Drop budgets idle beyond the configured horizon. Returns how many were
    /// removed; intended for a periodic janitor task in addition to the
    /// opportunistic sweep inside `admit`.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        inner.last_reap = now;
        self.reap_locked(&mut inner, now)
    }

    #[must_use]
    pub fn active_clients(&self) -> usize {
        self.lock_inner().budgets.len()
    }

    fn reap_locked(&self, inner: &mut Buckets, now: Instant) -> usize {
        let horizon = self.config.idle_horizon;
        let before = inner.budgets.len();
        inner
            .budgets
            .retain(|_, budget| now.duration_since(budget.last_seen) <= horizon);
        let removed = before - inner.budgets.len();
        if removed > 0 {
            log::debug!(
                "Reaped {removed} idle client budgets, {} remain",
                inner.budgets.len()
            );
        }
        removed
    }

    fn lock_inner(&self) -> MutexGuard<'_, Buckets> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
