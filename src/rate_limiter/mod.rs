//! Rate limiting for outbound calls
//!
//! This module provides admission control with four interchangeable
//! algorithms. State is kept per key; each key has its own critical
//! section, so unrelated keys never wait on each other. Rejection is an
//! ordinary [`Admission`] value rather than an error.

pub mod algorithms;

pub use algorithms::RateLimitAlgorithm;

use crate::error::{ReliabilityError, Result};
use algorithms::LimiterState;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Rate limiting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Algorithm
    pub algorithm: RateLimitAlgorithm,
    /// Refill/drain rate per second for buckets; admits per window for windows
    pub rate: f64,
    /// Bucket capacity (token and leaky buckets)
    pub burst: u32,
    /// Window length (sliding and fixed windows)
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            rate: 10.0,
            burst: 20,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    pub fn token_bucket(rate: f64, burst: u32) -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            rate,
            burst,
            ..Default::default()
        }
    }

    pub fn leaky_bucket(rate: f64, capacity: u32) -> Self {
        Self {
            algorithm: RateLimitAlgorithm::LeakyBucket,
            rate,
            burst: capacity,
            ..Default::default()
        }
    }

    pub fn sliding_window(limit: u32, window: Duration) -> Self {
        Self {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            rate: f64::from(limit),
            window,
            ..Default::default()
        }
    }

    pub fn fixed_window(limit: u32, window: Duration) -> Self {
        Self {
            algorithm: RateLimitAlgorithm::FixedWindow,
            rate: f64::from(limit),
            window,
            ..Default::default()
        }
    }

    /// Admits allowed per window for the window algorithms
    pub(crate) fn window_limit(&self) -> u32 {
        (self.rate.floor() as u32).max(1)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(ReliabilityError::config("rate must be a positive number"));
        }
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket | RateLimitAlgorithm::LeakyBucket => {
                if self.burst == 0 {
                    return Err(ReliabilityError::config("burst must be at least 1"));
                }
            }
            RateLimitAlgorithm::SlidingWindow | RateLimitAlgorithm::FixedWindow => {
                if self.window.is_zero() {
                    return Err(ReliabilityError::config("window must be non-zero"));
                }
                if self.rate < 1.0 {
                    return Err(ReliabilityError::config(
                        "rate must allow at least one request per window",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Result of one admission decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub used: u32,
    #[serde(with = "humantime_serde")]
    pub retry_after: Option<Duration>,
}

impl Admission {
    pub(crate) fn granted(limit: u32, remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            used: limit.saturating_sub(remaining),
            retry_after: None,
        }
    }

    pub(crate) fn denied(limit: u32, remaining: u32, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
            limit,
            used: limit.saturating_sub(remaining),
            retry_after: Some(retry_after),
        }
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub algorithm: RateLimitAlgorithm,
    /// Keys currently tracked
    pub keys: usize,
    pub allowed: u64,
    pub rejected: u64,
}

struct KeyState {
    state: LimiterState,
    last_seen: Instant,
}

/// Rate limiter implementation
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    epoch: Instant,
    keys: DashMap<String, Mutex<KeyState>>,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            name: name.into(),
            config,
            epoch: Instant::now(),
            keys: DashMap::new(),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Decide whether a request for `key` may proceed
    pub fn admit(&self, key: &str) -> Admission {
        let now = Instant::now();
        // Admit under the shard guard so purge and reset never race an update
        let admission = match self.keys.get(key) {
            Some(slot) => self.admit_slot(&slot, now),
            None => {
                let slot = self.keys.entry(key.to_string()).or_insert_with(|| {
                    Mutex::new(KeyState {
                        state: LimiterState::new(&self.config, now),
                        last_seen: now,
                    })
                });
                self.admit_slot(&slot, now)
            }
        };

        if admission.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            debug!(
                limiter = %self.name,
                key = key,
                used = admission.used,
                limit = admission.limit,
                "Request allowed"
            );
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                limiter = %self.name,
                key = key,
                limit = admission.limit,
                retry_after_ms = admission.retry_after.map(|d| d.as_millis() as u64),
                "Request rate limited"
            );
        }
        admission
    }

    fn admit_slot(&self, slot: &Mutex<KeyState>, now: Instant) -> Admission {
        let mut entry = lock(slot);
        entry.last_seen = now;
        entry.state.admit(&self.config, now, self.epoch)
    }

    /// Forget state for every key
    pub fn reset(&self) {
        self.keys.clear();
        info!("Rate limiter '{}' reset", self.name);
    }

    /// Drop key state untouched for at least `max_idle`; returns keys removed
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        let before = self.keys.len();
        let now = Instant::now();
        self.keys
            .retain(|_, slot| now.saturating_duration_since(lock(slot).last_seen) < max_idle);
        let removed = before.saturating_sub(self.keys.len());
        if removed > 0 {
            info!("Rate limiter '{}' purged {} idle keys", self.name, removed);
        }
        removed
    }

    /// Get rate limiter statistics
    pub fn get_stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            name: self.name.clone(),
            algorithm: self.config.algorithm,
            keys: self.keys.len(),
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

fn lock(slot: &Mutex<KeyState>) -> MutexGuard<'_, KeyState> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
