//! Admission algorithms and their per-key state

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::{Admission, RateLimiterConfig};

/// Admission control algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Tokens refill at `rate`/s up to `burst`
    TokenBucket,
    /// Volume drains at `rate`/s; admits while it fits in `burst`
    LeakyBucket,
    /// At most `rate` admits in any trailing `window`
    SlidingWindow,
    /// At most `rate` admits per aligned `window`
    FixedWindow,
}

/// Per-key limiter state
#[derive(Debug, Clone)]
pub(crate) enum LimiterState {
    TokenBucket { tokens: f64, last_refill: Instant },
    LeakyBucket { volume: f64, last_leak: Instant },
    SlidingWindow { timestamps: VecDeque<Instant> },
    FixedWindow { window_index: u64, count: u32 },
}

impl LimiterState {
    pub(crate) fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        match config.algorithm {
            RateLimitAlgorithm::TokenBucket => LimiterState::TokenBucket {
                tokens: f64::from(config.burst),
                last_refill: now,
            },
            RateLimitAlgorithm::LeakyBucket => LimiterState::LeakyBucket {
                volume: 0.0,
                last_leak: now,
            },
            RateLimitAlgorithm::SlidingWindow => LimiterState::SlidingWindow {
                timestamps: VecDeque::new(),
            },
            RateLimitAlgorithm::FixedWindow => LimiterState::FixedWindow {
                window_index: 0,
                count: 0,
            },
        }
    }

    /// Decide one request at `now`; `epoch` anchors fixed windows
    pub(crate) fn admit(
        &mut self,
        config: &RateLimiterConfig,
        now: Instant,
        epoch: Instant,
    ) -> Admission {
        match self {
            LimiterState::TokenBucket {
                tokens,
                last_refill,
            } => {
                let rate = config.rate;
                let burst = f64::from(config.burst);
                let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * rate).min(burst);
                *last_refill = now;

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    Admission::granted(config.burst, whole(*tokens))
                } else {
                    let wait = (1.0 - *tokens) / rate;
                    Admission::denied(config.burst, whole(*tokens), seconds(wait))
                }
            }
            LimiterState::LeakyBucket { volume, last_leak } => {
                let rate = config.rate;
                let capacity = f64::from(config.burst);
                let elapsed = now.saturating_duration_since(*last_leak).as_secs_f64();
                *volume = (*volume - elapsed * rate).max(0.0);
                *last_leak = now;

                if *volume + 1.0 <= capacity {
                    *volume += 1.0;
                    Admission::granted(config.burst, whole(capacity - *volume))
                } else {
                    let wait = (*volume + 1.0 - capacity) / rate;
                    Admission::denied(config.burst, whole(capacity - *volume), seconds(wait))
                }
            }
            LimiterState::SlidingWindow { timestamps } => {
                let limit = config.window_limit();
                while timestamps
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) >= config.window)
                {
                    timestamps.pop_front();
                }

                let used = timestamps.len() as u32;
                if used < limit {
                    timestamps.push_back(now);
                    Admission::granted(limit, limit - used - 1)
                } else {
                    let wait = timestamps
                        .front()
                        .map(|oldest| config.window.saturating_sub(now.saturating_duration_since(*oldest)))
                        .unwrap_or(config.window);
                    Admission::denied(limit, 0, wait)
                }
            }
            LimiterState::FixedWindow {
                window_index,
                count,
            } => {
                let limit = config.window_limit();
                let window_nanos = config.window.as_nanos().max(1);
                let since_epoch = now.saturating_duration_since(epoch).as_nanos();
                let index = u64::try_from(since_epoch / window_nanos).unwrap_or(u64::MAX);
                if index != *window_index {
                    *window_index = index;
                    *count = 0;
                }

                if *count < limit {
                    *count += 1;
                    Admission::granted(limit, limit - *count)
                } else {
                    let into_window = since_epoch % window_nanos;
                    let wait = u64::try_from(window_nanos - into_window)
                        .map(Duration::from_nanos)
                        .unwrap_or(config.window);
                    Admission::denied(limit, 0, wait)
                }
            }
        }
    }
}

fn whole(value: f64) -> u32 {
    value.max(0.0).floor() as u32
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}
