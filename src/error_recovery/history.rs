//! Bounded append-only attempt log shared by the retry engine and breakers

use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Length at which the history is trimmed
pub const HISTORY_HIGH_WATER: usize = 10_000;

/// Length kept after a trim
pub const HISTORY_TRIM_TO: usize = 5_000;

/// One attempt of a protected operation
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub failure_kind: Option<FailureKind>,
    pub message: Option<String>,
    #[serde(with = "humantime_serde")]
    pub delay_before: Duration,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) recorded_at: Instant,
}

impl AttemptRecord {
    pub fn success(attempt_number: u32, delay_before: Duration, duration: Duration) -> Self {
        Self {
            attempt_number,
            failure_kind: None,
            message: None,
            delay_before,
            duration,
            success: true,
            timestamp: Utc::now(),
            recorded_at: Instant::now(),
        }
    }

    pub fn failure(
        attempt_number: u32,
        kind: FailureKind,
        message: String,
        delay_before: Duration,
        duration: Duration,
    ) -> Self {
        Self {
            attempt_number,
            failure_kind: Some(kind),
            message: Some(message),
            delay_before,
            duration,
            success: false,
            timestamp: Utc::now(),
            recorded_at: Instant::now(),
        }
    }
}

/// Attempt records, trimmed to the most recent entries past a high-water mark
#[derive(Debug)]
pub struct AttemptHistory {
    records: VecDeque<AttemptRecord>,
    high_water: usize,
    trim_to: usize,
}

impl Default for AttemptHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptHistory {
    pub fn new() -> Self {
        Self::with_limits(HISTORY_HIGH_WATER, HISTORY_TRIM_TO)
    }

    /// Custom limits; `trim_to` is clamped to `high_water`
    pub fn with_limits(high_water: usize, trim_to: usize) -> Self {
        let high_water = high_water.max(1);
        Self {
            records: VecDeque::new(),
            high_water,
            trim_to: trim_to.min(high_water),
        }
    }

    pub fn push(&mut self, record: AttemptRecord) {
        self.records.push_back(record);
        if self.records.len() > self.high_water {
            let excess = self.records.len() - self.trim_to;
            self.records.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &AttemptRecord> {
        self.records.iter()
    }

    /// Most recent `n` records, oldest first
    pub fn recent(&self, n: usize) -> Vec<AttemptRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// (requests, failures) recorded within `window` of `now`
    pub fn windowed_counts(&self, window: Duration, now: Instant) -> (usize, usize) {
        self.records
            .iter()
            .rev()
            .take_while(|r| now.saturating_duration_since(r.recorded_at) <= window)
            .fold((0, 0), |(total, failed), r| {
                (total + 1, failed + usize::from(!r.success))
            })
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_keeps_most_recent() {
        let mut history = AttemptHistory::with_limits(10, 5);
        for n in 1..=11 {
            history.push(AttemptRecord::success(n, Duration::ZERO, Duration::ZERO));
        }
        assert_eq!(history.len(), 5);
        let numbers: Vec<u32> = history.iter().map(|r| r.attempt_number).collect();
        assert_eq!(numbers, vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_length_never_exceeds_high_water() {
        let mut history = AttemptHistory::new();
        for n in 0..(HISTORY_HIGH_WATER as u32 * 2 + 17) {
            history.push(AttemptRecord::success(n, Duration::ZERO, Duration::ZERO));
            assert!(history.len() <= HISTORY_HIGH_WATER);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_windowed_counts() {
        let mut history = AttemptHistory::new();
        history.push(AttemptRecord::failure(
            1,
            FailureKind::Timeout,
            "slow".into(),
            Duration::ZERO,
            Duration::ZERO,
        ));
        tokio::time::advance(Duration::from_secs(30)).await;
        history.push(AttemptRecord::success(1, Duration::ZERO, Duration::ZERO));
        history.push(AttemptRecord::failure(
            1,
            FailureKind::Server,
            "502".into(),
            Duration::ZERO,
            Duration::ZERO,
        ));

        let now = Instant::now();
        assert_eq!(history.windowed_counts(Duration::from_secs(10), now), (2, 1));
        assert_eq!(history.windowed_counts(Duration::from_secs(60), now), (3, 2));
    }
}
