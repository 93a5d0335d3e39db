//! Data-quality scoring

use super::anomaly::mean;
use super::metrics::MetricsSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshots used for the recent latency average and consistency
const RECENT_SNAPSHOTS: usize = 10;

/// Snapshots used for the historical latency average
const HISTORICAL_SNAPSHOTS: usize = 100;

/// Quality scores, each within [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityMetrics {
    /// Share of components with a recent success
    pub freshness: f64,
    /// Successful share of requests
    pub completeness: f64,
    /// Share of requests not rejected as invalid
    pub accuracy: f64,
    /// One minus the latency coefficient of variation
    pub consistency: f64,
    /// Relative shift of recent latency from its history; higher is worse
    pub drift: f64,
    /// Mean of the above with drift inverted
    pub overall: f64,
    pub timestamp: DateTime<Utc>,
}

impl Default for DataQualityMetrics {
    fn default() -> Self {
        Self {
            freshness: 1.0,
            completeness: 1.0,
            accuracy: 1.0,
            consistency: 1.0,
            drift: 0.0,
            overall: 1.0,
            timestamp: Utc::now(),
        }
    }
}

impl DataQualityMetrics {
    /// Score `history` (oldest first) with `fresh` of `total` components fresh
    pub fn score(history: &[MetricsSnapshot], fresh: usize, total: usize) -> Self {
        let freshness = if total == 0 {
            1.0
        } else {
            fresh.min(total) as f64 / total as f64
        };

        let (requests, successes, invalid) = history.iter().fold((0u64, 0u64, 0u64), |acc, s| {
            (
                acc.0 + s.aggregate.requests,
                acc.1 + s.aggregate.successes,
                acc.2 + s.aggregate.validation_failures,
            )
        });
        let (completeness, accuracy) = if requests == 0 {
            (1.0, 1.0)
        } else {
            (
                successes as f64 / requests as f64,
                1.0 - invalid as f64 / requests as f64,
            )
        };

        let latencies: Vec<f64> = history
            .iter()
            .filter(|s| s.aggregate.requests > s.aggregate.rejected)
            .map(|s| s.aggregate.avg_latency_ms)
            .collect();
        let recent = &latencies[latencies.len().saturating_sub(RECENT_SNAPSHOTS)..];
        let historical = &latencies[latencies.len().saturating_sub(HISTORICAL_SNAPSHOTS)..];

        let consistency = match mean(recent.iter().copied()) {
            Some(m) if m > 0.0 => {
                let variance = recent.iter().map(|v| (v - m).powi(2)).sum::<f64>() / recent.len() as f64;
                clamp_unit(1.0 - variance.sqrt() / m)
            }
            _ => 1.0,
        };

        let drift = match (mean(recent.iter().copied()), mean(historical.iter().copied())) {
            (Some(r), Some(h)) if h > 0.0 => clamp_unit((r - h).abs() / h),
            _ => 0.0,
        };

        let overall = (freshness + completeness + accuracy + consistency + (1.0 - drift)) / 5.0;

        Self {
            freshness,
            completeness: clamp_unit(completeness),
            accuracy: clamp_unit(accuracy),
            consistency,
            drift,
            overall: clamp_unit(overall),
            timestamp: Utc::now(),
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
