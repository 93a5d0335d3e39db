//! Moving-average anomaly detection over period snapshots

use super::alerts::AlertLevel;
use super::metrics::ComponentSnapshot;
use serde::{Deserialize, Serialize};

/// Anomaly detection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Snapshots in the recent average
    pub recent_window: usize,
    /// Snapshots in the historical average
    pub historical_window: usize,
    /// Recent latency above `historical * factor` is a spike
    pub latency_factor: f64,
    /// Recent throughput below `historical * (1 - drop)` is a collapse
    pub throughput_drop: f64,
    /// Periods summed for the failure burst check
    pub failure_periods: usize,
    /// Failures above this across `failure_periods` is a burst
    pub failure_threshold: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            recent_window: 10,
            historical_window: 100,
            latency_factor: 2.0,
            throughput_drop: 0.5,
            failure_periods: 5,
            failure_threshold: 10,
        }
    }
}

/// Kind of anomaly detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    LatencySpike,
    ThroughputCollapse,
    FailureBurst,
}

/// One detected anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub component: String,
    pub kind: AnomalyKind,
    pub level: AlertLevel,
    pub observed: f64,
    pub baseline: f64,
    pub message: String,
}

/// Evaluate one component's series, oldest first
pub fn detect(component: &str, series: &[ComponentSnapshot], config: &AnomalyConfig) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    if series.len() > config.recent_window {
        let historical = tail(series, config.historical_window);
        let recent = tail(series, config.recent_window);

        let latency_of = |s: &[ComponentSnapshot]| {
            mean(s.iter().filter(|x| x.requests > 0).map(|x| x.avg_latency_ms))
        };
        if let (Some(recent_latency), Some(historical_latency)) =
            (latency_of(recent), latency_of(historical))
        {
            if historical_latency > 0.0 && recent_latency > historical_latency * config.latency_factor {
                anomalies.push(Anomaly {
                    component: component.to_string(),
                    kind: AnomalyKind::LatencySpike,
                    level: AlertLevel::Warning,
                    observed: recent_latency,
                    baseline: historical_latency,
                    message: format!(
                        "Latency spike: {recent_latency:.1}ms recent vs {historical_latency:.1}ms historical"
                    ),
                });
            }
        }

        let throughput_of = |s: &[ComponentSnapshot]| mean(s.iter().map(|x| x.throughput));
        if let (Some(recent_tp), Some(historical_tp)) =
            (throughput_of(recent), throughput_of(historical))
        {
            if historical_tp > 0.0 && recent_tp < historical_tp * (1.0 - config.throughput_drop) {
                anomalies.push(Anomaly {
                    component: component.to_string(),
                    kind: AnomalyKind::ThroughputCollapse,
                    level: AlertLevel::Warning,
                    observed: recent_tp,
                    baseline: historical_tp,
                    message: format!(
                        "Throughput collapse: {recent_tp:.2}/s recent vs {historical_tp:.2}/s historical"
                    ),
                });
            }
        }
    }

    let failures: u64 = tail(series, config.failure_periods)
        .iter()
        .map(|s| s.failures)
        .sum();
    if failures > config.failure_threshold {
        anomalies.push(Anomaly {
            component: component.to_string(),
            kind: AnomalyKind::FailureBurst,
            level: AlertLevel::Critical,
            observed: failures as f64,
            baseline: config.failure_threshold as f64,
            message: format!(
                "{failures} failures across the last {} periods",
                config.failure_periods
            ),
        });
    }

    anomalies
}

fn tail<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

pub(crate) fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(requests: u64, failures: u64, latency: f64, throughput: f64) -> ComponentSnapshot {
        ComponentSnapshot {
            requests,
            successes: requests - failures,
            failures,
            avg_latency_ms: latency,
            throughput,
            ..Default::default()
        }
    }

    #[test]
    fn test_steady_series_is_quiet() {
        let series = vec![sample(10, 0, 50.0, 1.0); 40];
        assert!(detect("binance", &series, &AnomalyConfig::default()).is_empty());
    }

    #[test]
    fn test_latency_spike() {
        let mut series = vec![sample(10, 0, 50.0, 1.0); 90];
        series.extend(vec![sample(10, 0, 400.0, 1.0); 10]);
        let anomalies = detect("binance", &series, &AnomalyConfig::default());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::LatencySpike);
    }

    #[test]
    fn test_throughput_collapse() {
        let mut series = vec![sample(10, 0, 50.0, 10.0); 90];
        series.extend(vec![sample(1, 0, 50.0, 0.1); 10]);
        let kinds: Vec<AnomalyKind> = detect("kraken", &series, &AnomalyConfig::default())
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(kinds, vec![AnomalyKind::ThroughputCollapse]);
    }

    #[test]
    fn test_failure_burst_needs_few_samples() {
        let series = vec![sample(5, 3, 50.0, 1.0), sample(5, 4, 50.0, 1.0), sample(5, 4, 50.0, 1.0)];
        let anomalies = detect("s3", &series, &AnomalyConfig::default());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::FailureBurst);
        assert_eq!(anomalies[0].level, AlertLevel::Critical);
    }
}
