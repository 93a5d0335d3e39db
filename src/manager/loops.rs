//! Background health, anomaly and data-quality cycles
//!
//! Each cycle is a plain async method so it can be driven directly in tests;
//! [`ReliabilityManager::start`](super::ReliabilityManager::start) runs them
//! on intervals until cancelled.

use super::ReliabilityManager;
use crate::error_recovery::CircuitState;
use crate::health::{probe, HealthCheckResult};
use crate::monitoring::alerts::AlertLevel;
use crate::monitoring::anomaly::{detect, Anomaly};
use crate::monitoring::metrics::{ComponentSnapshot, MetricsSnapshot, SYSTEM_COMPONENT};
use crate::monitoring::quality::DataQualityMetrics;
use futures::future::join_all;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const QUALITY_COMPONENT: &str = "data_quality";

impl ReliabilityManager {
    /// Probe health checks, close the sampling period and check thresholds
    pub async fn run_health_check_cycle(&self) -> MetricsSnapshot {
        let components = self.registry.snapshot();
        let timeout = self.config.health_check_timeout;

        let results: Vec<HealthCheckResult> = join_all(
            components
                .health_checks
                .iter()
                .map(|(name, check)| probe(name, check, timeout)),
        )
        .await;

        for result in &results {
            if !result.healthy {
                self.alerts.raise(
                    AlertLevel::Critical,
                    &result.name,
                    format!(
                        "Health check failed: {}",
                        result.error.as_deref().unwrap_or("unhealthy")
                    ),
                );
            }
        }
        {
            let mut stored = self.health_results_mut();
            for result in results {
                stored.insert(result.name.clone(), result);
            }
        }

        for (name, breaker) in &components.breakers {
            if breaker.state().await == CircuitState::Open {
                self.alerts.raise(
                    AlertLevel::Warning,
                    name,
                    format!("Circuit breaker '{name}' is open"),
                );
            }
        }

        let snapshot = self.metrics.close_period();
        self.check_thresholds(SYSTEM_COMPONENT, &snapshot.aggregate);
        for (name, component) in &snapshot.components {
            self.check_thresholds(name, component);
        }

        debug!(
            requests = snapshot.aggregate.requests,
            error_rate = snapshot.aggregate.error_rate(),
            avg_latency_ms = snapshot.aggregate.avg_latency_ms,
            "Health check cycle completed"
        );
        snapshot
    }

    fn check_thresholds(&self, component: &str, snapshot: &ComponentSnapshot) {
        let thresholds = &self.config.thresholds;
        if snapshot.requests == 0 {
            return;
        }

        if snapshot.avg_latency_ms > thresholds.max_latency_ms {
            self.alerts.raise(
                AlertLevel::Warning,
                component,
                format!(
                    "Average latency {:.0}ms exceeds {:.0}ms",
                    snapshot.avg_latency_ms, thresholds.max_latency_ms
                ),
            );
        }
        if snapshot.error_rate() > thresholds.max_error_rate {
            self.alerts.raise(
                AlertLevel::Critical,
                component,
                format!(
                    "Error rate {:.1}% exceeds {:.1}%",
                    snapshot.error_rate() * 100.0,
                    thresholds.max_error_rate * 100.0
                ),
            );
        }
        if thresholds.min_throughput > 0.0 && snapshot.throughput < thresholds.min_throughput {
            self.alerts.raise(
                AlertLevel::Info,
                component,
                format!(
                    "Throughput {:.2}/s below {:.2}/s",
                    snapshot.throughput, thresholds.min_throughput
                ),
            );
        }
    }

    /// Compare recent and historical averages and alert on anomalies
    pub async fn run_anomaly_detection_cycle(&self) -> Vec<Anomaly> {
        let config = &self.config.anomaly;
        let mut names = vec![SYSTEM_COMPONENT.to_string()];
        names.extend(self.registry.snapshot().names());

        let anomalies: Vec<Anomaly> = names
            .iter()
            .flat_map(|name| detect(name, &self.metrics.series(name), config))
            .collect();

        for anomaly in &anomalies {
            self.alerts
                .raise(anomaly.level, &anomaly.component, anomaly.message.clone());
        }
        if !anomalies.is_empty() {
            info!("Anomaly detection found {} anomalies", anomalies.len());
        }
        anomalies
    }

    /// Score data quality, alert on breaches and purge idle limiter keys
    pub async fn run_data_quality_cycle(&self) -> DataQualityMetrics {
        let components = self.registry.snapshot();
        let names = components.names();
        let fresh = self
            .metrics
            .fresh_components(self.config.freshness_window)
            .into_iter()
            .filter(|name| names.contains(name))
            .count();

        let quality = DataQualityMetrics::score(&self.metrics.history(), fresh, names.len());
        *self.quality_mut() = quality.clone();

        let thresholds = &self.config.thresholds;
        if quality.completeness < thresholds.min_completeness {
            self.alerts.raise(
                AlertLevel::Warning,
                &format!("{QUALITY_COMPONENT}.completeness"),
                format!(
                    "Completeness {:.2} below {:.2}",
                    quality.completeness, thresholds.min_completeness
                ),
            );
        }
        if quality.overall < thresholds.min_quality_score {
            self.alerts.raise(
                AlertLevel::Warning,
                &format!("{QUALITY_COMPONENT}.overall"),
                format!(
                    "Quality score {:.2} below {:.2}",
                    quality.overall, thresholds.min_quality_score
                ),
            );
        }
        if quality.drift > thresholds.max_drift {
            self.alerts.raise(
                AlertLevel::Warning,
                &format!("{QUALITY_COMPONENT}.drift"),
                format!("Drift {:.2} exceeds {:.2}", quality.drift, thresholds.max_drift),
            );
        }

        for limiter in components.limiters.values() {
            limiter.purge_idle(self.config.idle_key_ttl);
        }

        debug!(overall = quality.overall, "Data quality cycle completed");
        quality
    }

    /// Start the background loops; a second call while running does nothing
    pub fn start(self: &Arc<Self>) {
        let mut running = self.loops_mut();
        if running.is_some() {
            debug!("Reliability manager loops already running");
            return;
        }

        let cancel = CancellationToken::new();
        let weak = Arc::downgrade(self);
        let health = self.config.health_check_interval;

        let tasks = vec![
            spawn_cycle("health", health, cancel.clone(), weak.clone(), |m| async move {
                m.run_health_check_cycle().await;
            }),
            spawn_cycle(
                "anomaly",
                self.config.anomaly_check_interval,
                cancel.clone(),
                weak.clone(),
                |m| async move {
                    m.run_anomaly_detection_cycle().await;
                },
            ),
            spawn_cycle("data_quality", health * 2, cancel.clone(), weak, |m| async move {
                m.run_data_quality_cycle().await;
            }),
        ];

        *running = Some(LoopHandles { cancel, tasks });
        info!(
            "Reliability manager started (health every {:?}, anomaly every {:?})",
            health, self.config.anomaly_check_interval
        );
    }

    /// Whether the background loops are running
    pub fn is_running(&self) -> bool {
        self.loops_mut().is_some()
    }

    /// Stop the background loops and wait for them to finish
    pub async fn shutdown(&self) {
        let handles = self.loops_mut().take();
        let Some(LoopHandles { cancel, tasks }) = handles else {
            return;
        };

        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background loop ended abnormally: {}", e);
            }
        }
        info!("Reliability manager stopped");
    }
}

pub(crate) struct LoopHandles {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

fn spawn_cycle<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    manager: Weak<ReliabilityManager>,
    cycle: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<ReliabilityManager>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(manager) = manager.upgrade() else {
                break;
            };
            if AssertUnwindSafe(cycle(manager)).catch_unwind().await.is_err() {
                error!("{} cycle panicked", name);
            }
        }
        debug!("{} loop stopped", name);
    })
}
