//! Per-component call metrics and period snapshots
//!
//! Calls are counted into the current sampling period. The health loop
//! closes each period into a [`MetricsSnapshot`] kept in a bounded history,
//! which feeds anomaly detection and data-quality scoring.

use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Snapshots kept by default
pub const DEFAULT_SNAPSHOT_HISTORY: usize = 1000;

/// Component name used for aggregate metrics
pub const SYSTEM_COMPONENT: &str = "system";

/// How one protected call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    Success,
    Degraded,
    Failure(FailureKind),
    Rejected,
}

#[derive(Debug, Clone, Default)]
struct Counters {
    requests: u64,
    successes: u64,
    failures: u64,
    degraded: u64,
    rejected: u64,
    validation_failures: u64,
    latency_samples: u64,
    latency_total: Duration,
}

impl Counters {
    fn record(&mut self, result: CallResult, latency: Option<Duration>) {
        self.requests += 1;
        match result {
            CallResult::Success => self.successes += 1,
            CallResult::Degraded => self.degraded += 1,
            CallResult::Rejected => self.rejected += 1,
            CallResult::Failure(kind) => {
                self.failures += 1;
                if kind == FailureKind::Validation {
                    self.validation_failures += 1;
                }
            }
        }
        if let Some(latency) = latency {
            self.latency_samples += 1;
            self.latency_total += latency;
        }
    }

    fn merge(&mut self, other: &Counters) {
        self.requests += other.requests;
        self.successes += other.successes;
        self.failures += other.failures;
        self.degraded += other.degraded;
        self.rejected += other.rejected;
        self.validation_failures += other.validation_failures;
        self.latency_samples += other.latency_samples;
        self.latency_total += other.latency_total;
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.latency_samples == 0 {
            0.0
        } else {
            self.latency_total.as_secs_f64() * 1000.0 / self.latency_samples as f64
        }
    }

    fn snapshot(&self, period: Duration) -> ComponentSnapshot {
        let secs = period.as_secs_f64();
        ComponentSnapshot {
            requests: self.requests,
            successes: self.successes,
            failures: self.failures,
            degraded: self.degraded,
            rejected: self.rejected,
            validation_failures: self.validation_failures,
            avg_latency_ms: self.avg_latency_ms(),
            throughput: if secs > 0.0 {
                self.requests as f64 / secs
            } else {
                0.0
            },
        }
    }
}

/// Metrics of one component over one sampling period
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub degraded: u64,
    pub rejected: u64,
    pub validation_failures: u64,
    pub avg_latency_ms: f64,
    /// Requests per second
    pub throughput: f64,
}

impl ComponentSnapshot {
    /// Failed share of requests; zero without traffic
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.requests as f64
        }
    }
}

/// One closed sampling period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    pub aggregate: ComponentSnapshot,
    pub components: BTreeMap<String, ComponentSnapshot>,
}

impl MetricsSnapshot {
    /// Snapshot of one component, or the aggregate for [`SYSTEM_COMPONENT`]
    pub fn component(&self, name: &str) -> Option<&ComponentSnapshot> {
        if name == SYSTEM_COMPONENT {
            Some(&self.aggregate)
        } else {
            self.components.get(name)
        }
    }
}

/// Cumulative metrics since start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub degraded_requests: u64,
    pub rejected_requests: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    /// Requests per second in the last closed period
    pub throughput: f64,
    pub snapshots_retained: usize,
}

/// Cumulative metrics of one component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub degraded_requests: u64,
    pub rejected_requests: u64,
    pub avg_latency_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
}

struct CollectorState {
    period_started: Instant,
    current: HashMap<String, Counters>,
    totals: HashMap<String, Counters>,
    last_success: HashMap<String, (Instant, DateTime<Utc>)>,
    history: VecDeque<MetricsSnapshot>,
}

/// Collects call outcomes and period snapshots
pub struct MetricsCollector {
    max_snapshots: usize,
    state: Mutex<CollectorState>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_HISTORY)
    }
}

impl MetricsCollector {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            max_snapshots: max_snapshots.max(1),
            state: Mutex::new(CollectorState {
                period_started: Instant::now(),
                current: HashMap::new(),
                totals: HashMap::new(),
                last_success: HashMap::new(),
                history: VecDeque::new(),
            }),
        }
    }

    /// Count one call; `latency` is `None` for calls that never ran
    pub fn record(&self, component: &str, result: CallResult, latency: Option<Duration>) {
        let mut state = self.lock();
        state
            .current
            .entry(component.to_string())
            .or_default()
            .record(result, latency);
        state
            .totals
            .entry(component.to_string())
            .or_default()
            .record(result, latency);
        if result == CallResult::Success {
            state
                .last_success
                .insert(component.to_string(), (Instant::now(), Utc::now()));
        }
    }

    /// Close the current period into a snapshot and start a new one
    pub fn close_period(&self) -> MetricsSnapshot {
        let mut state = self.lock();
        let now = Instant::now();
        let period = now.saturating_duration_since(state.period_started);
        state.period_started = now;

        let current = std::mem::take(&mut state.current);
        let mut aggregate = Counters::default();
        let mut components = BTreeMap::new();
        for name in state.totals.keys() {
            let counters = current.get(name).cloned().unwrap_or_default();
            aggregate.merge(&counters);
            components.insert(name.clone(), counters.snapshot(period));
        }

        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            period,
            aggregate: aggregate.snapshot(period),
            components,
        };
        state.history.push_back(snapshot.clone());
        while state.history.len() > self.max_snapshots {
            state.history.pop_front();
        }
        snapshot
    }

    /// Retained snapshots, oldest first
    pub fn history(&self) -> Vec<MetricsSnapshot> {
        self.lock().history.iter().cloned().collect()
    }

    /// Series of one component (or [`SYSTEM_COMPONENT`]) over retained snapshots
    pub fn series(&self, component: &str) -> Vec<ComponentSnapshot> {
        self.lock()
            .history
            .iter()
            .map(|s| s.component(component).cloned().unwrap_or_default())
            .collect()
    }

    /// Components with a success within `window` of now
    pub fn fresh_components(&self, window: Duration) -> Vec<String> {
        let now = Instant::now();
        self.lock()
            .last_success
            .iter()
            .filter(|(_, (at, _))| now.saturating_duration_since(*at) <= window)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Cumulative metrics since start
    pub fn system_metrics(&self) -> SystemMetrics {
        let state = self.lock();
        let mut total = Counters::default();
        for counters in state.totals.values() {
            total.merge(counters);
        }
        SystemMetrics {
            total_requests: total.requests,
            successful_requests: total.successes,
            failed_requests: total.failures,
            degraded_requests: total.degraded,
            rejected_requests: total.rejected,
            error_rate: if total.requests == 0 {
                0.0
            } else {
                total.failures as f64 / total.requests as f64
            },
            avg_latency_ms: total.avg_latency_ms(),
            throughput: state
                .history
                .back()
                .map(|s| s.aggregate.throughput)
                .unwrap_or(0.0),
            snapshots_retained: state.history.len(),
        }
    }

    /// Cumulative metrics of one component
    pub fn component_metrics(&self, component: &str) -> Option<ComponentMetrics> {
        let state = self.lock();
        let totals = state.totals.get(component)?;
        Some(ComponentMetrics {
            total_requests: totals.requests,
            successful_requests: totals.successes,
            failed_requests: totals.failures,
            degraded_requests: totals.degraded,
            rejected_requests: totals.rejected,
            avg_latency_ms: totals.avg_latency_ms(),
            last_success: state.last_success.get(component).map(|(_, at)| *at),
        })
    }

    /// Start tracking a component before its first call
    pub fn track(&self, component: &str) {
        self.lock().totals.entry(component.to_string()).or_default();
    }

    /// Forget a component
    pub fn remove(&self, component: &str) {
        let mut state = self.lock();
        state.current.remove(component);
        state.totals.remove(component);
        state.last_success.remove(component);
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
