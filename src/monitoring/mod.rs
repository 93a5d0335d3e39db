//! Monitoring: call metrics, anomaly detection, data quality and alerts

pub mod alerts;
pub mod anomaly;
pub mod metrics;
pub mod quality;

pub use alerts::{AlertConfig, AlertLevel, AlertManager, AlertNotification, AnomalyAlert};
pub use anomaly::{Anomaly, AnomalyConfig, AnomalyKind};
pub use metrics::{
    CallResult, ComponentMetrics, ComponentSnapshot, MetricsCollector, MetricsSnapshot,
    SystemMetrics, SYSTEM_COMPONENT,
};
pub use quality::DataQualityMetrics;
