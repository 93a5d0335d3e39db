//! Alert lifecycle: raise with deduplication, resolve, notify

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Informational alert
    Info,
    /// Warning alert
    Warning,
    /// Critical alert
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        })
    }
}

/// Alert information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyAlert {
    /// Unique alert ID
    pub id: String,
    pub level: AlertLevel,
    pub component: String,
    pub message: String,
    /// When alert was raised
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    /// When alert was resolved (if resolved)
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Payload delivered to alert subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub alert_id: String,
    pub level: AlertLevel,
    pub component: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&AnomalyAlert> for AlertNotification {
    fn from(alert: &AnomalyAlert) -> Self {
        Self {
            alert_id: alert.id.clone(),
            level: alert.level,
            component: alert.component.clone(),
            message: alert.message.clone(),
            timestamp: alert.timestamp,
        }
    }
}

/// Alert configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Window in which a repeat (component, level) alert is suppressed
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Maximum resolved alerts to keep
    pub max_alert_history: usize,
    /// Buffered notifications per subscriber
    pub event_buffer_size: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            max_alert_history: 1000,
            event_buffer_size: 256,
        }
    }
}

type AlertCallback = Arc<dyn Fn(&AlertNotification) -> anyhow::Result<()> + Send + Sync>;

struct ActiveAlert {
    alert: AnomalyAlert,
    raised_at: Instant,
}

#[derive(Default)]
struct AlertState {
    active: HashMap<String, ActiveAlert>,
    by_source: HashMap<(String, AlertLevel), String>,
    history: VecDeque<AnomalyAlert>,
}

/// Alert manager for anomaly and health alerts
pub struct AlertManager {
    config: AlertConfig,
    state: Mutex<AlertState>,
    callbacks: RwLock<Vec<AlertCallback>>,
    events: broadcast::Sender<AlertNotification>,
}

impl AlertManager {
    /// Create new alert manager
    pub fn new(config: AlertConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));
        Self {
            config,
            state: Mutex::new(AlertState::default()),
            callbacks: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Raise an alert; `None` when suppressed by the cooldown
    pub fn raise(
        &self,
        level: AlertLevel,
        component: &str,
        message: impl Into<String>,
    ) -> Option<AnomalyAlert> {
        let message = message.into();
        let source = (component.to_string(), level);
        let now = Instant::now();

        let alert = {
            let mut state = self.lock_state();

            if let Some(existing_id) = state.by_source.get(&source).cloned() {
                let recent = state
                    .active
                    .get(&existing_id)
                    .is_some_and(|a| now.saturating_duration_since(a.raised_at) < self.config.cooldown);
                if recent {
                    debug!(
                        "Alert suppressed for {} ({}): {}",
                        component, level, message
                    );
                    return None;
                }
                // An older alert for the same source is superseded
                Self::move_to_history(&mut state, &existing_id, self.config.max_alert_history);
            }

            let alert = AnomalyAlert {
                id: Uuid::new_v4().to_string(),
                level,
                component: component.to_string(),
                message,
                timestamp: Utc::now(),
                resolved: false,
                resolved_at: None,
            };
            state.by_source.insert(source, alert.id.clone());
            state.active.insert(
                alert.id.clone(),
                ActiveAlert {
                    alert: alert.clone(),
                    raised_at: now,
                },
            );
            alert
        };

        match level {
            AlertLevel::Critical => error!("Alert raised for {}: {}", alert.component, alert.message),
            AlertLevel::Warning => warn!("Alert raised for {}: {}", alert.component, alert.message),
            AlertLevel::Info => info!("Alert raised for {}: {}", alert.component, alert.message),
        }
        self.notify(&AlertNotification::from(&alert));
        Some(alert)
    }

    /// Resolve an active alert; `false` if the id is not active
    pub fn resolve(&self, alert_id: &str) -> bool {
        let mut state = self.lock_state();
        let resolved = Self::move_to_history(&mut state, alert_id, self.config.max_alert_history);
        if resolved {
            info!("Alert resolved: {}", alert_id);
        }
        resolved
    }

    fn move_to_history(state: &mut AlertState, alert_id: &str, max_history: usize) -> bool {
        let Some(ActiveAlert { mut alert, .. }) = state.active.remove(alert_id) else {
            return false;
        };
        let source = (alert.component.clone(), alert.level);
        if state.by_source.get(&source).is_some_and(|id| id == alert_id) {
            state.by_source.remove(&source);
        }
        alert.resolved = true;
        alert.resolved_at = Some(Utc::now());
        state.history.push_back(alert);
        while state.history.len() > max_history {
            state.history.pop_front();
        }
        true
    }

    /// Active alerts, oldest first
    pub fn active_alerts(&self) -> Vec<AnomalyAlert> {
        let state = self.lock_state();
        let mut alerts: Vec<AnomalyAlert> =
            state.active.values().map(|a| a.alert.clone()).collect();
        alerts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    /// Most recently resolved alerts, oldest first
    pub fn recent_alerts(&self, n: usize) -> Vec<AnomalyAlert> {
        let state = self.lock_state();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Resolve every active alert of a component
    pub fn resolve_component(&self, component: &str) -> usize {
        let mut state = self.lock_state();
        let ids: Vec<String> = state
            .active
            .values()
            .filter(|a| a.alert.component == component)
            .map(|a| a.alert.id.clone())
            .collect();
        for id in &ids {
            Self::move_to_history(&mut state, id, self.config.max_alert_history);
        }
        ids.len()
    }

    /// Register a callback for new alerts
    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&AlertNotification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    /// Subscribe to alert notifications
    pub fn subscribe(&self) -> broadcast::Receiver<AlertNotification> {
        self.events.subscribe()
    }

    fn notify(&self, notification: &AlertNotification) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for callback in callbacks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(notification))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Alert callback failed for {}: {:#}", notification.alert_id, e),
                Err(_) => error!("Alert callback panicked for {}", notification.alert_id),
            }
        }
        // No receivers is not an error
        let _ = self.events.send(notification.clone());
    }

    fn lock_state(&self) -> MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
