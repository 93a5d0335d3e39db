//! Logging configuration
//!
//! Installs a `tracing` subscriber with an `EnvFilter` and either a plain
//! or a JSON formatter on stderr.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
    /// Include thread IDs
    pub thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            thread_ids: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(rust_log) = std::env::var("RUST_LOG") {
            // Keep the most verbose bare level mentioned
            for level in ["trace", "debug", "info", "warn", "error"] {
                if rust_log.contains(level) {
                    config.level = level.to_string();
                    break;
                }
            }
        }

        if let Ok(json) = std::env::var("RELIABILITY_LOG_JSON") {
            config.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// Parsed default level, falling back to INFO
    pub fn level(&self) -> Level {
        self.level.parse().unwrap_or(Level::INFO)
    }
}

/// Initialize logging with the given configuration
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level().into())
        .from_env_lossy();

    if config.json {
        let subscriber = tracing_subscriber::registry().with(env_filter).with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_thread_ids(config.thread_ids),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = tracing_subscriber::registry().with(env_filter).with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(config.thread_ids),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
