//! Reliability monitor - Main Entry Point
//!
//! Loads the resilience configuration, starts the manager's background
//! loops and drives a synthetic probe workload through every configured
//! component. When the run ends the comprehensive status is printed as JSON.

use clap::Parser;
use collector_resilience::{
    logging::{init_logging, LogConfig},
    ExecuteOptions, Outcome, ReliabilityConfig, ReliabilityManager,
};
use humantime_serde::re::humantime;
use rand::Rng;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Reliability monitor configuration
#[derive(Parser, Debug)]
#[command(name = "reliability-monitor")]
#[command(about = "Exercise and monitor the collector resilience layer")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "RELIABILITY_CONFIG")]
    config: Option<PathBuf>,

    /// How long to run the probe workload
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Delay between probe rounds
    #[arg(long, default_value = "250ms", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Probability that a synthetic probe fails
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ReliabilityConfig::load(cli.config.as_deref())?;
    let mut log_config = LogConfig {
        json: cli.json_logs || config.logging.json,
        ..config.logging.clone()
    };
    if cli.debug {
        log_config.level = "debug".to_string();
    }
    init_logging(&log_config)?;

    if !(0.0..=1.0).contains(&cli.failure_rate) {
        anyhow::bail!("--failure-rate must be within [0, 1]");
    }

    let manager = Arc::new(ReliabilityManager::from_config(&config)?);
    manager.start();

    let mut components: BTreeSet<String> = config
        .circuit_breakers
        .keys()
        .chain(config.rate_limiters.keys())
        .cloned()
        .collect();
    if components.is_empty() {
        components.insert("synthetic".to_string());
    }
    info!(
        "Probing {} component(s) for {:?}",
        components.len(),
        cli.duration
    );

    let deadline = tokio::time::sleep(cli.duration);
    tokio::pin!(deadline);
    let mut rounds = 0u64;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::time::sleep(cli.interval) => {}
        }
        rounds += 1;

        for component in &components {
            let outcome = manager
                .execute(
                    component,
                    "probe",
                    || synthetic_probe(cli.failure_rate),
                    ExecuteOptions::new().with_cache_key(format!("{component}:probe")),
                )
                .await;
            if let Outcome::Failure(kind, error) = outcome {
                warn!("Probe of '{}' failed ({}): {}", component, kind, error);
            }
        }
    }

    info!("Completed {} probe rounds", rounds);
    let status = manager.get_comprehensive_status().await;
    manager.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn synthetic_probe(failure_rate: f64) -> anyhow::Result<u64> {
    let (latency_ms, fails) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(5..50), rng.gen_bool(failure_rate))
    };
    tokio::time::sleep(Duration::from_millis(latency_ms)).await;

    if fails {
        anyhow::bail!("connection reset by peer");
    }
    Ok(latency_ms)
}
