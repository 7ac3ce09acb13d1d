use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::info;

use crate::config::{self, ApiConfig};
use crate::sim::{self, SimulationOptions};

/// Validate command - load a configuration and print it with defaults applied
pub fn cmd_validate(path: &str) -> Result<()> {
    let config = config::load_from_file(path)?;
    print_config(&config)?;
    info!(path = %path, "Configuration is valid");
    Ok(())
}

/// Simulate command - run the balancer against an in-memory transport
pub async fn cmd_simulate(
    config_path: Option<&str>,
    calls: usize,
    concurrency: usize,
    deadline_rate: f64,
    connect_delay_ms: u64,
) -> Result<()> {
    if !(0.0..=1.0).contains(&deadline_rate) {
        bail!("--deadline-rate must be between 0 and 1, got {}", deadline_rate);
    }
    if concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }

    let config = config::load_config(config_path)?;

    let options = SimulationOptions {
        calls,
        concurrency,
        deadline_rate,
        connect_delay: Duration::from_millis(connect_delay_ms),
        ..SimulationOptions::default()
    };

    let report = sim::run_simulation(config, options).await?;
    let json = serde_json::to_string_pretty(&report).context("Failed to encode report")?;
    println!("{}", json);
    Ok(())
}

fn print_config(config: &ApiConfig) -> Result<()> {
    let raw = config::to_json(config)?;
    let value: serde_json::Value = serde_json::from_slice(&raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
