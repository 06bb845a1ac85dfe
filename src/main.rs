//! grow-a-load: A memcached and HTTP load generator
//!
//! Each connection runs a pair of state machines:
//! - Write side: paces issuance by an inter-arrival distribution and an
//!   outstanding-request bound
//! - Read side: frames responses incrementally and matches them FIFO to
//!   outstanding requests
//!
//! Features:
//! - Memcached text protocol (get / set) and HTTP/1.1 (GET / POST)
//! - Key-space preloading before the measured run
//! - Latency histograms for sampled requests
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;
mod stats;
mod workload;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        targets = config.targets.len(),
        connections = config.total_connections(),
        depth = config.depth,
        qps = config.qps,
        records = config.records,
        update = config.update,
        "Starting grow-a-load"
    );
    for target in &config.targets {
        info!(server = %target, protocol = ?target.protocol, "Target");
    }

    let stats = runtime::run(&config)?;

    let mut latency = stats.get_latency.clone();
    latency.accumulate(&stats.set_latency);
    info!(
        issued = stats.issued,
        completed = stats.completed(),
        gets = stats.gets,
        sets = stats.sets,
        get_misses = stats.get_misses,
        skips = stats.skips,
        resets = stats.resets,
        dropped = stats.dropped,
        server_errors = stats.server_errors,
        http_errors = stats.http_errors,
        rx_bytes = stats.rx_bytes,
        tx_bytes = stats.tx_bytes,
        samples = latency.len(),
        avg_us = latency.mean().as_micros() as u64,
        p50_us = latency.value_at_quantile(0.50).as_micros() as u64,
        p99_us = latency.value_at_quantile(0.99).as_micros() as u64,
        "Run complete"
    );

    Ok(())
}
