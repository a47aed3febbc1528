mod alerts;
mod cli;
mod config;
mod lifecycle;
mod ml_sink;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::sync::Once;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use platform_linux::pmu::{PerfCounterGroup, PmuError};
use platform_linux::preflight;

use cli::Args;
use config::SentinelConfig;
use lifecycle::SentinelRuntime;

fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();

    let mut config = SentinelConfig::default();
    if let Some(path) = &args.config {
        let bad_lines = config
            .load_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        if bad_lines > 0 {
            warn!(
                config = %path.display(),
                bad_lines,
                "configuration loaded with errors"
            );
        }
    }
    args.apply(&mut config);

    // Both "any pid" and "any cpu" at once is not a valid perf scope;
    // fall back to watching ourselves across all CPUs.
    if config.target_pid == -1 && config.target_cpu == -1 {
        config.target_pid = 0;
    }

    if config.verbose {
        info!(?config, "active configuration");
    }

    preflight::run_preflight_checks();

    if config.pmu_test {
        return pmu_self_test(&config);
    }

    info!(
        interval_us = config.sampling_interval_us,
        learning_sec = config.learning_duration_sec,
        z_threshold = config.z_threshold,
        "cpu-sentinel starting"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .context("failed to register shutdown signal handler")?;
    }

    let mut runtime = SentinelRuntime::new(config, shutdown)?;
    runtime.run()
}

/// Open the counter group, read it once, print the raw values and exit.
/// The quickest way to tell a paranoid-sysctl problem from a VM that simply
/// has no PMU.
fn pmu_self_test(config: &SentinelConfig) -> Result<()> {
    let group = PerfCounterGroup::open(config.target_cpu, config.target_pid).map_err(|err| {
        let hint = match &err {
            PmuError::Open { source, .. } => preflight::open_failure_hint(source),
            _ => "check perf_event support on this kernel",
        };
        anyhow::anyhow!("{err} ({hint})")
    })?;

    let reading = group.read().context("PMU self-test read failed")?;

    println!("PMU raw read ({} counters open):", group.open_count());
    println!("  cycles              = {}", reading.cycles);
    println!("  instructions        = {}", reading.instructions);
    println!("  cache_references    = {}", reading.cache_references);
    println!("  cache_misses        = {}", reading.cache_misses);
    println!("  branch_instructions = {}", reading.branch_instructions);
    println!("  branch_misses       = {}", reading.branch_misses);
    println!("PMU self-test OK");
    Ok(())
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(tracing_subscriber::fmt::init);
}
