//! CLI argument definitions. Command-line values override the config file.

use clap::Parser;
use std::path::PathBuf;

use crate::config::SentinelConfig;

#[derive(Parser, Debug)]
#[command(
    name = "cpu-sentinel",
    version,
    about = "Real-time PMU-based side-channel anomaly detector"
)]
pub struct Args {
    /// Configuration file (key=value lines)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Sampling interval in microseconds
    #[arg(short = 'i', long)]
    pub interval_us: Option<u32>,

    /// Learning phase duration in seconds
    #[arg(short = 'l', long)]
    pub learning_secs: Option<u32>,

    /// Z-score threshold for anomaly flags
    #[arg(short = 'z', long)]
    pub z_threshold: Option<f64>,

    /// Target CPU core (-1 = any)
    #[arg(short = 'C', long)]
    pub cpu: Option<i32>,

    /// Target PID (-1 = system-wide)
    #[arg(short = 'p', long)]
    pub pid: Option<i32>,

    /// Append JSON alerts to this file
    #[arg(short = 'o', long)]
    pub log_file: Option<PathBuf>,

    /// Mirror alerts to syslog
    #[arg(short = 's', long)]
    pub syslog: bool,

    /// Verbose diagnostics (per-sample z-scores, periodic status)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// PMU self-test: open counters, read once, print raw values, exit
    #[arg(short = 'T', long)]
    pub pmu_test: bool,

    /// ML analyzer unix datagram socket path
    #[arg(short = 'S', long)]
    pub socket: Option<PathBuf>,

    /// Disable the ML mirror (standalone detection)
    #[arg(short = 'M', long)]
    pub no_ml: bool,
}

impl Args {
    pub fn apply(&self, cfg: &mut SentinelConfig) {
        if let Some(v) = self.interval_us {
            cfg.sampling_interval_us = v;
        }
        if let Some(v) = self.learning_secs {
            cfg.learning_duration_sec = v;
        }
        if let Some(v) = self.z_threshold {
            cfg.z_threshold = v;
        }
        if let Some(v) = self.cpu {
            cfg.target_cpu = v;
        }
        if let Some(v) = self.pid {
            cfg.target_pid = v;
        }
        if let Some(path) = &self.log_file {
            cfg.log_file = Some(path.display().to_string());
        }
        if let Some(path) = &self.socket {
            cfg.socket_path = path.display().to_string();
        }
        if self.syslog {
            cfg.log_to_syslog = true;
        }
        if self.verbose {
            cfg.verbose = true;
        }
        if self.pmu_test {
            cfg.pmu_test = true;
        }
        if self.no_ml {
            cfg.enable_ml_output = false;
        }
    }
}
