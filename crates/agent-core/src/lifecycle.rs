//! Orchestrator: owns every pipeline component and drives the forward-only
//! lifecycle INIT → LEARNING → DETECTING → SHUTTING_DOWN → DONE. An external
//! cancellation (signal) short-circuits any phase into shutdown.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use detection::{AnomalyConfig, AnomalyEngine, AnomalyFlags, AnomalyReport, CorrelationEngine};
use platform_linux::{drop_privileges, monotonic_ns};
use telemetry::{SampleRing, Sampler, SamplerConfig, TelemetrySample};

use crate::alerts::{AlertLevel, AlertSink};
use crate::config::SentinelConfig;
use crate::ml_sink::MlPublisher;

/// Sleep when the ring is empty during learning.
const LEARN_IDLE_SLEEP: Duration = Duration::from_micros(500);
/// Sleep when the ring is empty during detection.
const DETECT_IDLE_SLEEP: Duration = Duration::from_micros(100);
const DECAY_PERIOD_NS: u64 = 1_000_000_000;
const STATUS_PERIOD_NS: u64 = 10_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Learning,
    Detecting,
    ShuttingDown,
    Done,
}

pub struct SentinelRuntime {
    config: SentinelConfig,
    ring: Arc<SampleRing>,
    anomaly: AnomalyEngine,
    correlation: CorrelationEngine,
    publisher: Option<MlPublisher>,
    alerts: AlertSink,
    shutdown: Arc<AtomicBool>,
    phase: Phase,
    total_samples: u64,
    anomaly_samples: u64,
}

impl SentinelRuntime {
    pub fn new(config: SentinelConfig, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let ring = Arc::new(SampleRing::with_capacity(config.ringbuffer_capacity));

        let anomaly = AnomalyEngine::new(AnomalyConfig {
            z_threshold: config.z_threshold,
            burst_window: config.burst_window,
        });
        let correlation =
            CorrelationEngine::new(config.risk_decay_factor, config.correlation_window_sec);

        let alerts = AlertSink::new(
            config.log_file.as_deref().map(Path::new),
            config.log_to_syslog,
            config.alert_cooldown_sec,
        )
        .with_context(|| format!("failed to open alert sink {:?}", config.log_file))?;

        let publisher = if config.enable_ml_output {
            match MlPublisher::connect(Path::new(&config.socket_path)) {
                Ok(publisher) => {
                    info!(socket = %config.socket_path, "ML analyzer mirror connected");
                    Some(publisher)
                }
                Err(err) => {
                    info!(
                        socket = %config.socket_path,
                        error = %err,
                        "ML analyzer unavailable; running standalone detection"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            config,
            ring,
            anomaly,
            correlation,
            publisher,
            alerts,
            shutdown,
            phase: Phase::Init,
            total_samples: 0,
            anomaly_samples: 0,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub(crate) fn ring(&self) -> Arc<SampleRing> {
        Arc::clone(&self.ring)
    }

    #[cfg(test)]
    pub(crate) fn baseline_ready(&self) -> bool {
        self.anomaly.baseline().ready
    }

    /// Full lifecycle: start the sampler, run learning then detection, and
    /// shut down deterministically (the sampler is always joined, whatever
    /// the pipeline outcome).
    pub fn run(&mut self) -> Result<()> {
        let sampler = Sampler::spawn(
            SamplerConfig {
                interval_us: self.config.sampling_interval_us,
                cpu: self.config.target_cpu,
                pid: self.config.target_pid,
            },
            Arc::clone(&self.ring),
            Arc::clone(&self.shutdown),
        )
        .context("failed to start sampler thread")?;
        info!(
            cpu = self.config.target_cpu,
            pid = self.config.target_pid,
            interval_us = self.config.sampling_interval_us,
            "telemetry sampler started"
        );

        let outcome = self.run_pipeline();

        self.phase = Phase::ShuttingDown;
        self.shutdown.store(true, Ordering::Relaxed);
        sampler.join();
        self.phase = Phase::Done;

        info!(
            total_samples = self.total_samples,
            anomalies = self.anomaly_samples,
            "cpu-sentinel stopped"
        );
        outcome
    }

    pub(crate) fn run_pipeline(&mut self) -> Result<()> {
        self.phase = Phase::Learning;
        info!(
            seconds = self.config.learning_duration_sec,
            "entering learning phase"
        );

        let deadline =
            monotonic_ns() + u64::from(self.config.learning_duration_sec) * 1_000_000_000;
        let learned = self.learning_pass(deadline);

        if self.shutdown.load(Ordering::Relaxed) {
            // Cancelled mid-learning: clean shutdown, detection never runs.
            return Ok(());
        }

        if learned == 0 {
            bail!(
                "no PMU samples collected during learning; check perf_event access \
                 (perf_event_paranoid, VM restrictions) or run with --pmu-test"
            );
        }

        self.anomaly.finalize_baseline();
        info!(samples = learned, "learning complete");

        // Counters stay readable without elevation; shed it before the
        // long-running phase.
        drop_privileges();

        self.phase = Phase::Detecting;
        info!("entering detection phase");
        self.detection_loop();
        Ok(())
    }

    /// Drain the ring into the learning accumulator until the deadline or
    /// cancellation. Returns the number of samples learned.
    pub(crate) fn learning_pass(&mut self, deadline_ns: u64) -> u64 {
        let mut learned = 0u64;

        while !self.shutdown.load(Ordering::Relaxed) && monotonic_ns() < deadline_ns {
            match self.ring.pop() {
                Some(sample) => {
                    self.anomaly.learn(&sample);
                    if let Some(publisher) = &mut self.publisher {
                        publisher.send(&sample);
                    }
                    learned += 1;
                }
                None => thread::sleep(LEARN_IDLE_SLEEP),
            }
        }

        learned
    }

    /// Detection runs until cancellation; there is no deadline.
    pub(crate) fn detection_loop(&mut self) {
        let mut last_decay_ns = monotonic_ns();
        let mut last_status_ns = last_decay_ns;

        while !self.shutdown.load(Ordering::Relaxed) {
            let Some(sample) = self.ring.pop() else {
                thread::sleep(DETECT_IDLE_SLEEP);
                continue;
            };

            self.total_samples += 1;
            let report = self.anomaly.detect(&sample);
            if let Some(publisher) = &mut self.publisher {
                publisher.send(&sample);
            }

            if !report.flags.is_empty() {
                self.handle_anomaly(&sample, &report);
            }

            let now = monotonic_ns();
            if now.saturating_sub(last_decay_ns) > DECAY_PERIOD_NS {
                self.correlation.decay(now);
                last_decay_ns = now;
            }
            if self.config.verbose && now.saturating_sub(last_status_ns) > STATUS_PERIOD_NS {
                let anomaly_pct = if self.total_samples > 0 {
                    self.anomaly_samples as f64 / self.total_samples as f64 * 100.0
                } else {
                    0.0
                };
                info!(
                    samples = self.total_samples,
                    anomalies = self.anomaly_samples,
                    anomaly_pct,
                    ring_fill = self.ring.len(),
                    "status"
                );
                last_status_ns = now;
            }
        }
    }

    fn handle_anomaly(&mut self, sample: &TelemetrySample, report: &AnomalyReport) {
        self.anomaly_samples += 1;

        let level = alert_level(report);
        let reason = report.flags.describe();
        let pid = attribution_pid(&self.config);

        self.correlation
            .update(pid, 0, report.composite_score as f32, sample.timestamp_ns);
        let comm = self
            .correlation
            .top_risk()
            .map(|entry| entry.comm.clone())
            .unwrap_or_else(|| "system".to_string());

        self.alerts.alert(
            level,
            sample.timestamp_ns,
            pid,
            &comm,
            report.composite_score,
            &reason,
        );

        if self.config.verbose {
            debug!(
                z_cmr = report.z_cache_miss,
                z_bmr = report.z_branch_miss,
                z_ipc = report.z_ipc,
                score = report.composite_score,
                sustained = report.sustained_count,
                flags = %reason,
                "anomaly detail"
            );
        }
    }
}

pub(crate) fn alert_level(report: &AnomalyReport) -> AlertLevel {
    if report.composite_score > 0.8 || report.flags.contains(AnomalyFlags::BURST_PATTERN) {
        AlertLevel::Critical
    } else if report.composite_score > 0.5 {
        AlertLevel::Warning
    } else {
        AlertLevel::Info
    }
}

/// Scoped monitoring attributes risk to the target pid; system-wide mode
/// falls back to the detector's own pid, so `comm` is a hint there.
fn attribution_pid(config: &SentinelConfig) -> i32 {
    if config.target_pid > 0 {
        config.target_pid
    } else {
        std::process::id() as i32
    }
}
