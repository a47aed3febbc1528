//! Two-phase statistical anomaly engine.
//!
//! Learning accumulates running sums and sums-of-squares for the three
//! derived metrics — no samples are retained, so memory stays O(1) under
//! sustained load. Finalization computes the baseline with the single-pass
//! E[x²] − E[x]² identity (variance clamped to zero against floating-point
//! rounding) and latches `ready`. Detection z-scores each sample against the
//! baseline and layers pattern recognition on top: burst tracking over
//! consecutive anomalies and oscillation detection over a circular window of
//! recent cache-miss rates.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::info;

use telemetry::TelemetrySample;

/// Below this, a standard deviation is treated as zero and the z-score is
/// defined to be 0: a flat baseline must not manufacture spikes.
const STD_EPSILON: f64 = 1e-12;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AnomalyFlags: u32 {
        const CACHE_MISS_SPIKE = 1 << 0;
        const BRANCH_MISS_SPIKE = 1 << 1;
        const IPC_COLLAPSE = 1 << 2;
        const BURST_PATTERN = 1 << 3;
        const OSCILLATION = 1 << 4;
    }
}

impl AnomalyFlags {
    /// Space-separated lower-case flag names, `"none"` when empty. Used as
    /// the `reason` field of alerts.
    pub fn describe(self) -> String {
        if self.is_empty() {
            return "none".to_string();
        }
        let mut parts = Vec::new();
        if self.contains(Self::CACHE_MISS_SPIKE) {
            parts.push("cache_miss_spike");
        }
        if self.contains(Self::BRANCH_MISS_SPIKE) {
            parts.push("branch_miss_spike");
        }
        if self.contains(Self::IPC_COLLAPSE) {
            parts.push("ipc_collapse");
        }
        if self.contains(Self::BURST_PATTERN) {
            parts.push("burst_pattern");
        }
        if self.contains(Self::OSCILLATION) {
            parts.push("oscillation");
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Z-score threshold for the primary spike/collapse flags.
    pub z_threshold: f64,
    /// Length of the recent-cmr window; also the consecutive-anomaly count
    /// that promotes to BURST_PATTERN.
    pub burst_window: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.5,
            burst_window: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricBaseline {
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaselineProfile {
    pub cache_miss_rate: MetricBaseline,
    pub branch_miss_rate: MetricBaseline,
    pub ipc: MetricBaseline,
    pub sample_count: u64,
    /// Latches true exactly once, at finalization; never regresses.
    pub ready: bool,
}

/// Per-sample detection output.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnomalyReport {
    pub z_cache_miss: f64,
    pub z_branch_miss: f64,
    pub z_ipc: f64,
    /// Smooth, bounded severity in [0, 1], independent of sign.
    pub composite_score: f64,
    pub flags: AnomalyFlags,
    /// Current consecutive-anomaly streak length.
    pub sustained_count: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    sum: f64,
    sum_sq: f64,
}

impl Moments {
    fn add(&mut self, x: f64) {
        self.sum += x;
        self.sum_sq += x * x;
    }

    fn baseline(&self, n: f64, variance_defined: bool) -> MetricBaseline {
        let mean = self.sum / n;
        let variance = if variance_defined {
            (self.sum_sq / n - mean * mean).max(0.0)
        } else {
            0.0
        };
        MetricBaseline {
            mean,
            std: variance.sqrt(),
        }
    }
}

pub struct AnomalyEngine {
    config: AnomalyConfig,
    cmr: Moments,
    bmr: Moments,
    ipc: Moments,
    learned: u64,
    baseline: BaselineProfile,
    /// Circular window of recent cache-miss rates for oscillation analysis.
    recent_cmr: Vec<f32>,
    recent_idx: usize,
    consecutive_anomalies: u32,
}

impl AnomalyEngine {
    pub fn new(config: AnomalyConfig) -> Self {
        let window = config.burst_window.max(1) as usize;
        Self {
            config,
            cmr: Moments::default(),
            bmr: Moments::default(),
            ipc: Moments::default(),
            learned: 0,
            baseline: BaselineProfile::default(),
            recent_cmr: vec![0.0; window],
            recent_idx: 0,
            consecutive_anomalies: 0,
        }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    pub fn baseline(&self) -> &BaselineProfile {
        &self.baseline
    }

    pub fn samples_learned(&self) -> u64 {
        self.learned
    }

    /// Learning phase: fold one sample into the running moments.
    pub fn learn(&mut self, sample: &TelemetrySample) {
        self.cmr.add(f64::from(sample.cache_miss_rate));
        self.bmr.add(f64::from(sample.branch_miss_rate));
        self.ipc.add(f64::from(sample.ipc));
        self.learned += 1;
    }

    /// Compute the baseline from the accumulated moments and latch `ready`.
    /// Idempotent: once the baseline is ready, further calls are no-ops.
    /// With zero learned samples nothing happens; the orchestrator treats
    /// that case as fatal before ever calling detect.
    pub fn finalize_baseline(&mut self) {
        if self.baseline.ready || self.learned == 0 {
            return;
        }

        let n = self.learned as f64;
        // With one sample the variance estimator is meaningless; clamp the
        // whole profile to zero spread.
        let variance_defined = self.learned >= 2;
        self.baseline = BaselineProfile {
            cache_miss_rate: self.cmr.baseline(n, variance_defined),
            branch_miss_rate: self.bmr.baseline(n, variance_defined),
            ipc: self.ipc.baseline(n, variance_defined),
            sample_count: self.learned,
            ready: true,
        };

        info!(
            samples = self.learned,
            cmr_mean = self.baseline.cache_miss_rate.mean,
            cmr_std = self.baseline.cache_miss_rate.std,
            bmr_mean = self.baseline.branch_miss_rate.mean,
            bmr_std = self.baseline.branch_miss_rate.std,
            ipc_mean = self.baseline.ipc.mean,
            ipc_std = self.baseline.ipc.std,
            "baseline finalized"
        );
    }

    /// Detection phase. Returns a zeroed report until the baseline is ready.
    pub fn detect(&mut self, sample: &TelemetrySample) -> AnomalyReport {
        let mut report = AnomalyReport::default();
        if !self.baseline.ready {
            return report;
        }

        let cmr = f64::from(sample.cache_miss_rate);
        let bmr = f64::from(sample.branch_miss_rate);
        let ipc = f64::from(sample.ipc);

        report.z_cache_miss = z_score(cmr, &self.baseline.cache_miss_rate);
        report.z_branch_miss = z_score(bmr, &self.baseline.branch_miss_rate);
        report.z_ipc = z_score(ipc, &self.baseline.ipc);

        let z = self.config.z_threshold;
        if report.z_cache_miss > z {
            report.flags |= AnomalyFlags::CACHE_MISS_SPIKE;
        }
        if report.z_branch_miss > z {
            report.flags |= AnomalyFlags::BRANCH_MISS_SPIKE;
        }
        // Asymmetric on purpose: only throughput drops indicate contention.
        if report.z_ipc < -z {
            report.flags |= AnomalyFlags::IPC_COLLAPSE;
        }

        self.recent_cmr[self.recent_idx] = sample.cache_miss_rate;
        self.recent_idx = (self.recent_idx + 1) % self.recent_cmr.len();

        if report.flags.is_empty() {
            self.consecutive_anomalies = 0;
        } else {
            self.consecutive_anomalies += 1;
            if self.consecutive_anomalies >= self.config.burst_window {
                report.flags |= AnomalyFlags::BURST_PATTERN;
            }
        }
        report.sustained_count = self.consecutive_anomalies;

        if oscillating(&self.recent_cmr, self.recent_idx) {
            report.flags |= AnomalyFlags::OSCILLATION;
        }

        let max_z = report
            .z_cache_miss
            .abs()
            .max(report.z_branch_miss.abs())
            .max(report.z_ipc.abs());
        report.composite_score = (1.0 - 1.0 / (1.0 + max_z / z)).clamp(0.0, 1.0);

        report
    }
}

fn z_score(value: f64, baseline: &MetricBaseline) -> f64 {
    if baseline.std < STD_EPSILON {
        return 0.0;
    }
    (value - baseline.mean) / baseline.std
}

/// High-frequency oscillation over the circular window: count sign changes
/// of the first difference walking newest to oldest. Zero differences
/// neither count as a change nor reset the previous direction. Windows
/// shorter than 4 never oscillate.
fn oscillating(window: &[f32], newest_idx: usize) -> bool {
    let cap = window.len();
    if cap < 4 {
        return false;
    }

    let mut direction_changes = 0usize;
    let mut prev_dir = 0i32;

    for i in 1..cap {
        let a = (newest_idx + cap - i) % cap;
        let b = (newest_idx + cap - i - 1) % cap;
        let diff = window[a] - window[b];
        let dir = if diff > 0.0 {
            1
        } else if diff < 0.0 {
            -1
        } else {
            0
        };
        if dir != 0 && prev_dir != 0 && dir != prev_dir {
            direction_changes += 1;
        }
        if dir != 0 {
            prev_dir = dir;
        }
    }

    direction_changes >= cap / 2
}
