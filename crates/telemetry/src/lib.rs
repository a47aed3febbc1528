//! Telemetry pipeline: the sample type, the lock-free handoff ring, the
//! background sampling thread, and the wire layout consumed by the ML side.

pub mod ring;
pub mod sampler;
pub mod wire;

use serde::{Deserialize, Serialize};

use platform_linux::pmu::PmuReading;

/// One per-interval measurement flowing through the pipeline.
///
/// Counter fields are deltas over the interval just ended, not cumulative
/// values. The derived ratios are precomputed here so downstream consumers
/// (detection, the ML mirror) never recompute them. Plain `Copy` value: the
/// ring buffer moves samples by copy and nothing aliases them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp_ns: u64,
    pub cache_references: u64,
    pub cache_misses: u64,
    pub branch_instructions: u64,
    pub branch_misses: u64,
    pub cycles: u64,
    pub instructions: u64,
    pub cache_miss_rate: f32,
    pub branch_miss_rate: f32,
    pub ipc: f32,
}

impl TelemetrySample {
    /// Build a sample from a counter delta. Every ratio is defined to be
    /// zero when its denominator is zero.
    pub fn from_delta(timestamp_ns: u64, delta: &PmuReading) -> Self {
        let cache_miss_rate = if delta.instructions > 0 {
            delta.cache_misses as f32 / delta.instructions as f32
        } else {
            0.0
        };
        let branch_miss_rate = if delta.branch_instructions > 0 {
            delta.branch_misses as f32 / delta.branch_instructions as f32
        } else {
            0.0
        };
        let ipc = if delta.cycles > 0 {
            delta.instructions as f32 / delta.cycles as f32
        } else {
            0.0
        };

        Self {
            timestamp_ns,
            cache_references: delta.cache_references,
            cache_misses: delta.cache_misses,
            branch_instructions: delta.branch_instructions,
            branch_misses: delta.branch_misses,
            cycles: delta.cycles,
            instructions: delta.instructions,
            cache_miss_rate,
            branch_miss_rate,
            ipc,
        }
    }
}

pub use ring::SampleRing;
pub use sampler::{Sampler, SamplerConfig};
