//! Background sampling thread: periodic PMU reads turned into per-interval
//! delta samples and pushed into the handoff ring.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use platform_linux::pmu::{PerfCounterGroup, PmuReading};
use platform_linux::{monotonic_ns, pin_to_cpu};

use crate::{SampleRing, TelemetrySample};

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    /// Sampling interval in microseconds.
    pub interval_us: u32,
    /// Target CPU, −1 = any. The thread also pins itself here to reduce
    /// migration-induced counter noise.
    pub cpu: i32,
    /// Target pid, −1 = system-wide.
    pub pid: i32,
}

/// Handle to the sampling thread. The thread exits when the shutdown token
/// is set; `join` is deterministic and releases the PMU session.
pub struct Sampler {
    handle: JoinHandle<()>,
}

impl Sampler {
    pub fn spawn(
        config: SamplerConfig,
        ring: Arc<SampleRing>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name("pmu-sampler".into())
            .spawn(move || sampling_loop(config, &ring, &shutdown))?;
        Ok(Self { handle })
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("sampler thread panicked");
        }
    }
}

fn sampling_loop(config: SamplerConfig, ring: &SampleRing, shutdown: &AtomicBool) {
    if config.cpu >= 0 {
        if let Err(err) = pin_to_cpu(config.cpu) {
            warn!(cpu = config.cpu, error = %err, "failed to pin sampler thread");
        }
    }

    let pmu = match PerfCounterGroup::open(config.cpu, config.pid) {
        Ok(pmu) => pmu,
        Err(err) => {
            error!(error = %err, "failed to open PMU counters; sampler exiting");
            return;
        }
    };
    info!(
        counters_open = pmu.open_count(),
        cpu = config.cpu,
        pid = config.pid,
        "PMU counters initialized"
    );

    let interval = Duration::from_micros(u64::from(config.interval_us));
    let mut prev: Option<PmuReading> = None;

    // Cancellation only needs eventual visibility; relaxed is enough.
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(interval);

        let cur = match pmu.read() {
            Ok(reading) => reading,
            Err(err) => {
                debug!(error = %err, "PMU read failed; skipping tick");
                continue;
            }
        };

        if let Some(prev) = prev {
            let delta = cur.delta_since(&prev);
            let sample = TelemetrySample::from_delta(monotonic_ns(), &delta);
            // Drop on full: backpressure policy is to lose the interval,
            // not to block the sampling cadence.
            ring.push(sample);
        }

        prev = Some(cur);
    }

    if let Err(err) = pmu.disable() {
        warn!(error = %err, "failed to disable PMU group on shutdown");
    }
}
