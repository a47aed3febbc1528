use proptest::prelude::*;

use telemetry::TelemetrySample;

use crate::anomaly::{AnomalyConfig, AnomalyEngine, AnomalyFlags};
use crate::correlation::{CorrelationEngine, MAX_TRACKED};

fn sample(cmr: f32, bmr: f32, ipc: f32) -> TelemetrySample {
    TelemetrySample {
        cache_miss_rate: cmr,
        branch_miss_rate: bmr,
        ipc,
        ..TelemetrySample::default()
    }
}

/// Engine learned on an exactly constant workload: std = 0 for every metric.
fn flatline_engine() -> AnomalyEngine {
    let mut engine = AnomalyEngine::new(AnomalyConfig::default());
    for _ in 0..1_000 {
        engine.learn(&sample(0.010, 0.005, 1.500));
    }
    engine.finalize_baseline();
    engine
}

/// Engine learned on a workload with small spread: means (0.010, 0.005, 2.0)
/// and per-metric std of exactly (0.001, 0.0005, 0.05) from alternating
/// mean ± d inputs.
fn jittered_engine() -> AnomalyEngine {
    let mut engine = AnomalyEngine::new(AnomalyConfig::default());
    for i in 0..1_000 {
        if i % 2 == 0 {
            engine.learn(&sample(0.009, 0.0045, 1.95));
        } else {
            engine.learn(&sample(0.011, 0.0055, 2.05));
        }
    }
    engine.finalize_baseline();
    engine
}

// ── baseline lifecycle ──────────────────────────────────────────

#[test]
fn baseline_not_ready_before_finalize() {
    let mut engine = AnomalyEngine::new(AnomalyConfig::default());
    engine.learn(&sample(0.01, 0.005, 1.5));
    assert!(!engine.baseline().ready);
    let report = engine.detect(&sample(0.9, 0.9, 0.1));
    assert!(report.flags.is_empty());
    assert_eq!(report.composite_score, 0.0);
}

#[test]
fn baseline_from_constant_inputs_has_zero_std() {
    let engine = flatline_engine();
    let b = engine.baseline();
    assert!(b.ready);
    assert_eq!(b.sample_count, 1_000);
    assert!((b.cache_miss_rate.mean - 0.010).abs() < 1e-9);
    assert_eq!(b.cache_miss_rate.std, 0.0);
    assert_eq!(b.branch_miss_rate.std, 0.0);
    assert_eq!(b.ipc.std, 0.0);
}

#[test]
fn finalize_is_idempotent() {
    let mut engine = jittered_engine();
    let first = engine.baseline().clone();
    // Extra learning after the latch must not disturb the baseline.
    engine.learn(&sample(5.0, 5.0, 0.0));
    engine.finalize_baseline();
    let second = engine.baseline();
    assert_eq!(first.sample_count, second.sample_count);
    assert_eq!(first.cache_miss_rate.mean, second.cache_miss_rate.mean);
    assert_eq!(first.cache_miss_rate.std, second.cache_miss_rate.std);
    assert_eq!(first.ipc.mean, second.ipc.mean);
}

#[test]
fn finalize_with_zero_samples_never_readies() {
    let mut engine = AnomalyEngine::new(AnomalyConfig::default());
    engine.finalize_baseline();
    assert!(!engine.baseline().ready);
}

// ── scenario 1: flatline ────────────────────────────────────────

#[test]
fn flat_baseline_and_identical_samples_stay_silent() {
    let mut engine = flatline_engine();
    for _ in 0..500 {
        let report = engine.detect(&sample(0.010, 0.005, 1.500));
        assert_eq!(report.z_cache_miss, 0.0);
        assert_eq!(report.z_branch_miss, 0.0);
        assert_eq!(report.z_ipc, 0.0);
        assert!(report.flags.is_empty(), "flags: {:?}", report.flags);
        assert_eq!(report.composite_score, 0.0);
    }
}

// ── scenario 2: single cache spike ──────────────────────────────

#[test]
fn single_cache_spike_flags_without_burst() {
    let mut engine = jittered_engine();
    let report = engine.detect(&sample(0.100, 0.005, 2.0));
    assert!(report.flags.contains(AnomalyFlags::CACHE_MISS_SPIKE));
    assert!(!report.flags.contains(AnomalyFlags::BURST_PATTERN));
    assert!(report.z_cache_miss > 50.0, "z_cmr = {}", report.z_cache_miss);
    assert!(report.composite_score > 0.5);
    assert_eq!(report.sustained_count, 1);
}

// ── scenario 3: burst of 10 ─────────────────────────────────────

#[test]
fn ten_consecutive_spikes_promote_to_burst() {
    let mut engine = jittered_engine();
    for i in 1..=10u32 {
        let report = engine.detect(&sample(0.100, 0.005, 2.0));
        assert!(report.flags.contains(AnomalyFlags::CACHE_MISS_SPIKE));
        assert_eq!(report.sustained_count, i);
        if i < 10 {
            assert!(!report.flags.contains(AnomalyFlags::BURST_PATTERN));
        } else {
            assert!(report.flags.contains(AnomalyFlags::BURST_PATTERN));
        }
    }
    // The streak continues past the window boundary.
    let report = engine.detect(&sample(0.100, 0.005, 2.0));
    assert!(report.flags.contains(AnomalyFlags::BURST_PATTERN));
    assert!(report.sustained_count >= 10);
}

#[test]
fn clean_sample_resets_the_streak() {
    let mut engine = jittered_engine();
    for _ in 0..5 {
        engine.detect(&sample(0.100, 0.005, 2.0));
    }
    let calm = engine.detect(&sample(0.010, 0.005, 2.0));
    assert_eq!(calm.sustained_count, 0);
}

// ── scenario 4: IPC collapse ────────────────────────────────────

#[test]
fn ipc_drop_sets_collapse_only() {
    let mut engine = jittered_engine();
    let report = engine.detect(&sample(0.010, 0.005, 1.0));
    assert!(report.flags.contains(AnomalyFlags::IPC_COLLAPSE));
    assert!(!report.flags.contains(AnomalyFlags::CACHE_MISS_SPIKE));
    assert!(!report.flags.contains(AnomalyFlags::BRANCH_MISS_SPIKE));
    assert!(report.z_ipc <= -3.5, "z_ipc = {}", report.z_ipc);
}

#[test]
fn ipc_rise_is_not_an_anomaly() {
    let mut engine = jittered_engine();
    let report = engine.detect(&sample(0.010, 0.005, 3.5));
    assert!(!report.flags.contains(AnomalyFlags::IPC_COLLAPSE));
}

// ── scenario 5: oscillation ─────────────────────────────────────

#[test]
fn alternating_cache_miss_rates_oscillate() {
    let mut engine = jittered_engine();
    let window = engine.config().burst_window as usize;
    let mut saw_oscillation = false;
    for i in 0..(window * 2) {
        let cmr = if i % 2 == 0 { 0.01 } else { 0.05 };
        let report = engine.detect(&sample(cmr, 0.005, 2.0));
        if i >= window {
            saw_oscillation |= report.flags.contains(AnomalyFlags::OSCILLATION);
        }
    }
    assert!(saw_oscillation, "oscillation never flagged");
}

#[test]
fn steady_ramp_does_not_oscillate() {
    let mut engine = jittered_engine();
    for i in 0..40 {
        let cmr = 0.010 + i as f32 * 0.0001;
        let report = engine.detect(&sample(cmr, 0.005, 2.0));
        assert!(!report.flags.contains(AnomalyFlags::OSCILLATION));
    }
}

// ── flag rendering ──────────────────────────────────────────────

#[test]
fn flag_description_is_space_separated() {
    let flags = AnomalyFlags::CACHE_MISS_SPIKE | AnomalyFlags::BURST_PATTERN;
    assert_eq!(flags.describe(), "cache_miss_spike burst_pattern");
    assert_eq!(AnomalyFlags::empty().describe(), "none");
    assert_eq!(AnomalyFlags::OSCILLATION.describe(), "oscillation");
}

// ── composite score properties ──────────────────────────────────

proptest! {
    #[test]
    fn composite_bounded_and_consistent_with_z(
        cmr in 0.0f32..1.0,
        bmr in 0.0f32..1.0,
        ipc in 0.0f32..8.0,
    ) {
        let mut engine = jittered_engine();
        let report = engine.detect(&sample(cmr, bmr, ipc));
        prop_assert!(report.composite_score >= 0.0);
        prop_assert!(report.composite_score <= 1.0);
        let max_z = report
            .z_cache_miss
            .abs()
            .max(report.z_branch_miss.abs())
            .max(report.z_ipc.abs());
        // composite > 0 requires a nonzero z; a clearly nonzero z requires
        // a positive composite.
        if report.composite_score > 0.0 {
            prop_assert!(max_z > 0.0);
        }
        if max_z > 1e-6 {
            prop_assert!(report.composite_score > 0.0);
        }
        if max_z == 0.0 {
            prop_assert_eq!(report.composite_score, 0.0);
        }
        prop_assert!(report.z_cache_miss.is_finite());
        prop_assert!(report.z_branch_miss.is_finite());
        prop_assert!(report.z_ipc.is_finite());
    }

    #[test]
    fn flat_baseline_never_yields_nan(
        cmr in 0.0f32..1.0,
        bmr in 0.0f32..1.0,
        ipc in 0.0f32..8.0,
    ) {
        let mut engine = flatline_engine();
        let report = engine.detect(&sample(cmr, bmr, ipc));
        prop_assert_eq!(report.z_cache_miss, 0.0);
        prop_assert_eq!(report.z_branch_miss, 0.0);
        prop_assert_eq!(report.z_ipc, 0.0);
        prop_assert!(!report.composite_score.is_nan());
    }
}

// ── correlation ─────────────────────────────────────────────────

const SEC: u64 = 1_000_000_000;

#[test]
fn ema_converges_monotonically_toward_constant_input() {
    let mut corr = CorrelationEngine::new(0.95, 30);
    let pid = std::process::id() as i32;
    let mut last = 0.0f32;
    for k in 1..=60u64 {
        corr.update(pid, 0, 0.8, k * SEC / 100);
        let score = corr.lookup(pid).unwrap().anomaly_score;
        assert!(score > last, "not monotone at step {k}");
        assert!(score <= 0.8 + 1e-6);
        last = score;
    }
    assert!((last - 0.8).abs() < 1e-4, "did not converge: {last}");
}

#[test]
fn suspicious_counter_tracks_high_scores() {
    let mut corr = CorrelationEngine::new(0.95, 30);
    corr.update(1234, 0, 0.9, SEC);
    corr.update(1234, 0, 0.2, 2 * SEC);
    corr.update(1234, 0, 0.7, 3 * SEC);
    let entry = corr.lookup(1234).unwrap();
    assert_eq!(entry.total_samples, 3);
    assert_eq!(entry.suspicious_samples, 2);
    assert_eq!(entry.last_seen_ns, 3 * SEC);
}

#[test]
fn unresolvable_pid_gets_placeholder_comm() {
    let mut corr = CorrelationEngine::new(0.95, 30);
    // An unlikely-to-exist pid: comm resolution fails, entry still tracks.
    corr.update(999_999_99, 0, 0.6, SEC);
    assert_eq!(corr.lookup(999_999_99).unwrap().comm, "<unknown>");
}

#[test]
fn decay_attenuates_and_snaps_to_zero() {
    let mut corr = CorrelationEngine::new(0.95, 30);
    corr.update(42, 0, 1.0, SEC);
    let initial = corr.lookup(42).unwrap().anomaly_score;
    corr.decay(2 * SEC);
    let decayed = corr.lookup(42).unwrap().anomaly_score;
    assert!((decayed - initial * 0.95).abs() < 1e-6);

    // Repeated decay drives the score under the floor, then exactly zero.
    for i in 0..200u64 {
        corr.decay((3 + i) * SEC / 10 + 2 * SEC);
    }
    assert_eq!(corr.lookup(42).unwrap().anomaly_score, 0.0);
}

#[test]
fn stale_entries_deactivate_after_window() {
    let mut corr = CorrelationEngine::new(0.95, 30);
    corr.update(42, 0, 0.9, SEC);
    corr.decay(SEC + 31 * SEC);
    assert!(corr.lookup(42).is_none());
    assert_eq!(corr.active_count(), 0);
}

#[test]
fn deactivated_slot_is_reused_in_place() {
    let mut corr = CorrelationEngine::new(0.95, 30);
    corr.update(1, 0, 0.5, SEC);
    corr.update(2, 0, 0.5, SEC);
    corr.decay(SEC + 31 * SEC);
    assert_eq!(corr.active_count(), 0);

    corr.update(3, 0, 0.5, 40 * SEC);
    assert_eq!(corr.active_count(), 1);
    let entry = corr.lookup(3).unwrap();
    assert_eq!(entry.total_samples, 1);
    assert_eq!(entry.suspicious_samples, 0);
}

#[test]
fn table_is_bounded_at_max_tracked() {
    let mut corr = CorrelationEngine::new(0.95, 3_600);
    for pid in 0..400 {
        corr.update(1_000_000 + pid, 0, 0.5, SEC);
    }
    assert_eq!(corr.active_count(), MAX_TRACKED);
    // Saturated: new pids are dropped, existing ones still update.
    assert!(corr.lookup(1_000_000 + 399).is_none());
    corr.update(1_000_000, 0, 0.9, 2 * SEC);
    assert_eq!(corr.lookup(1_000_000).unwrap().total_samples, 2);
}

#[test]
fn top_risk_tracks_the_hottest_process() {
    let mut corr = CorrelationEngine::new(0.95, 30);
    assert!(corr.top_risk().is_none());
    corr.update(10, 0, 0.3, SEC);
    corr.update(20, 0, 0.9, SEC);
    corr.update(30, 0, 0.1, SEC);
    assert_eq!(corr.top_risk().unwrap().pid, 20);
}

#[test]
fn top_risk_prefers_first_entry_on_ties() {
    let mut corr = CorrelationEngine::new(0.95, 30);
    corr.update(10, 0, 0.5, SEC);
    corr.update(20, 0, 0.5, SEC);
    // Equal smoothed scores: the earliest-inserted entry wins.
    assert_eq!(corr.top_risk().unwrap().pid, 10);

    // Only a strictly greater score displaces it.
    corr.update(20, 0, 0.9, 2 * SEC);
    assert_eq!(corr.top_risk().unwrap().pid, 20);
}

#[test]
fn top_risk_ties_at_snapped_zero_stay_first_wins() {
    let mut corr = CorrelationEngine::new(0.95, 3_600);
    corr.update(10, 0, 0.4, SEC);
    corr.update(20, 0, 0.6, SEC);
    // Decay both entries to the floor so they tie at exactly 0.0.
    for i in 0..300u64 {
        corr.decay(SEC + i);
    }
    assert_eq!(corr.lookup(10).unwrap().anomaly_score, 0.0);
    assert_eq!(corr.lookup(20).unwrap().anomaly_score, 0.0);
    assert_eq!(corr.top_risk().unwrap().pid, 10);
}

proptest! {
    #[test]
    fn ema_stays_within_input_hull(scores in proptest::collection::vec(0.0f32..1.0, 1..64)) {
        let mut corr = CorrelationEngine::new(0.95, 3_600);
        for (i, score) in scores.iter().enumerate() {
            corr.update(7, 0, *score, (i as u64 + 1) * SEC / 1_000);
        }
        let smoothed = corr.lookup(7).unwrap().anomaly_score;
        prop_assert!(smoothed >= 0.0);
        let max = scores.iter().cloned().fold(0.0f32, f32::max);
        prop_assert!(smoothed <= max + 1e-6);
    }
}
