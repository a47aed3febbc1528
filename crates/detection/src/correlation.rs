//! Per-process risk aggregation: exponential smoothing over per-sample
//! anomaly scores, time-windowed decay, bounded slot table.
//!
//! The table holds at most [`MAX_TRACKED`] entries and never allocates past
//! that: lookups scan active entries, creation reuses an inactive slot
//! before appending, and deactivation leaves the slot in place for reuse —
//! the array is never compacted.

use serde::{Deserialize, Serialize};

use platform_linux::read_process_name;

pub const MAX_TRACKED: usize = 256;

/// New-sample weight of the exponential moving average: responsive to
/// spikes without surrendering history.
const EMA_ALPHA: f32 = 0.3;
/// Per-sample scores above this count as suspicious.
const SUSPICIOUS_SCORE: f32 = 0.5;
/// Decayed scores below this snap to exactly zero to stop floating-point
/// drift over long runtimes.
const SCORE_FLOOR: f32 = 1e-3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessRisk {
    pub pid: i32,
    pub tid: i32,
    /// Resolved once at slot creation from /proc/<pid>/comm.
    pub comm: String,
    /// EMA-smoothed anomaly score.
    pub anomaly_score: f32,
    pub suspicious_samples: u64,
    pub total_samples: u64,
    pub last_seen_ns: u64,
    pub active: bool,
}

pub struct CorrelationEngine {
    entries: Vec<ProcessRisk>,
    decay_factor: f64,
    window_sec: u32,
}

impl CorrelationEngine {
    pub fn new(decay_factor: f64, window_sec: u32) -> Self {
        Self {
            entries: Vec::with_capacity(MAX_TRACKED),
            decay_factor,
            window_sec,
        }
    }

    /// Fold one anomaly score into the risk entry for `pid`, creating or
    /// reusing a slot as needed. Silently drops the update when the table is
    /// saturated with active entries.
    pub fn update(&mut self, pid: i32, tid: i32, score: f32, timestamp_ns: u64) {
        let Some(idx) = self.find_or_create(pid, tid) else {
            return;
        };

        let entry = &mut self.entries[idx];
        entry.total_samples += 1;
        entry.last_seen_ns = timestamp_ns;
        entry.anomaly_score = EMA_ALPHA * score + (1.0 - EMA_ALPHA) * entry.anomaly_score;
        if score > SUSPICIOUS_SCORE {
            entry.suspicious_samples += 1;
        }
    }

    /// Age out stale entries and attenuate the rest. Entries unseen for
    /// longer than the window deactivate (slot stays reusable); surviving
    /// scores shrink by the decay factor and snap to zero near the floor.
    pub fn decay(&mut self, now_ns: u64) {
        let window_ns = u64::from(self.window_sec) * 1_000_000_000;

        for entry in &mut self.entries {
            if !entry.active {
                continue;
            }

            if now_ns.saturating_sub(entry.last_seen_ns) > window_ns {
                entry.active = false;
                continue;
            }

            entry.anomaly_score *= self.decay_factor as f32;
            if entry.anomaly_score < SCORE_FLOOR {
                entry.anomaly_score = 0.0;
            }
        }
    }

    pub fn lookup(&self, pid: i32) -> Option<&ProcessRisk> {
        self.entries.iter().find(|e| e.active && e.pid == pid)
    }

    /// Active entry with the greatest smoothed score, if any. Ties resolve
    /// to the earliest-inserted entry: only a strictly greater score
    /// replaces the current best.
    pub fn top_risk(&self) -> Option<&ProcessRisk> {
        self.entries
            .iter()
            .filter(|e| e.active)
            .fold(None, |best: Option<&ProcessRisk>, entry| match best {
                Some(best) if entry.anomaly_score <= best.anomaly_score => Some(best),
                _ => Some(entry),
            })
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }

    fn find_or_create(&mut self, pid: i32, tid: i32) -> Option<usize> {
        if let Some(idx) = self.entries.iter().position(|e| e.active && e.pid == pid) {
            return Some(idx);
        }

        if let Some(idx) = self.entries.iter().position(|e| !e.active) {
            self.entries[idx] = fresh_entry(pid, tid);
            return Some(idx);
        }

        if self.entries.len() < MAX_TRACKED {
            self.entries.push(fresh_entry(pid, tid));
            return Some(self.entries.len() - 1);
        }

        None
    }
}

fn fresh_entry(pid: i32, tid: i32) -> ProcessRisk {
    ProcessRisk {
        pid,
        tid,
        comm: read_process_name(pid).unwrap_or_else(|| "<unknown>".to_string()),
        active: true,
        ..ProcessRisk::default()
    }
}
