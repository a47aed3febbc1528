//! Linux platform facilities: the perf_event counter session, preflight
//! diagnostics, the raw monotonic clock, CPU pinning, privilege demotion and
//! /proc process-name lookup.

pub mod pmu;
pub mod preflight;

use std::fs;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::time::{clock_gettime, ClockId};
use nix::unistd::{setgid, setuid, Gid, Pid, Uid};
use tracing::{info, warn};

/// Nanoseconds on CLOCK_MONOTONIC_RAW. The RAW clock is immune to NTP slew
/// and frequency adjustment, which keeps sample timestamps and cooldown
/// arithmetic stable over long runs.
pub fn monotonic_ns() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC_RAW)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}

/// Pin the calling thread to one CPU. No-op for negative targets.
pub fn pin_to_cpu(cpu: i32) -> nix::Result<()> {
    if cpu < 0 {
        return Ok(());
    }
    let mut set = CpuSet::new();
    set.set(cpu as usize)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

/// Demote to the invoking user when running euid-0 under a sudo-class
/// wrapper. Counters opened while elevated stay readable afterwards, so this
/// is called once the learning phase has finished. Best-effort: failures are
/// logged, not propagated.
pub fn drop_privileges() {
    if !Uid::effective().is_root() {
        return;
    }

    let sudo_uid = std::env::var("SUDO_UID").ok().and_then(|v| v.trim().parse::<u32>().ok());
    let sudo_gid = std::env::var("SUDO_GID").ok().and_then(|v| v.trim().parse::<u32>().ok());

    let (Some(uid), Some(gid)) = (sudo_uid, sudo_gid) else {
        return;
    };

    // Group first: setuid would forfeit the right to change groups.
    if let Err(err) = setgid(Gid::from_raw(gid)) {
        warn!(gid, error = %err, "setgid failed during privilege drop");
    }
    if let Err(err) = setuid(Uid::from_raw(uid)) {
        warn!(uid, error = %err, "setuid failed during privilege drop");
    }
    info!(uid, gid, "dropped privileges to invoking user");
}

/// Process name from /proc/<pid>/comm, trailing newline stripped.
pub fn read_process_name(pid: i32) -> Option<String> {
    if pid <= 0 {
        return None;
    }
    let raw = fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
    let name = raw.trim_end_matches('\n').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests;
