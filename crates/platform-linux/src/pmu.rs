//! perf_event counter group: open with fallback, multiplexing-aware reads,
//! group-wide control.
//!
//! The six counters are opened as one event group led by the cycles counter
//! so the kernel schedules them together. Cycles and instructions are
//! mandatory; the remaining slots are optional and read as zero when the
//! hardware (or hypervisor) refuses them. Every attr requests
//! TOTAL_TIME_ENABLED/TOTAL_TIME_RUNNING so multiplexed counters can be
//! scaled back to full-interval estimates.
//!
//! The syscall surface is bound by hand: a `#[repr(C)]` attr struct through
//! the VER1 size boundary plus `libc::syscall(SYS_perf_event_open, …)`.
//! The kernel accepts any historical attr size, and this program sets no
//! field beyond the VER0 range.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const NUM_COUNTERS: usize = 6;
/// Cycles and instructions must both open or the session is unusable.
const CRITICAL_MIN: usize = 2;

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_TYPE_SOFTWARE: u32 = 1;

const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;

const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;

/// Bit offsets in the attr flag word.
const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_INHERIT: u64 = 1 << 1;

const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;
const PERF_IOC_FLAG_GROUP: libc::c_ulong = 1;

/// perf_event_attr through config2 (PERF_ATTR_SIZE_VER1, 72 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
}

impl PerfEventAttr {
    fn counting(type_: u32, config: u64) -> Self {
        Self {
            type_,
            size: mem::size_of::<Self>() as u32,
            config,
            read_format: PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING,
            // Start disabled; the group is enabled atomically once every
            // member is attached. inherit makes child threads count too.
            flags: ATTR_DISABLED | ATTR_INHERIT,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum PmuError {
    #[error("perf_event_open failed for {slot} (type={event_type} config={config} pid={pid} cpu={cpu}): {source}")]
    Open {
        slot: &'static str,
        event_type: u32,
        config: u64,
        pid: i32,
        cpu: i32,
        #[source]
        source: io::Error,
    },
    #[error("insufficient counters open ({open}); need at least {CRITICAL_MIN} (cycles, instructions)")]
    InsufficientCounters { open: usize },
    #[error("counter read failed for {slot}: {source}")]
    Read {
        slot: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("PERF_EVENT_IOC group ioctl failed: {0}")]
    GroupControl(#[source] io::Error),
}

/// Snapshot of the six cumulative counters, scaling already applied.
/// Field positions match the fixed slot order used across the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmuReading {
    pub cycles: u64,
    pub instructions: u64,
    pub cache_misses: u64,
    pub branch_misses: u64,
    pub branch_instructions: u64,
    pub cache_references: u64,
}

impl PmuReading {
    /// Per-slot delta for the interval since `prev`. Wrapping keeps a
    /// scaling-induced regression from panicking in debug builds.
    pub fn delta_since(&self, prev: &Self) -> Self {
        Self {
            cycles: self.cycles.wrapping_sub(prev.cycles),
            instructions: self.instructions.wrapping_sub(prev.instructions),
            cache_misses: self.cache_misses.wrapping_sub(prev.cache_misses),
            branch_misses: self.branch_misses.wrapping_sub(prev.branch_misses),
            branch_instructions: self
                .branch_instructions
                .wrapping_sub(prev.branch_instructions),
            cache_references: self.cache_references.wrapping_sub(prev.cache_references),
        }
    }
}

/// Open counter group. Mandatory slots hold their descriptor directly;
/// optional slots may be absent. Descriptors close on drop, leader last.
pub struct PerfCounterGroup {
    /// Group leader.
    cycles: OwnedFd,
    instructions: OwnedFd,
    cache_misses: Option<OwnedFd>,
    branch_misses: Option<OwnedFd>,
    branch_instructions: Option<OwnedFd>,
    cache_references: Option<OwnedFd>,
}

impl PerfCounterGroup {
    /// Open the group for (cpu, pid). `(-1, -1)` is normalized to monitoring
    /// the current process; cpu = −1 is probed once and falls back to cpu 0
    /// on kernels/VMs that reject it with ENOENT.
    pub fn open(cpu: i32, pid: i32) -> Result<Self, PmuError> {
        let (mut cpu, mut pid) = (cpu, pid);
        if pid == -1 && cpu == -1 {
            warn!("pid=-1 with cpu=-1 is invalid; defaulting to current process");
            pid = 0;
        }

        if cpu == -1 {
            cpu = probe_any_cpu(pid);
        }

        let cycles = open_counter("cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES, pid, cpu, -1)?;
        let leader = cycles.as_raw_fd();
        debug!(slot = "cycles", "opened counter (group leader)");

        let instructions = open_counter(
            "instructions",
            PERF_TYPE_HARDWARE,
            PERF_COUNT_HW_INSTRUCTIONS,
            pid,
            cpu,
            leader,
        )?;
        debug!(slot = "instructions", "opened counter");

        let cache_misses = open_with_fallback(
            "cache_misses",
            &[
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
                (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
            ],
            pid,
            cpu,
            leader,
        );
        let branch_misses = open_optional(
            "branch_misses",
            PERF_TYPE_HARDWARE,
            PERF_COUNT_HW_BRANCH_MISSES,
            pid,
            cpu,
            leader,
        );
        let branch_instructions = open_optional(
            "branch_instructions",
            PERF_TYPE_HARDWARE,
            PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
            pid,
            cpu,
            leader,
        );
        let cache_references = open_optional(
            "cache_references",
            PERF_TYPE_HARDWARE,
            PERF_COUNT_HW_CACHE_REFERENCES,
            pid,
            cpu,
            leader,
        );

        let group = Self {
            cycles,
            instructions,
            cache_misses,
            branch_misses,
            branch_instructions,
            cache_references,
        };

        if group.open_count() < CRITICAL_MIN {
            return Err(PmuError::InsufficientCounters {
                open: group.open_count(),
            });
        }

        // Reset and enable the whole group atomically through the leader so
        // all members start measuring the same window.
        if let Err(err) = group.group_ioctl(PERF_EVENT_IOC_RESET) {
            warn!(error = %err, "PERF_EVENT_IOC_RESET failed");
        }
        group
            .group_ioctl(PERF_EVENT_IOC_ENABLE)
            .map_err(PmuError::GroupControl)?;

        Ok(group)
    }

    pub fn open_count(&self) -> usize {
        2 + [
            &self.cache_misses,
            &self.branch_misses,
            &self.branch_instructions,
            &self.cache_references,
        ]
        .iter()
        .filter(|fd| fd.is_some())
        .count()
    }

    /// Read every open slot with multiplexing correction applied. Unopened
    /// slots produce zero. Fails only on a read error of an open slot.
    pub fn read(&self) -> Result<PmuReading, PmuError> {
        let read_slot = |slot: &'static str, fd: Option<&OwnedFd>| -> Result<u64, PmuError> {
            match fd {
                Some(fd) => {
                    read_scaled(fd.as_raw_fd()).map_err(|source| PmuError::Read { slot, source })
                }
                None => Ok(0),
            }
        };

        Ok(PmuReading {
            cycles: read_slot("cycles", Some(&self.cycles))?,
            instructions: read_slot("instructions", Some(&self.instructions))?,
            cache_misses: read_slot("cache_misses", self.cache_misses.as_ref())?,
            branch_misses: read_slot("branch_misses", self.branch_misses.as_ref())?,
            branch_instructions: read_slot(
                "branch_instructions",
                self.branch_instructions.as_ref(),
            )?,
            cache_references: read_slot("cache_references", self.cache_references.as_ref())?,
        })
    }

    pub fn reset(&self) -> Result<(), PmuError> {
        self.group_ioctl(PERF_EVENT_IOC_RESET)
            .map_err(PmuError::GroupControl)
    }

    pub fn enable(&self) -> Result<(), PmuError> {
        self.group_ioctl(PERF_EVENT_IOC_ENABLE)
            .map_err(PmuError::GroupControl)
    }

    pub fn disable(&self) -> Result<(), PmuError> {
        self.group_ioctl(PERF_EVENT_IOC_DISABLE)
            .map_err(PmuError::GroupControl)
    }

    fn group_ioctl(&self, request: libc::c_ulong) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(self.cycles.as_raw_fd(), request, PERF_IOC_FLAG_GROUP) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn perf_event_open(
    attr: &PerfEventAttr,
    pid: i32,
    cpu: i32,
    group_fd: RawFd,
) -> io::Result<OwnedFd> {
    // SAFETY: attr is a fully initialized repr(C) struct with its size field
    // set; the kernel copies it and owns nothing beyond the call.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            0usize,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the syscall returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn open_counter(
    slot: &'static str,
    event_type: u32,
    config: u64,
    pid: i32,
    cpu: i32,
    group_fd: RawFd,
) -> Result<OwnedFd, PmuError> {
    let attr = PerfEventAttr::counting(event_type, config);
    perf_event_open(&attr, pid, cpu, group_fd).map_err(|source| PmuError::Open {
        slot,
        event_type,
        config,
        pid,
        cpu,
        source,
    })
}

fn open_optional(
    slot: &'static str,
    event_type: u32,
    config: u64,
    pid: i32,
    cpu: i32,
    group_fd: RawFd,
) -> Option<OwnedFd> {
    match open_counter(slot, event_type, config, pid, cpu, group_fd) {
        Ok(fd) => {
            debug!(slot, "opened counter");
            Some(fd)
        }
        Err(err) => {
            debug!(slot, error = %err, "optional counter unavailable");
            None
        }
    }
}

/// First-success strategy over alternative events for one slot. Constrained
/// CPUs and minimal VMs often lack the preferred hardware event but accept a
/// coarser stand-in.
fn open_with_fallback(
    slot: &'static str,
    alternatives: &[(u32, u64)],
    pid: i32,
    cpu: i32,
    group_fd: RawFd,
) -> Option<OwnedFd> {
    for &(event_type, config) in alternatives {
        if let Ok(fd) = perf_event_open(
            &PerfEventAttr::counting(event_type, config),
            pid,
            cpu,
            group_fd,
        ) {
            debug!(slot, event_type, config, "opened counter");
            return Some(fd);
        }
    }
    warn!(slot, "all alternatives failed; slot will read as zero");
    None
}

/// Probe whether the kernel accepts cpu = −1 for this pid; some hypervisors
/// reject it with ENOENT, in which case we settle on cpu 0.
fn probe_any_cpu(pid: i32) -> i32 {
    let attr = PerfEventAttr::counting(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES);
    match perf_event_open(&attr, pid, -1, -1) {
        Ok(_probe) => -1,
        Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
            warn!("cpu=-1 not supported (ENOENT); using cpu 0");
            0
        }
        // Other failures are diagnosed by the real open that follows.
        Err(_) => -1,
    }
}

/// Read one counter with its scaling timestamps and correct for
/// multiplexing: never scheduled → 0; partially scheduled → scale by
/// enabled/running; fully scheduled → raw value.
fn read_scaled(fd: RawFd) -> io::Result<u64> {
    let mut raw = [0u8; 24];
    // SAFETY: raw is a 24-byte buffer matching the read_format layout
    // { value, time_enabled, time_running }.
    let n = unsafe { libc::read(fd, raw.as_mut_ptr() as *mut libc::c_void, raw.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != raw.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short perf counter read",
        ));
    }

    let word = |idx: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&raw[idx * 8..idx * 8 + 8]);
        u64::from_ne_bytes(b)
    };

    Ok(scale_reading(word(0), word(1), word(2)))
}

pub(crate) fn scale_reading(value: u64, time_enabled: u64, time_running: u64) -> u64 {
    if time_running == 0 {
        0
    } else if time_running < time_enabled {
        ((value as u128 * time_enabled as u128) / time_running as u128) as u64
    } else {
        value
    }
}

#[cfg(test)]
pub(crate) fn attr_struct_size() -> usize {
    mem::size_of::<PerfEventAttr>()
}
