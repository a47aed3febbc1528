//! Preflight diagnostics for perf_event access.
//!
//! Neither check is fatal: they exist to turn the two most common
//! deployment failures (restrictive perf_event_paranoid, hypervisors that
//! hide the PMU) into actionable warnings before the first open fails with
//! a bare errno.

use std::fs;
use std::io;

use tracing::{info, warn};

/// Highest perf_event_paranoid level at which unprivileged counter groups
/// still work.
pub const MAX_SUPPORTED_PARANOID: i32 = 2;

pub fn run_preflight_checks() {
    check_perf_event_paranoid();
    check_hypervisor();
}

pub fn check_perf_event_paranoid() {
    let Ok(raw) = fs::read_to_string("/proc/sys/kernel/perf_event_paranoid") else {
        return;
    };
    if let Some(level) = parse_paranoid_level(&raw) {
        if level > MAX_SUPPORTED_PARANOID {
            warn!(
                level,
                max_supported = MAX_SUPPORTED_PARANOID,
                "perf_event_paranoid is restrictive; hardware counters may fail \
                 (try: sysctl kernel.perf_event_paranoid=2)"
            );
        }
    }
}

pub fn check_hypervisor() {
    let Ok(cpuinfo) = fs::read_to_string("/proc/cpuinfo") else {
        return;
    };
    if cpuinfo_reports_hypervisor(&cpuinfo) {
        info!("running inside a virtualized environment; PMU access may be restricted");
    }
}

/// Operator hint for a fatal counter-open failure, keyed on the errno class.
pub fn open_failure_hint(err: &io::Error) -> &'static str {
    match err.raw_os_error() {
        Some(libc::ENOENT) => {
            "the kernel/VM does not expose this event; try bare metal or enable PMU passthrough"
        }
        Some(libc::EACCES) | Some(libc::EPERM) => {
            "run as root and ensure kernel.perf_event_paranoid <= 2"
        }
        _ => "check perf_event support on this kernel",
    }
}

fn parse_paranoid_level(raw: &str) -> Option<i32> {
    raw.trim().parse::<i32>().ok()
}

fn cpuinfo_reports_hypervisor(cpuinfo: &str) -> bool {
    cpuinfo.lines().any(|line| line.contains("hypervisor"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paranoid_level_parses_with_trailing_newline() {
        assert_eq!(parse_paranoid_level("2\n"), Some(2));
        assert_eq!(parse_paranoid_level("-1\n"), Some(-1));
        assert_eq!(parse_paranoid_level("4"), Some(4));
        assert_eq!(parse_paranoid_level("junk"), None);
    }

    #[test]
    fn hypervisor_flag_detected_in_flags_line() {
        let cpuinfo = "processor : 0\nflags : fpu vme de pse hypervisor lahf_lm\n";
        assert!(cpuinfo_reports_hypervisor(cpuinfo));
    }

    #[test]
    fn bare_metal_cpuinfo_has_no_hypervisor() {
        let cpuinfo = "processor : 0\nflags : fpu vme de pse sse sse2\nmodel name : test\n";
        assert!(!cpuinfo_reports_hypervisor(cpuinfo));
    }

    #[test]
    fn open_failure_hints_name_the_likely_cause() {
        let enoent = io::Error::from_raw_os_error(libc::ENOENT);
        assert!(open_failure_hint(&enoent).contains("passthrough"));
        let eacces = io::Error::from_raw_os_error(libc::EACCES);
        assert!(open_failure_hint(&eacces).contains("perf_event_paranoid"));
    }
}
