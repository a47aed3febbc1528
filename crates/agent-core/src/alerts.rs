//! Structured alert sink: single-line JSON to stdout, optionally appended to
//! a file and mirrored to syslog, rate-limited by a cooldown measured on the
//! raw monotonic clock (immune to wall-clock adjustment).

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use platform_linux::monotonic_ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }

    fn syslog_priority(self) -> libc::c_int {
        match self {
            Self::Info => libc::LOG_INFO,
            Self::Warning => libc::LOG_WARNING,
            Self::Critical => libc::LOG_CRIT,
        }
    }
}

pub struct AlertSink {
    file: Option<File>,
    to_syslog: bool,
    cooldown_ns: u64,
    last_alert_ns: u64,
}

impl AlertSink {
    /// Failing to open the log file is an initialization failure: an alert
    /// sink that silently loses its file defeats the point of the detector.
    pub fn new(log_file: Option<&Path>, to_syslog: bool, cooldown_sec: u32) -> io::Result<Self> {
        let file = match log_file {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };

        if to_syslog {
            // The ident pointer must stay valid for the life of the process.
            static IDENT: &[u8] = b"cpu-sentinel\0";
            unsafe {
                libc::openlog(
                    IDENT.as_ptr() as *const libc::c_char,
                    libc::LOG_PID | libc::LOG_NDELAY,
                    libc::LOG_DAEMON,
                );
            }
        }

        Ok(Self {
            file,
            to_syslog,
            cooldown_ns: u64::from(cooldown_sec) * 1_000_000_000,
            last_alert_ns: 0,
        })
    }

    /// Emit one alert unless the cooldown window since the previous emitted
    /// alert has not elapsed yet.
    pub fn alert(
        &mut self,
        level: AlertLevel,
        timestamp_ns: u64,
        pid: i32,
        comm: &str,
        anomaly_score: f64,
        reason: &str,
    ) {
        let now = monotonic_ns();
        if self.cooldown_ns > 0
            && self.last_alert_ns > 0
            && now.saturating_sub(self.last_alert_ns) < self.cooldown_ns
        {
            return;
        }
        self.last_alert_ns = now;

        let line = render_alert(level, timestamp_ns, pid, comm, anomaly_score, reason);
        self.write_line(level, &line);
    }

    fn write_line(&mut self, level: AlertLevel, line: &str) {
        {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{line}");
            let _ = stdout.flush();
        }

        if let Some(file) = &mut self.file {
            // One retry on a failed write, then best-effort.
            if write_alert_line(file, line).is_err() {
                let _ = write_alert_line(file, line);
            }
        }

        if self.to_syslog {
            if let Ok(msg) = CString::new(line) {
                static FMT: &[u8] = b"%s\0";
                unsafe {
                    libc::syslog(
                        level.syslog_priority(),
                        FMT.as_ptr() as *const libc::c_char,
                        msg.as_ptr(),
                    );
                }
            }
        }
    }
}

impl Drop for AlertSink {
    fn drop(&mut self) {
        if let Some(file) = &mut self.file {
            let _ = file.flush();
        }
        if self.to_syslog {
            unsafe { libc::closelog() };
        }
    }
}

/// Render the single-line JSON alert. String fields go through serde_json so
/// quotes, backslashes and control characters are escaped; the score is
/// fixed to four decimals.
fn render_alert(
    level: AlertLevel,
    timestamp_ns: u64,
    pid: i32,
    comm: &str,
    anomaly_score: f64,
    reason: &str,
) -> String {
    format!(
        "{{\"level\":\"{}\",\"timestamp\":{},\"pid\":{},\"comm\":{},\"anomaly_score\":{:.4},\"reason\":{}}}",
        level.as_str(),
        timestamp_ns,
        pid,
        json_string(comm),
        anomaly_score,
        json_string(reason),
    )
}

fn json_string(raw: &str) -> String {
    serde_json::to_string(raw).unwrap_or_else(|_| "\"\"".to_string())
}

fn write_alert_line(file: &mut File, line: &str) -> io::Result<()> {
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()
}
