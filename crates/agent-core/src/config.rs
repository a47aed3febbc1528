//! Layered configuration: built-in defaults, then a key=value file, then
//! command-line overrides. Unknown keys and malformed lines warn and are
//! counted, never fatal — configuration hygiene should not take the
//! detector down.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentinelConfig {
    pub sampling_interval_us: u32,
    pub learning_duration_sec: u32,
    pub z_threshold: f64,
    pub burst_window: u32,
    /// Rounded up to a power of two by the ring.
    pub ringbuffer_capacity: usize,
    /// −1 = any CPU.
    pub target_cpu: i32,
    /// −1 = system-wide.
    pub target_pid: i32,
    /// JSON alerts are appended here when set.
    pub log_file: Option<String>,
    pub log_to_syslog: bool,
    pub verbose: bool,
    pub risk_decay_factor: f64,
    pub correlation_window_sec: u32,
    pub alert_cooldown_sec: u32,
    pub socket_path: String,
    pub enable_ml_output: bool,
    /// Open counters, read once, print, exit. CLI-only; not a file key.
    #[serde(skip)]
    pub pmu_test: bool,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            sampling_interval_us: 1_000,
            learning_duration_sec: 60,
            z_threshold: 3.5,
            burst_window: 10,
            ringbuffer_capacity: 8_192,
            target_cpu: -1,
            target_pid: -1,
            log_file: None,
            log_to_syslog: false,
            verbose: false,
            risk_decay_factor: 0.95,
            correlation_window_sec: 30,
            alert_cooldown_sec: 5,
            socket_path: "/tmp/cpu-sentinel.sock".to_string(),
            enable_ml_output: true,
            pmu_test: false,
        }
    }
}

impl SentinelConfig {
    /// Apply a key=value configuration file over the current values.
    /// Returns the number of lines that failed to apply (already warned).
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        Ok(self.apply_config_text(&raw, &path.display().to_string()))
    }

    fn apply_config_text(&mut self, raw: &str, origin: &str) -> usize {
        let mut errors = 0usize;

        for (lineno, raw_line) in raw.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((raw_key, raw_value)) = line.split_once('=') else {
                warn!(origin, line = lineno + 1, "config syntax error: expected key=value");
                errors += 1;
                continue;
            };

            let key = raw_key.trim();
            let value = raw_value.trim();
            if !self.apply_key(key, value) {
                errors += 1;
            }
        }

        errors
    }

    fn apply_key(&mut self, key: &str, value: &str) -> bool {
        match key {
            "sampling_interval_us" => parse_into(key, value, &mut self.sampling_interval_us),
            "learning_duration_sec" => parse_into(key, value, &mut self.learning_duration_sec),
            "z_threshold" => parse_into(key, value, &mut self.z_threshold),
            "burst_window" => parse_into(key, value, &mut self.burst_window),
            "ringbuffer_capacity" => parse_into(key, value, &mut self.ringbuffer_capacity),
            "target_cpu" => parse_into(key, value, &mut self.target_cpu),
            "target_pid" => parse_into(key, value, &mut self.target_pid),
            "log_file" => {
                // The field doubles as the file-sink toggle; a blank path
                // must not switch the sink on.
                if value.is_empty() {
                    warn!(key, "empty configuration value");
                    false
                } else {
                    self.log_file = Some(value.to_string());
                    true
                }
            }
            "log_to_syslog" => {
                self.log_to_syslog = parse_bool(value);
                true
            }
            "verbose" => {
                self.verbose = parse_bool(value);
                true
            }
            "risk_decay_factor" => parse_into(key, value, &mut self.risk_decay_factor),
            "correlation_window_sec" => parse_into(key, value, &mut self.correlation_window_sec),
            "alert_cooldown_sec" => parse_into(key, value, &mut self.alert_cooldown_sec),
            "socket_path" => {
                self.socket_path = value.to_string();
                true
            }
            "enable_ml_output" => {
                self.enable_ml_output = parse_bool(value);
                true
            }
            _ => {
                warn!(key, "unknown configuration key");
                false
            }
        }
    }

    /// Render in the same key=value shape the parser accepts, so
    /// serialize → reparse is the identity.
    pub fn to_config_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "sampling_interval_us = {}", self.sampling_interval_us);
        let _ = writeln!(out, "learning_duration_sec = {}", self.learning_duration_sec);
        let _ = writeln!(out, "z_threshold = {}", self.z_threshold);
        let _ = writeln!(out, "burst_window = {}", self.burst_window);
        let _ = writeln!(out, "ringbuffer_capacity = {}", self.ringbuffer_capacity);
        let _ = writeln!(out, "target_cpu = {}", self.target_cpu);
        let _ = writeln!(out, "target_pid = {}", self.target_pid);
        if let Some(log_file) = &self.log_file {
            let _ = writeln!(out, "log_file = {}", log_file);
        }
        let _ = writeln!(out, "log_to_syslog = {}", self.log_to_syslog);
        let _ = writeln!(out, "verbose = {}", self.verbose);
        let _ = writeln!(out, "risk_decay_factor = {}", self.risk_decay_factor);
        let _ = writeln!(out, "correlation_window_sec = {}", self.correlation_window_sec);
        let _ = writeln!(out, "alert_cooldown_sec = {}", self.alert_cooldown_sec);
        let _ = writeln!(out, "socket_path = {}", self.socket_path);
        let _ = writeln!(out, "enable_ml_output = {}", self.enable_ml_output);
        out
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) -> bool {
    match value.parse::<T>() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => {
            warn!(key, value, "invalid configuration value");
            false
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_baseline() {
        let cfg = SentinelConfig::default();
        assert_eq!(cfg.sampling_interval_us, 1_000);
        assert_eq!(cfg.learning_duration_sec, 60);
        assert_eq!(cfg.z_threshold, 3.5);
        assert_eq!(cfg.burst_window, 10);
        assert_eq!(cfg.ringbuffer_capacity, 8_192);
        assert_eq!(cfg.target_cpu, -1);
        assert_eq!(cfg.target_pid, -1);
        assert!(cfg.enable_ml_output);
        assert_eq!(cfg.alert_cooldown_sec, 5);
    }

    #[test]
    fn defaults_roundtrip_through_config_text() {
        let defaults = SentinelConfig::default();
        let mut reparsed = SentinelConfig::default();
        // Perturb so the parse provably restores every field.
        reparsed.sampling_interval_us = 1;
        reparsed.z_threshold = 99.0;
        reparsed.socket_path = "/nowhere".into();
        let errors = reparsed.apply_config_text(&defaults.to_config_string(), "test");
        assert_eq!(errors, 0);
        assert_eq!(reparsed, defaults);
    }

    #[test]
    fn non_default_values_roundtrip() {
        let mut cfg = SentinelConfig::default();
        cfg.sampling_interval_us = 250;
        cfg.z_threshold = 4.25;
        cfg.log_file = Some("/tmp/alerts.jsonl".into());
        cfg.log_to_syslog = true;
        cfg.target_pid = 4242;
        cfg.enable_ml_output = false;

        let mut reparsed = SentinelConfig::default();
        let errors = reparsed.apply_config_text(&cfg.to_config_string(), "test");
        assert_eq!(errors, 0);
        assert_eq!(reparsed, cfg);
    }

    #[test]
    fn unknown_keys_warn_and_count() {
        let mut cfg = SentinelConfig::default();
        let errors = cfg.apply_config_text(
            "sampling_interval_us = 500\nno_such_key = 1\nanother_bad = x\n",
            "test",
        );
        assert_eq!(errors, 2);
        assert_eq!(cfg.sampling_interval_us, 500);
    }

    #[test]
    fn malformed_lines_warn_and_count() {
        let mut cfg = SentinelConfig::default();
        let errors = cfg.apply_config_text("this line has no equals sign\n", "test");
        assert_eq!(errors, 1);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let mut cfg = SentinelConfig::default();
        let errors = cfg.apply_config_text("# comment\n\n   \nverbose = true\n", "test");
        assert_eq!(errors, 0);
        assert!(cfg.verbose);
    }

    #[test]
    fn empty_log_file_value_warns_and_keeps_sink_off() {
        let mut cfg = SentinelConfig::default();
        let errors = cfg.apply_config_text("log_file =\n", "test");
        assert_eq!(errors, 1);
        assert_eq!(cfg.log_file, None);

        // A previously configured path survives a later blank value.
        cfg.log_file = Some("/tmp/alerts.jsonl".into());
        let errors = cfg.apply_config_text("log_file =   \n", "test");
        assert_eq!(errors, 1);
        assert_eq!(cfg.log_file.as_deref(), Some("/tmp/alerts.jsonl"));
    }

    #[test]
    fn bad_numeric_value_keeps_previous() {
        let mut cfg = SentinelConfig::default();
        let errors = cfg.apply_config_text("sampling_interval_us = not_a_number\n", "test");
        assert_eq!(errors, 1);
        assert_eq!(cfg.sampling_interval_us, 1_000);
    }

    #[test]
    fn bool_parsing_accepts_common_forms() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("YES"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("junk"));
    }

    #[test]
    fn whitespace_around_key_and_value_is_trimmed() {
        let mut cfg = SentinelConfig::default();
        let errors = cfg.apply_config_text("  z_threshold   =   4.0  \n", "test");
        assert_eq!(errors, 0);
        assert_eq!(cfg.z_threshold, 4.0);
    }
}
