//! The clock-quality aggregator's published output (spec §4.6/§6): a
//! small YAML document that tells an external PTP server process what
//! clock class/accuracy to advertise. `ptpdisc` owns the write side —
//! it diffs the pending config against what's on disk, rewrites only on
//! change, and signals the consumer process with `SIGHUP` so it reloads.

use crate::error::{PtpdiscError, Result};
use crate::quality::{ClockAccuracy, ClockClass};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Serde helpers for the `Ns`/`Nm`/`Nh` duration strings used by the
/// published config file (`30s`, `5m`, `1h`).
pub mod duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn parse(text: &str) -> std::result::Result<Duration, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty duration".to_string());
        }
        let (digits, unit) = text.split_at(text.len() - 1);
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("bad duration {text:?}: expected digits followed by s/m/h"))?;
        let secs = match unit {
            "s" => amount,
            "m" => amount * 60,
            "h" => amount * 3600,
            other => return Err(format!("bad duration unit {other:?} in {text:?}: expected s, m, or h")),
        };
        Ok(Duration::from_secs(secs))
    }

    pub fn format(d: Duration) -> String {
        format!("{}s", d.as_secs())
    }

    pub fn serialize<S>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format(*d).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(serde::de::Error::custom)
    }
}

/// The config file read by the external PTP server (spec §6 "Dynamic
/// config file"). Round-trips bitwise through YAML (spec §8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub clockaccuracy: u8,
    pub clockclass: u8,
    #[serde(with = "duration")]
    pub draininterval: Duration,
    #[serde(with = "duration")]
    pub maxsubduration: Duration,
    #[serde(with = "duration")]
    pub metricinterval: Duration,
    #[serde(with = "duration")]
    pub minsubinterval: Duration,
    #[serde(with = "duration")]
    pub utcoffset: Duration,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        DynamicConfig {
            clockaccuracy: ClockAccuracy::Unknown.code(),
            clockclass: ClockClass::Uncalibrated.code(),
            draininterval: Duration::from_secs(30),
            maxsubduration: Duration::from_secs(300),
            metricinterval: Duration::from_secs(1),
            minsubinterval: Duration::from_secs(2),
            utcoffset: Duration::from_secs(37),
        }
    }
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<DynamicConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| PtpdiscError::Config(format!("reading {}: {e}", path.display())))?;
    serde_yaml::from_str(&text).map_err(|e| PtpdiscError::Config(format!("parsing {}: {e}", path.display())))
}

/// Publishes a [`DynamicConfig`] atomically and notifies the consumer
/// process, but only when the pending value actually differs from what's
/// on disk (spec §8 idempotence property, seed scenario 4).
pub struct Publisher {
    config_path: PathBuf,
    consumer_pid_path: PathBuf,
    apply: bool,
    reload_count: u64,
}

impl Publisher {
    pub fn new(config_path: impl AsRef<Path>, consumer_pid_path: impl AsRef<Path>, apply: bool) -> Self {
        Publisher {
            config_path: config_path.as_ref().to_path_buf(),
            consumer_pid_path: consumer_pid_path.as_ref().to_path_buf(),
            apply,
            reload_count: 0,
        }
    }

    pub fn reload_count(&self) -> u64 {
        self.reload_count
    }

    /// Publish `pending` if it differs from the config currently on disk
    /// (or the defaults, if none exists yet). Returns whether a write
    /// happened. A write failure aborts only this publish, leaving the
    /// prior on-disk config intact (spec §7).
    pub fn publish(&mut self, pending: &DynamicConfig) -> Result<bool> {
        let current = load_from_path(&self.config_path).unwrap_or_default();
        if &current == pending {
            return Ok(false);
        }
        if !self.apply {
            return Ok(false);
        }
        write_atomic(&self.config_path, pending)?;
        self.signal_consumer()?;
        self.reload_count += 1;
        Ok(true)
    }

    fn signal_consumer(&self) -> Result<()> {
        let pid_text = std::fs::read_to_string(&self.consumer_pid_path)
            .map_err(|e| PtpdiscError::Transport(format!("reading pid file {}: {e}", self.consumer_pid_path.display())))?;
        let pid: i32 = pid_text
            .trim()
            .parse()
            .map_err(|e| PtpdiscError::Transport(format!("bad pid in {}: {e}", self.consumer_pid_path.display())))?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGHUP)
            .map_err(|e| PtpdiscError::Transport(format!("sending SIGHUP to pid {pid}: {e}")))?;
        Ok(())
    }
}

fn write_atomic(path: &Path, cfg: &DynamicConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(cfg).map_err(|e| PtpdiscError::Config(format!("marshaling config: {e}")))?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, yaml)
        .map_err(|e| PtpdiscError::Config(format!("writing {}: {e}", tmp_path.display())))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| PtpdiscError::Config(format!("renaming {} to {}: {e}", tmp_path.display(), path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Tests below point `consumer_pid_path` at this test process itself to
    /// observe that `publish()` sends SIGHUP. Without a handler installed,
    /// the default disposition would terminate the whole test binary.
    fn ignore_sighup_for_test() {
        unsafe {
            nix::sys::signal::signal(nix::sys::signal::Signal::SIGHUP, nix::sys::signal::SigHandler::SigIgn)
                .unwrap();
        }
    }

    #[test]
    fn default_config_round_trips_through_yaml() {
        let cfg = DynamicConfig::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let restored: DynamicConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(restored, cfg);
    }

    #[test]
    fn duration_parses_seconds_minutes_and_hours() {
        assert_eq!(duration::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(duration::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(duration::parse("1h").unwrap(), Duration::from_secs(3600));
        assert!(duration::parse("5x").is_err());
        assert!(duration::parse("").is_err());
    }

    #[test]
    fn load_from_path_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not: [valid, yaml for this schema").unwrap();
        let err = load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, PtpdiscError::Config(_)));
    }

    #[test]
    fn publish_is_idempotent_when_pending_matches_current() {
        ignore_sighup_for_test();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        let pid_path = dir.path().join("consumer.pid");
        std::fs::write(&pid_path, format!("{}\n", std::process::id())).unwrap();

        let cfg = DynamicConfig::default();
        write_atomic(&config_path, &cfg).unwrap();

        let mut publisher = Publisher::new(&config_path, &pid_path, true);
        let wrote = publisher.publish(&cfg).unwrap();
        assert!(!wrote);
        assert_eq!(publisher.reload_count(), 0);
    }

    #[test]
    fn publish_rewrites_and_signals_once_on_change() {
        ignore_sighup_for_test();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        let pid_path = dir.path().join("consumer.pid");
        std::fs::write(&pid_path, format!("{}\n", std::process::id())).unwrap();

        let mut cfg = DynamicConfig::default();
        write_atomic(&config_path, &cfg).unwrap();

        let mut publisher = Publisher::new(&config_path, &pid_path, true);
        cfg.clockclass = ClockClass::Holdover.code();
        cfg.clockaccuracy = ClockAccuracy::Us100.code();
        assert!(publisher.publish(&cfg).unwrap());
        assert_eq!(publisher.reload_count(), 1);

        // Publishing the same pending value again writes nothing further.
        assert!(!publisher.publish(&cfg).unwrap());
        assert_eq!(publisher.reload_count(), 1);

        let on_disk = load_from_path(&config_path).unwrap();
        assert_eq!(on_disk, cfg);
    }

    #[test]
    fn publish_leaves_prior_config_on_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("missing-dir").join("config.yaml");
        let pid_path = dir.path().join("consumer.pid");
        let mut publisher = Publisher::new(&config_path, &pid_path, true);
        let err = publisher.publish(&DynamicConfig::default()).unwrap_err();
        assert!(matches!(err, PtpdiscError::Config(_)));
    }
}
