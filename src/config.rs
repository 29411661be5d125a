use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;

use crate::limits::MAX_HOLD_TTL_MINUTES;

/// Daemon settings, read from `CARHOLD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// How long a hold lasts while the renter pays.
    pub hold_ttl: TimeDelta,
    /// Extra time an unpaid booking survives past the hold TTL before the sweeper drops it.
    pub stale_grace: TimeDelta,
    pub sweep_interval: Duration,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub compact_check_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            hold_ttl: TimeDelta::minutes(15),
            stale_grace: TimeDelta::minutes(5),
            sweep_interval: Duration::from_secs(30),
            compact_threshold: 1000,
            compact_check_interval: Duration::from_secs(60),
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("ignoring {key}={raw:?}: not a valid value");
                    None
                }
            }
        }

        let defaults = Self::default();
        let hold_ttl = parsed::<i64>(&lookup, "CARHOLD_HOLD_TTL_MINUTES")
            .filter(|m| (1..=MAX_HOLD_TTL_MINUTES).contains(m))
            .map(TimeDelta::minutes)
            .unwrap_or(defaults.hold_ttl);
        let stale_grace = parsed::<i64>(&lookup, "CARHOLD_STALE_GRACE_MINUTES")
            .filter(|m| *m >= 0)
            .map(TimeDelta::minutes)
            .unwrap_or(defaults.stale_grace);

        Self {
            data_dir: lookup("CARHOLD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            hold_ttl,
            stale_grace,
            sweep_interval: parsed::<u64>(&lookup, "CARHOLD_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            compact_threshold: parsed(&lookup, "CARHOLD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            compact_check_interval: parsed::<u64>(&lookup, "CARHOLD_COMPACT_CHECK_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.compact_check_interval),
            metrics_port: parsed(&lookup, "CARHOLD_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("carhold.wal")
    }

    /// Age after which an unpaid booking counts as abandoned.
    pub fn stale_after(&self) -> TimeDelta {
        self.hold_ttl + self.stale_grace
    }
}
