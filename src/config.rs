use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime knobs. `from_env` reads `SNIPE_*` variables; anything unset or
/// unparsable keeps its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub poll_interval: Duration,
    pub cache_ttl: Duration,
    /// How far ahead armed jobs are pulled into the in-memory due queue.
    pub dispatch_horizon: Duration,
    /// Extra tries after a transient vendor failure.
    pub max_attempt_retries: u32,
    pub retry_backoff: Duration,
    pub vendor_timeout: Duration,
    pub dispatch_tick: Duration,
    /// A job is due once `now + dispatch_jitter >= scheduled_execution`.
    pub dispatch_jitter: Duration,
    pub archive_retention: Duration,
    /// Treat a vendor Conflict as the end of the slot for every account.
    pub conflict_ends_slot: bool,
    /// First delay when a store write is retried; doubles up to 5s.
    pub store_retry_backoff: Duration,
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub plan: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(60),
            dispatch_horizon: Duration::from_secs(3600),
            max_attempt_retries: 3,
            retry_backoff: Duration::from_millis(250),
            vendor_timeout: Duration::from_millis(5000),
            dispatch_tick: Duration::from_millis(100),
            dispatch_jitter: Duration::from_millis(50),
            archive_retention: Duration::from_secs(7 * 24 * 3600),
            conflict_ends_slot: false,
            store_retry_backoff: Duration::from_millis(50),
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            metrics_port: None,
            plan: None,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |name: &str, default: Duration| env_parse::<u64>(name).map_or(default, Duration::from_secs);
        let millis = |name: &str, default: Duration| env_parse::<u64>(name).map_or(default, Duration::from_millis);
        Self {
            poll_interval: secs("SNIPE_POLL_INTERVAL_SECS", d.poll_interval),
            cache_ttl: secs("SNIPE_CACHE_TTL_SECS", d.cache_ttl),
            dispatch_horizon: secs("SNIPE_DISPATCH_HORIZON_SECS", d.dispatch_horizon),
            max_attempt_retries: env_parse("SNIPE_MAX_ATTEMPT_RETRIES").unwrap_or(d.max_attempt_retries),
            retry_backoff: millis("SNIPE_RETRY_BACKOFF_MS", d.retry_backoff),
            vendor_timeout: millis("SNIPE_VENDOR_TIMEOUT_MS", d.vendor_timeout),
            dispatch_tick: millis("SNIPE_DISPATCH_TICK_MS", d.dispatch_tick),
            dispatch_jitter: millis("SNIPE_DISPATCH_JITTER_MS", d.dispatch_jitter),
            archive_retention: secs("SNIPE_ARCHIVE_RETENTION_SECS", d.archive_retention),
            conflict_ends_slot: env_bool("SNIPE_CONFLICT_ENDS_SLOT").unwrap_or(d.conflict_ends_slot),
            store_retry_backoff: d.store_retry_backoff,
            data_dir: std::env::var("SNIPE_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            compact_threshold: env_parse("SNIPE_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            metrics_port: env_parse("SNIPE_METRICS_PORT"),
            plan: std::env::var("SNIPE_PLAN").ok().map(PathBuf::from),
        }
    }

    /// Zero intervals would spin the background loops.
    pub fn validated(mut self) -> Self {
        let floor = Duration::from_millis(1);
        self.poll_interval = self.poll_interval.max(floor);
        self.dispatch_tick = self.dispatch_tick.max(floor);
        self.vendor_timeout = self.vendor_timeout.max(floor);
        self
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("snipe.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.max_attempt_retries, 3);
        assert!(!c.conflict_ends_slot);
        assert_eq!(c.wal_path(), PathBuf::from("./data/snipe.wal"));
    }

    #[test]
    fn env_overrides_and_bad_values_fall_back() {
        unsafe {
            std::env::set_var("SNIPE_MAX_ATTEMPT_RETRIES", "7");
            std::env::set_var("SNIPE_RETRY_BACKOFF_MS", "not-a-number");
            std::env::set_var("SNIPE_CONFLICT_ENDS_SLOT", "yes");
            std::env::set_var("SNIPE_CACHE_TTL_SECS", "15");
        }
        let c = Config::from_env();
        assert_eq!(c.max_attempt_retries, 7);
        assert_eq!(c.retry_backoff, Config::default().retry_backoff);
        assert!(c.conflict_ends_slot);
        assert_eq!(c.cache_ttl, Duration::from_secs(15));
        unsafe {
            std::env::remove_var("SNIPE_MAX_ATTEMPT_RETRIES");
            std::env::remove_var("SNIPE_RETRY_BACKOFF_MS");
            std::env::remove_var("SNIPE_CONFLICT_ENDS_SLOT");
            std::env::remove_var("SNIPE_CACHE_TTL_SECS");
        }
    }

    #[test]
    fn validated_floors_zero_intervals() {
        let c = Config {
            dispatch_tick: Duration::ZERO,
            poll_interval: Duration::ZERO,
            ..Config::default()
        }
        .validated();
        assert!(c.dispatch_tick > Duration::ZERO);
        assert!(c.poll_interval > Duration::ZERO);
    }
}
