//! Scanner configuration.
//!
//! Every knob has a production default. [`ScannerConfig::from_env`] overlays `SCANNER_*`
//! environment variables on top of the defaults; unparsable values are logged and ignored.

use crate::{error::ScannerError, sampler::SampleRates};
use serde::Deserialize;
use std::{str::FromStr, time::Duration};
use tracing::warn;

/// Scanner, flusher, refresher and feed configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Percent-move threshold (fraction, 0.01 = 1%) that anchors the priority tiers.
    pub tier_threshold: f64,
    /// Move from the last alerted price (fraction) required to fire an alert.
    pub alert_threshold: f64,
    /// Minimum time between two alerts for the same symbol.
    pub cooldown: Duration,
    /// Quotes with `(ask - bid) / mid` above this fraction are discarded.
    pub spread_cutoff: f64,
    pub sample_rates: SampleRates,
    pub snapshot_short: Duration,
    pub snapshot_long: Duration,

    /// Number of shard workers symbols are hashed across.
    pub shards: usize,
    pub shard_channel_capacity: usize,
    pub alert_queue_capacity: usize,

    /// Dirty symbol states that trigger an early state flush. Split evenly across shards,
    /// each shard requesting a flush once it holds its share.
    pub state_flush_size: usize,
    pub state_flush_interval: Duration,
    pub bar_flush_interval: Duration,
    /// Upper bound on completed bars retained while the store is failing.
    pub max_pending_bars: usize,

    pub stale_check_interval: Duration,
    pub stale_age: Duration,
    pub stale_batch_size: usize,
    /// How far back the refresher asks the provider for bars.
    pub stale_lookback: Duration,

    pub feed_url: String,
    pub feed_idle_timeout: Duration,
    pub reconnect_delay: Duration,
    pub historical_url: String,
    /// SQLite database path. `None` keeps everything in memory.
    pub sqlite_path: Option<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            tier_threshold: 0.01,
            alert_threshold: 0.01,
            cooldown: Duration::from_secs(30),
            spread_cutoff: 0.02,
            sample_rates: SampleRates::default(),
            snapshot_short: Duration::from_secs(5 * 60),
            snapshot_long: Duration::from_secs(15 * 60),
            shards: 8,
            shard_channel_capacity: 10_000,
            alert_queue_capacity: 1_024,
            state_flush_size: 100,
            state_flush_interval: Duration::from_secs(5),
            bar_flush_interval: Duration::from_secs(60),
            max_pending_bars: 500_000,
            stale_check_interval: Duration::from_secs(5 * 60),
            stale_age: Duration::from_secs(10 * 60),
            stale_batch_size: 100,
            stale_lookback: Duration::from_secs(30 * 60),
            feed_url: "ws://127.0.0.1:8765/ws".to_string(),
            feed_idle_timeout: Duration::from_secs(120),
            reconnect_delay: Duration::from_secs(5),
            historical_url: "http://127.0.0.1:8766".to_string(),
            sqlite_path: None,
        }
    }
}

impl ScannerConfig {
    /// Construct a [`ScannerConfig`] from defaults overlaid with `SCANNER_*` env vars.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_parse("SCANNER_TIER_THRESHOLD", &mut config.tier_threshold);
        env_parse("SCANNER_ALERT_THRESHOLD", &mut config.alert_threshold);
        env_secs("SCANNER_COOLDOWN_SECS", &mut config.cooldown);
        env_parse("SCANNER_SPREAD_CUTOFF", &mut config.spread_cutoff);
        env_parse("SCANNER_SHARDS", &mut config.shards);
        env_parse("SCANNER_SHARD_CHANNEL_CAPACITY", &mut config.shard_channel_capacity);
        env_parse("SCANNER_ALERT_QUEUE_CAPACITY", &mut config.alert_queue_capacity);
        env_parse("SCANNER_STATE_FLUSH_SIZE", &mut config.state_flush_size);
        env_secs("SCANNER_STATE_FLUSH_SECS", &mut config.state_flush_interval);
        env_secs("SCANNER_BAR_FLUSH_SECS", &mut config.bar_flush_interval);
        env_parse("SCANNER_MAX_PENDING_BARS", &mut config.max_pending_bars);
        env_secs("SCANNER_STALE_CHECK_SECS", &mut config.stale_check_interval);
        env_secs("SCANNER_STALE_AGE_SECS", &mut config.stale_age);
        env_parse("SCANNER_STALE_BATCH_SIZE", &mut config.stale_batch_size);
        env_secs("SCANNER_STALE_LOOKBACK_SECS", &mut config.stale_lookback);
        env_secs("SCANNER_FEED_IDLE_TIMEOUT_SECS", &mut config.feed_idle_timeout);
        env_secs("SCANNER_RECONNECT_DELAY_SECS", &mut config.reconnect_delay);

        if let Ok(url) = std::env::var("SCANNER_FEED_URL") {
            config.feed_url = url;
        }
        if let Ok(url) = std::env::var("SCANNER_HISTORICAL_URL") {
            config.historical_url = url;
        }
        if let Ok(path) = std::env::var("SCANNER_SQLITE_PATH") {
            config.sqlite_path = Some(path).filter(|path| !path.is_empty());
        }

        config
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ScannerError> {
        let positive = [
            ("tier_threshold", self.tier_threshold),
            ("alert_threshold", self.alert_threshold),
            ("spread_cutoff", self.spread_cutoff),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ScannerError::Config(format!("{name} must be > 0, got {value}")));
            }
        }

        let non_zero = [
            ("shards", self.shards),
            ("shard_channel_capacity", self.shard_channel_capacity),
            ("alert_queue_capacity", self.alert_queue_capacity),
            ("state_flush_size", self.state_flush_size),
            ("stale_batch_size", self.stale_batch_size),
            ("max_pending_bars", self.max_pending_bars),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ScannerError::Config(format!("{name} must be > 0")));
            }
        }

        // Timer periods must be non-zero
        let periods = [
            ("state_flush_interval", self.state_flush_interval),
            ("bar_flush_interval", self.bar_flush_interval),
            ("stale_check_interval", self.stale_check_interval),
            ("feed_idle_timeout", self.feed_idle_timeout),
        ];
        for (name, value) in periods {
            if value.is_zero() {
                return Err(ScannerError::Config(format!("{name} must be non-zero")));
            }
        }

        self.sample_rates.validate()
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_tier_threshold(mut self, threshold: f64) -> Self {
        self.tier_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_state_flush(mut self, size: usize, interval: Duration) -> Self {
        self.state_flush_size = size;
        self.state_flush_interval = interval;
        self
    }

    pub fn with_bar_flush_interval(mut self, interval: Duration) -> Self {
        self.bar_flush_interval = interval;
        self
    }

    pub fn with_staleness(mut self, check_interval: Duration, age: Duration) -> Self {
        self.stale_check_interval = check_interval;
        self.stale_age = age;
        self
    }

    pub fn with_sqlite_path(mut self, path: impl Into<String>) -> Self {
        self.sqlite_path = Some(path.into());
        self
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "ignoring unparsable config value"),
        }
    }
}

fn env_secs(key: &str, target: &mut Duration) {
    let mut secs = target.as_secs();
    env_parse(key, &mut secs);
    *target = Duration::from_secs(secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScannerConfig::default();
        assert_eq!(config.alert_threshold, 0.01);
        assert_eq!(config.cooldown, Duration::from_secs(30));
        assert_eq!(config.spread_cutoff, 0.02);
        assert_eq!(config.state_flush_size, 100);
        assert_eq!(config.state_flush_interval, Duration::from_secs(5));
        assert_eq!(config.bar_flush_interval, Duration::from_secs(60));
        assert_eq!(config.stale_check_interval, Duration::from_secs(300));
        assert_eq!(config.stale_age, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ScannerConfig::default()
            .with_shards(2)
            .with_cooldown(Duration::from_secs(10))
            .with_state_flush(5, Duration::from_secs(1))
            .with_sqlite_path("/tmp/scanner.db");

        assert_eq!(config.shards, 2);
        assert_eq!(config.cooldown, Duration::from_secs(10));
        assert_eq!(config.state_flush_size, 5);
        assert_eq!(config.state_flush_interval, Duration::from_secs(1));
        assert_eq!(config.sqlite_path.as_deref(), Some("/tmp/scanner.db"));
    }

    #[test]
    fn test_config_validate() {
        struct TestCase {
            input: ScannerConfig,
            expected_ok: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: defaults are valid
                input: ScannerConfig::default(),
                expected_ok: true,
            },
            TestCase {
                // TC1: zero shards rejected
                input: ScannerConfig::default().with_shards(0),
                expected_ok: false,
            },
            TestCase {
                // TC2: negative tier threshold rejected
                input: ScannerConfig::default().with_tier_threshold(-0.01),
                expected_ok: false,
            },
            TestCase {
                // TC3: NaN tier threshold rejected
                input: ScannerConfig::default().with_tier_threshold(f64::NAN),
                expected_ok: false,
            },
            TestCase {
                // TC4: zero state flush size rejected
                input: ScannerConfig::default().with_state_flush(0, Duration::from_secs(5)),
                expected_ok: false,
            },
            TestCase {
                // TC5: zero bar flush period rejected
                input: ScannerConfig::default().with_bar_flush_interval(Duration::ZERO),
                expected_ok: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.validate();
            assert_eq!(actual.is_ok(), test.expected_ok, "TC{} failed", index);
            if let Err(error) = actual {
                assert!(error.is_fatal(), "TC{} failed", index);
            }
        }
    }

    #[test]
    fn test_config_deserialise_partial() {
        let config: ScannerConfig =
            serde_json::from_str(r#"{ "shards": 4, "tier_threshold": 0.02 }"#).unwrap();
        assert_eq!(config.shards, 4);
        assert_eq!(config.tier_threshold, 0.02);
        assert_eq!(config.alert_threshold, 0.01);
    }
}
