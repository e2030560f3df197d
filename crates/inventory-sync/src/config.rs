use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::tombstone::DEFAULT_RETENTION;

pub const ENV_INTERVAL_SECS: &str = "INVENTORY_SYNC_INTERVAL_SECS";
pub const ENV_TOMBSTONE_DAYS: &str = "INVENTORY_SYNC_TOMBSTONE_DAYS";
pub const ENV_BATCH_SIZE: &str = "INVENTORY_SYNC_BATCH_SIZE";
pub const ENV_MAX_CONCURRENT_BATCHES: &str = "INVENTORY_SYNC_MAX_CONCURRENT_BATCHES";
pub const ENV_ORPHAN_GRACE_CYCLES: &str = "INVENTORY_SYNC_ORPHAN_GRACE_CYCLES";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Time between automatic cycles
    pub interval: Duration,
    /// How long a tombstone suppresses remote re-creation
    pub tombstone_retention: Duration,
    /// Records per outbound upsert request
    pub batch_size: usize,
    /// Outbound requests in flight at once
    pub max_concurrent_batches: usize,
    /// Retry policy for transient remote errors
    pub retry: RetryPolicy,
    /// Consecutive empty cycles before an orphaned Location or Category is
    /// deleted. `None` disables orphan cleanup.
    pub orphan_grace_cycles: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            tombstone_retention: DEFAULT_RETENTION,
            batch_size: 400,
            max_concurrent_batches: 4,
            retry: RetryPolicy::default(),
            orphan_grace_cycles: Some(3),
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `INVENTORY_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = parse::<u64>(&lookup, ENV_INTERVAL_SECS)? {
            config.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(days) = parse::<u32>(&lookup, ENV_TOMBSTONE_DAYS)? {
            config.tombstone_retention = DAY * days;
        }
        if let Some(size) = parse::<usize>(&lookup, ENV_BATCH_SIZE)? {
            config.batch_size = positive(ENV_BATCH_SIZE, size)?;
        }
        if let Some(max) = parse::<usize>(&lookup, ENV_MAX_CONCURRENT_BATCHES)? {
            config.max_concurrent_batches = positive(ENV_MAX_CONCURRENT_BATCHES, max)?;
        }
        if let Some(value) = lookup(ENV_ORPHAN_GRACE_CYCLES) {
            config.orphan_grace_cycles = if value.trim().eq_ignore_ascii_case("off") {
                None
            } else {
                Some(parse_value(ENV_ORPHAN_GRACE_CYCLES, &value)?)
            };
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var).map(|value| parse_value(var, &value)).transpose()
}

fn parse_value<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

fn positive(var: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        });
    }
    Ok(value)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.tombstone_retention, DAY * 30);
        assert_eq!(config.orphan_grace_cycles, Some(3));
    }

    #[test]
    fn test_env_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            (ENV_INTERVAL_SECS, "60"),
            (ENV_TOMBSTONE_DAYS, "7"),
            (ENV_BATCH_SIZE, "100"),
            (ENV_MAX_CONCURRENT_BATCHES, "2"),
            (ENV_ORPHAN_GRACE_CYCLES, "off"),
        ]))
        .unwrap();

        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.tombstone_retention, DAY * 7);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_concurrent_batches, 2);
        assert_eq!(config.orphan_grace_cycles, None);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = SyncConfig::from_lookup(lookup(&[(ENV_BATCH_SIZE, "lots")])).unwrap_err();
        assert!(err.to_string().contains(ENV_BATCH_SIZE));

        assert!(SyncConfig::from_lookup(lookup(&[(ENV_MAX_CONCURRENT_BATCHES, "0")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[(ENV_ORPHAN_GRACE_CYCLES, "-1")])).is_err());
    }
}
