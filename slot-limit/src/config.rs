use std::env;
use std::time::Duration;

use serde::Deserialize;

/// TTL used when the configured value is zero or negative.
pub const DEFAULT_SLOT_TTL_MINUTES: i64 = 15;

/// Longest TTL a cache will use. Larger settings are clamped to it.
pub const MAX_SLOT_TTL_MINUTES: i64 = 366 * 24 * 60;

const SLOT_TTL_ENV: &str = "CONCURRENCY_SLOT_TTL_MINUTES";

/// Settings for a [`ConcurrencyCache`](crate::ConcurrencyCache).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SlotConfig {
    /// Freshness window of a slot, and expiry of every key, in minutes.
    ///
    /// Values `<= 0` select [`DEFAULT_SLOT_TTL_MINUTES`], values above
    /// [`MAX_SLOT_TTL_MINUTES`] are clamped to it.
    pub slot_ttl_minutes: i64,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            slot_ttl_minutes: DEFAULT_SLOT_TTL_MINUTES,
        }
    }
}

impl SlotConfig {
    /// Load settings from the environment.
    ///
    /// `CONCURRENCY_SLOT_TTL_MINUTES` is optional. An unparsable value is an error rather
    /// than being silently replaced by the default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let slot_ttl_minutes = match env::var(SLOT_TTL_ENV) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(SLOT_TTL_ENV))?,
            Err(_) => DEFAULT_SLOT_TTL_MINUTES,
        };
        Ok(Self { slot_ttl_minutes })
    }

    /// The normalized TTL.
    pub fn slot_ttl(&self) -> Duration {
        normalize_ttl_minutes(self.slot_ttl_minutes)
    }
}

pub(crate) fn normalize_ttl_minutes(minutes: i64) -> Duration {
    let minutes = if minutes <= 0 {
        DEFAULT_SLOT_TTL_MINUTES
    } else {
        minutes.min(MAX_SLOT_TTL_MINUTES)
    };
    Duration::from_secs(minutes.unsigned_abs() * 60)
}

/// Whole seconds of `ttl`, clamped to [`MAX_SLOT_TTL_MINUTES`].
pub(crate) fn clamp_ttl_secs(ttl: Duration) -> Duration {
    Duration::from_secs(ttl.as_secs().min(MAX_SLOT_TTL_MINUTES.unsigned_abs() * 60))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ttl() {
        let cases = [
            (1, 60),
            (15, 900),
            (30, 1800),
            (0, 900),
            (-5, 900),
            (MAX_SLOT_TTL_MINUTES, MAX_SLOT_TTL_MINUTES as u64 * 60),
            (MAX_SLOT_TTL_MINUTES + 1, MAX_SLOT_TTL_MINUTES as u64 * 60),
            (i64::MAX, MAX_SLOT_TTL_MINUTES as u64 * 60),
        ];

        for (minutes, secs) in cases {
            assert_eq!(
                normalize_ttl_minutes(minutes),
                Duration::from_secs(secs),
                "normalize_ttl_minutes({minutes})"
            );
        }
    }

    #[test]
    fn test_clamp_ttl_secs() {
        let max = Duration::from_secs(MAX_SLOT_TTL_MINUTES as u64 * 60);
        assert_eq!(clamp_ttl_secs(Duration::from_millis(2500)), Duration::from_secs(2));
        assert_eq!(clamp_ttl_secs(max), max);
        assert_eq!(clamp_ttl_secs(Duration::MAX), max);
    }

    #[test]
    fn test_default_config() {
        let config = SlotConfig::default();
        assert_eq!(config.slot_ttl_minutes, DEFAULT_SLOT_TTL_MINUTES);
        assert_eq!(config.slot_ttl(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_deserialize_with_missing_fields() {
        let config: SlotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SlotConfig::default());

        let config: SlotConfig = serde_json::from_str(r#"{"slot_ttl_minutes": -1}"#).unwrap();
        assert_eq!(config.slot_ttl(), Duration::from_secs(15 * 60));

        let config: SlotConfig = serde_json::from_str(r#"{"slot_ttl_minutes": 2}"#).unwrap();
        assert_eq!(config.slot_ttl(), Duration::from_secs(120));
    }
}
