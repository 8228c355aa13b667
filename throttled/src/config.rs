//! Configuration for limiters and runners.
//!
//! Both configs deserialize from plain data (intervals in milliseconds) so
//! they can sit inside an application's own settings file.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tokio::sync::Semaphore;

use crate::error::ConfigError;
use crate::limiter::RateLimiter;
use crate::runner::ThrottledRunner;

/// Environment variable consulted by [`RunnerConfig::default`].
pub const MAX_CONCURRENT_ENV: &str = "THROTTLED_MAX_CONCURRENT";

/// Settings for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    #[serde(rename = "min_interval_ms", deserialize_with = "millis")]
    pub min_interval: Duration,
    /// Upper bound for jittered intervals. `None` means a fixed interval.
    #[serde(
        default,
        rename = "max_interval_ms",
        deserialize_with = "optional_millis"
    )]
    pub max_interval: Option<Duration>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl RateLimitConfig {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            min_interval: interval,
            max_interval: None,
            capacity: default_capacity(),
        }
    }

    pub fn jittered(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval: Some(max_interval),
            capacity: default_capacity(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval.unwrap_or(self.min_interval)
    }

    pub fn build(&self) -> Result<RateLimiter, ConfigError> {
        RateLimiter::jittered_with_capacity(self.min_interval, self.max_interval(), self.capacity)
    }
}

/// Settings for a [`ThrottledRunner`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub max_concurrent: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: max_concurrent_or_parallelism(std::env::var(MAX_CONCURRENT_ENV).ok()),
        }
    }
}

impl RunnerConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self { max_concurrent }
    }

    pub fn build(&self) -> Result<ThrottledRunner, ConfigError> {
        ThrottledRunner::new(self.max_concurrent)
    }
}

/// Validate a requested gate size. `zero` is the error reported for 0.
pub(crate) fn gate_size(requested: usize, zero: ConfigError) -> Result<NonZeroUsize, ConfigError> {
    if requested > Semaphore::MAX_PERMITS {
        return Err(ConfigError::TooManyPermits {
            requested,
            max: Semaphore::MAX_PERMITS,
        });
    }
    NonZeroUsize::new(requested).ok_or(zero)
}

/// Parse an override for the concurrency limit, falling back to the number
/// of available CPUs when it is missing or not a number.
fn max_concurrent_or_parallelism(value: Option<String>) -> usize {
    value
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or_else(default_parallelism)
}

fn default_capacity() -> usize {
    1
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn optional_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_config_defaults_to_fixed_interval() {
        let config: RateLimitConfig =
            serde_json::from_str(r#"{"min_interval_ms": 100}"#).unwrap();
        assert_eq!(config, RateLimitConfig::fixed(Duration::from_millis(100)));
        assert_eq!(config.max_interval(), Duration::from_millis(100));
        assert_eq!(config.capacity, 1);
    }

    #[test]
    fn rate_limit_config_parses_jitter_and_capacity() {
        let config: RateLimitConfig = serde_json::from_str(
            r#"{"min_interval_ms": 100, "max_interval_ms": 250, "capacity": 3}"#,
        )
        .unwrap();
        insta::assert_debug_snapshot!(config, @r"
        RateLimitConfig {
            min_interval: 100ms,
            max_interval: Some(
                250ms,
            ),
            capacity: 3,
        }
        ");
    }

    #[test]
    fn rate_limit_config_requires_min_interval() {
        let result = serde_json::from_str::<RateLimitConfig>(r#"{"capacity": 2}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rate_limit_config_build_validates() {
        let err = RateLimitConfig::fixed(Duration::ZERO).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroInterval);

        let err = RateLimitConfig::fixed(Duration::from_millis(10))
            .with_capacity(0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroCapacity);

        let limiter = RateLimitConfig::jittered(Duration::from_millis(10), Duration::from_millis(20))
            .with_capacity(4)
            .build()
            .unwrap();
        assert_eq!(limiter.capacity(), 4);
        assert_eq!(limiter.max_interval(), Duration::from_millis(20));
    }

    #[test]
    fn runner_config_parses_max_concurrent() {
        let config: RunnerConfig = serde_json::from_str(r#"{"max_concurrent": 8}"#).unwrap();
        assert_eq!(config, RunnerConfig::new(8));
        assert_eq!(config.build().unwrap().max_concurrent(), 8);
    }

    #[test]
    fn runner_config_rejects_zero() {
        let err = RunnerConfig::new(0).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroConcurrency);
    }

    #[test]
    fn runner_config_default_falls_back_to_parallelism() {
        let cpus = default_parallelism();
        assert!(cpus >= 1);
        assert_eq!(max_concurrent_or_parallelism(None), cpus);
        assert_eq!(max_concurrent_or_parallelism(Some("lots".to_string())), cpus);
        assert_eq!(max_concurrent_or_parallelism(Some(String::new())), cpus);
    }

    #[test]
    fn runner_config_default_honours_override() {
        assert_eq!(max_concurrent_or_parallelism(Some("12".to_string())), 12);
        assert_eq!(max_concurrent_or_parallelism(Some(" 3\n".to_string())), 3);
    }

    #[test]
    fn runner_config_default_is_usable() {
        // Only meaningful when the override is not set in the test environment.
        if std::env::var(MAX_CONCURRENT_ENV).is_err() {
            let config = RunnerConfig::default();
            assert_eq!(config.max_concurrent, default_parallelism());
            assert!(config.build().is_ok());
        }
    }

    #[test]
    fn gate_size_bounds() {
        assert_eq!(gate_size(3, ConfigError::ZeroCapacity).unwrap().get(), 3);
        assert_eq!(
            gate_size(0, ConfigError::ZeroCapacity).unwrap_err(),
            ConfigError::ZeroCapacity
        );
        assert!(matches!(
            gate_size(usize::MAX, ConfigError::ZeroConcurrency),
            Err(ConfigError::TooManyPermits { .. })
        ));
    }
}
