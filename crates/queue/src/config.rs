//! Configuration for the queue, dead-letter store, retry policy and processor.
//!
//! Every struct has sensible defaults; [`DeferqConfig::from_env`] overlays
//! `DEFERQ_*` environment variables on top of them.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::DelayStrategy;

/// Main queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued requests.
    pub max_size: usize,
    /// Persist a snapshot after every mutation.
    pub persist: bool,
    pub storage_key: String,
    /// Requests older than this are removed by expiry cleanup.
    pub max_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            persist: true,
            storage_key: "deferq.queue".to_string(),
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_persistence(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

/// Dead-letter store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Capacity; the oldest entry is evicted when full.
    pub max_size: usize,
    pub persist: bool,
    pub storage_key: String,
    pub max_age: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            persist: true,
            storage_key: "deferq.dead_letter".to_string(),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl DeadLetterConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_persistence(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub strategy: DelayStrategy,
    /// Upper bound on any computed delay, applied after jitter.
    pub max_delay: Duration,
    /// Apply ±10% jitter to computed delays.
    pub jitter: bool,
    pub retry_on_server_errors: bool,
    pub retry_on_client_errors: bool,
    pub retry_on_network_errors: bool,
    /// Status codes that are always retried, checked before the 4xx/5xx flags.
    pub retry_status_codes: BTreeSet<u16>,
    pub dead_letter_enabled: bool,
    /// Requests older than this are escalated instead of retried.
    pub max_request_age: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: DelayStrategy::default(),
            max_delay: Duration::from_secs(5 * 60),
            jitter: true,
            retry_on_server_errors: true,
            retry_on_client_errors: false,
            retry_on_network_errors: true,
            retry_status_codes: BTreeSet::from([408, 429]),
            dead_letter_enabled: true,
            max_request_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RetryConfig {
    pub fn with_strategy(mut self, strategy: DelayStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_client_error_retries(mut self, retry: bool) -> Self {
        self.retry_on_client_errors = retry;
        self
    }

    pub fn with_server_error_retries(mut self, retry: bool) -> Self {
        self.retry_on_server_errors = retry;
        self
    }

    pub fn with_network_error_retries(mut self, retry: bool) -> Self {
        self.retry_on_network_errors = retry;
        self
    }

    pub fn with_retry_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_status_codes = codes.into_iter().collect();
        self
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter_enabled = enabled;
        self
    }

    pub fn with_max_request_age(mut self, max_age: Duration) -> Self {
        self.max_request_age = max_age;
        self
    }
}

/// Processing driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Interval between periodic processing passes.
    pub tick_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
        }
    }
}

impl ProcessorConfig {
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeferqConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
}

/// Invalid configuration value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl DeferqConfig {
    /// Defaults overlaid with `DEFERQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse::<usize>(&lookup, "DEFERQ_MAX_QUEUE_SIZE")? {
            config.queue.max_size = v;
        }
        if let Some(v) = parse_bool(&lookup, "DEFERQ_PERSIST")? {
            config.queue.persist = v;
            config.dead_letter.persist = v;
        }
        if let Some(v) = lookup("DEFERQ_QUEUE_KEY") {
            config.queue.storage_key = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "DEFERQ_MAX_AGE_SECS")? {
            config.queue.max_age = Duration::from_secs(v);
            config.retry.max_request_age = Duration::from_secs(v);
        }
        if let Some(v) = parse_bool(&lookup, "DEFERQ_DEAD_LETTER_ENABLED")? {
            config.retry.dead_letter_enabled = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "DEFERQ_DEAD_LETTER_MAX_SIZE")? {
            config.dead_letter.max_size = v;
        }
        if let Some(v) = lookup("DEFERQ_DEAD_LETTER_KEY") {
            config.dead_letter.storage_key = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "DEFERQ_DEAD_LETTER_MAX_AGE_SECS")? {
            config.dead_letter.max_age = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "DEFERQ_MAX_DELAY_SECS")? {
            config.retry.max_delay = Duration::from_secs(v);
        }
        if let Some(v) = parse_bool(&lookup, "DEFERQ_JITTER")? {
            config.retry.jitter = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "DEFERQ_TICK_INTERVAL_SECS")? {
            if v == 0 {
                return Err(invalid("DEFERQ_TICK_INTERVAL_SECS", "0", "must be positive"));
            }
            config.processor.tick_interval = Duration::from_secs(v);
        }

        Ok(config)
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, e.to_string())),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(invalid(key, &raw, "expected a boolean")),
        },
    }
}
