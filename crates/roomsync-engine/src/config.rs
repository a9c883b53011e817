//! Environment-backed tuning for a replication session.

use std::env;

use roomsync_core::RetryPolicy;
use thiserror::Error;

const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_MARGIN_MS: u64 = 10_000;
const DEFAULT_FILTER_TIMELINE_LIMIT: u16 = 20;
const DEFAULT_OPEN_TIMELINE_AMOUNT: usize = 30;
const DEFAULT_PAGINATION_LIMIT_CAP: u16 = 100;
const DEFAULT_MEMBER_CACHE_CAPACITY: usize = 30;
const DEFAULT_CATCHUP_TO_DEVICE_THRESHOLD: usize = 100;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RATE_LIMIT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_EVENT_BUFFER: usize = 512;

/// Runtime configuration of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Long-poll timeout while live syncing.
    pub sync_timeout_ms: u64,
    /// Added to the long-poll timeout to bound the whole request.
    pub request_timeout_margin_ms: u64,
    /// Timeline limit of the server-side sync filter.
    pub filter_timeline_limit: u16,
    /// Entries read when a timeline opens.
    pub open_timeline_amount: usize,
    /// Largest page requested while filling a gap.
    pub pagination_limit_cap: u16,
    /// Members kept per room in the sender LRU.
    pub member_cache_capacity: usize,
    /// To-device backlog that drops live sync back to catch-up.
    pub catchup_to_device_threshold: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Rate-limited attempts before a request gives up.
    pub rate_limit_max_attempts: u32,
    /// Capacity of the session event broadcast channel.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            request_timeout_margin_ms: DEFAULT_REQUEST_TIMEOUT_MARGIN_MS,
            filter_timeline_limit: DEFAULT_FILTER_TIMELINE_LIMIT,
            open_timeline_amount: DEFAULT_OPEN_TIMELINE_AMOUNT,
            pagination_limit_cap: DEFAULT_PAGINATION_LIMIT_CAP,
            member_cache_capacity: DEFAULT_MEMBER_CACHE_CAPACITY,
            catchup_to_device_threshold: DEFAULT_CATCHUP_TO_DEVICE_THRESHOLD,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            rate_limit_max_attempts: DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from `ROOMSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let config = Self {
            sync_timeout_ms: parse_or(
                "ROOMSYNC_SYNC_TIMEOUT_MS",
                DEFAULT_SYNC_TIMEOUT_MS,
                &mut lookup,
            )?,
            request_timeout_margin_ms: parse_or(
                "ROOMSYNC_REQUEST_TIMEOUT_MARGIN_MS",
                DEFAULT_REQUEST_TIMEOUT_MARGIN_MS,
                &mut lookup,
            )?,
            filter_timeline_limit: parse_or(
                "ROOMSYNC_FILTER_TIMELINE_LIMIT",
                DEFAULT_FILTER_TIMELINE_LIMIT,
                &mut lookup,
            )?,
            open_timeline_amount: parse_or(
                "ROOMSYNC_OPEN_TIMELINE_AMOUNT",
                DEFAULT_OPEN_TIMELINE_AMOUNT,
                &mut lookup,
            )?,
            pagination_limit_cap: parse_or(
                "ROOMSYNC_PAGINATION_LIMIT_CAP",
                DEFAULT_PAGINATION_LIMIT_CAP,
                &mut lookup,
            )?,
            member_cache_capacity: parse_or(
                "ROOMSYNC_MEMBER_CACHE_CAPACITY",
                DEFAULT_MEMBER_CACHE_CAPACITY,
                &mut lookup,
            )?,
            catchup_to_device_threshold: parse_or(
                "ROOMSYNC_CATCHUP_TO_DEVICE_THRESHOLD",
                DEFAULT_CATCHUP_TO_DEVICE_THRESHOLD,
                &mut lookup,
            )?,
            retry_base_delay_ms: parse_or(
                "ROOMSYNC_RETRY_BASE_DELAY_MS",
                DEFAULT_RETRY_BASE_DELAY_MS,
                &mut lookup,
            )?,
            retry_max_delay_ms: parse_or(
                "ROOMSYNC_RETRY_MAX_DELAY_MS",
                DEFAULT_RETRY_MAX_DELAY_MS,
                &mut lookup,
            )?,
            rate_limit_max_attempts: parse_or(
                "ROOMSYNC_RATE_LIMIT_MAX_ATTEMPTS",
                DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
                &mut lookup,
            )?,
            event_buffer: parse_or("ROOMSYNC_EVENT_BUFFER", DEFAULT_EVENT_BUFFER, &mut lookup)?,
        };

        require_at_least_one("ROOMSYNC_FILTER_TIMELINE_LIMIT", config.filter_timeline_limit.into())?;
        require_at_least_one("ROOMSYNC_OPEN_TIMELINE_AMOUNT", config.open_timeline_amount as u64)?;
        require_at_least_one("ROOMSYNC_PAGINATION_LIMIT_CAP", config.pagination_limit_cap.into())?;
        require_at_least_one("ROOMSYNC_MEMBER_CACHE_CAPACITY", config.member_cache_capacity as u64)?;
        require_at_least_one("ROOMSYNC_EVENT_BUFFER", config.event_buffer as u64)?;
        if config.retry_max_delay_ms < config.retry_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "ROOMSYNC_RETRY_MAX_DELAY_MS",
                value: config.retry_max_delay_ms.to_string(),
                reason: format!(
                    "must not be below ROOMSYNC_RETRY_BASE_DELAY_MS ({})",
                    config.retry_base_delay_ms
                ),
            });
        }

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
            self.rate_limit_max_attempts,
        )
    }

    /// Upper bound of one sync request including the long-poll timeout.
    pub fn request_timeout_ms(&self, long_poll_timeout_ms: u64) -> u64 {
        long_poll_timeout_ms.saturating_add(self.request_timeout_margin_ms)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed or is out of range.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
    else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        reason: err.to_string(),
        value,
    })
}

fn require_at_least_one(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}
