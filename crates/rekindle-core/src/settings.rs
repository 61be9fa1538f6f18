// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime settings and their environment-variable loader.

use std::time::Duration;

/// Tuning knobs for the heartbeat and watchdog loops.
///
/// A zero frequency disables the corresponding loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// How often the crashed watchdog scans Executing functions.
    pub crashed_check_frequency: Duration,
    /// Number of unchanged crashed checks after which a function is restarted.
    pub crashed_tolerance_factor: u32,
    /// How often the postponed watchdog looks for due functions.
    pub postponed_check_frequency: Duration,
    /// How often the suspended watchdog looks for resumable functions.
    pub suspended_check_frequency: Duration,
    /// How often this replica heartbeats and checks its peers.
    pub replica_check_frequency: Duration,
    /// Consecutive unchanged peer heartbeats after which the peer is struck out.
    pub replica_strike_threshold: u32,
    /// Interval between sign-of-life updates of a running execution.
    pub sign_of_life_frequency: Duration,
    /// Delay before the watchdogs run their first check.
    pub delay_startup: Duration,
    /// Upper bound on concurrently running watchdog re-invocations.
    pub max_parallel_retry_invocations: usize,
    /// How often the retention watchdog runs.
    pub retention_check_frequency: Duration,
    /// Age after which terminal functions are deleted. `None` keeps them forever.
    pub retention_period: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            crashed_check_frequency: Duration::from_secs(10),
            crashed_tolerance_factor: 2,
            postponed_check_frequency: Duration::from_secs(10),
            suspended_check_frequency: Duration::from_secs(10),
            replica_check_frequency: Duration::from_secs(5),
            replica_strike_threshold: 3,
            sign_of_life_frequency: Duration::from_secs(5),
            delay_startup: Duration::ZERO,
            max_parallel_retry_invocations: 10,
            retention_check_frequency: Duration::from_secs(3600),
            retention_period: None,
        }
    }
}

impl Settings {
    /// Load settings from environment variables, falling back to the defaults.
    ///
    /// Optional (durations in milliseconds):
    /// - `REKINDLE_CRASHED_CHECK_FREQUENCY_MS` (default: 10000)
    /// - `REKINDLE_CRASHED_TOLERANCE_FACTOR` (default: 2)
    /// - `REKINDLE_POSTPONED_CHECK_FREQUENCY_MS` (default: 10000)
    /// - `REKINDLE_SUSPENDED_CHECK_FREQUENCY_MS` (default: 10000)
    /// - `REKINDLE_REPLICA_CHECK_FREQUENCY_MS` (default: 5000)
    /// - `REKINDLE_REPLICA_STRIKE_THRESHOLD` (default: 3)
    /// - `REKINDLE_SIGN_OF_LIFE_FREQUENCY_MS` (default: 5000)
    /// - `REKINDLE_DELAY_STARTUP_MS` (default: 0)
    /// - `REKINDLE_MAX_PARALLEL_RETRY_INVOCATIONS` (default: 10)
    /// - `REKINDLE_RETENTION_CHECK_FREQUENCY_MS` (default: 3600000)
    /// - `REKINDLE_RETENTION_PERIOD_MS` (default: unset, keep forever)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_parallel_retry_invocations = env_parse(
            "REKINDLE_MAX_PARALLEL_RETRY_INVOCATIONS",
            defaults.max_parallel_retry_invocations,
            "must be a positive integer",
        )?;
        if max_parallel_retry_invocations == 0 {
            return Err(ConfigError::Invalid(
                "REKINDLE_MAX_PARALLEL_RETRY_INVOCATIONS",
                "must be a positive integer",
            ));
        }

        let retention_period = match std::env::var("REKINDLE_RETENTION_PERIOD_MS") {
            Ok(value) => Some(Duration::from_millis(value.parse().map_err(|_| {
                ConfigError::Invalid(
                    "REKINDLE_RETENTION_PERIOD_MS",
                    "must be a duration in milliseconds",
                )
            })?)),
            Err(_) => defaults.retention_period,
        };

        Ok(Self {
            crashed_check_frequency: env_millis(
                "REKINDLE_CRASHED_CHECK_FREQUENCY_MS",
                defaults.crashed_check_frequency,
            )?,
            crashed_tolerance_factor: env_parse(
                "REKINDLE_CRASHED_TOLERANCE_FACTOR",
                defaults.crashed_tolerance_factor,
                "must be a non-negative integer",
            )?,
            postponed_check_frequency: env_millis(
                "REKINDLE_POSTPONED_CHECK_FREQUENCY_MS",
                defaults.postponed_check_frequency,
            )?,
            suspended_check_frequency: env_millis(
                "REKINDLE_SUSPENDED_CHECK_FREQUENCY_MS",
                defaults.suspended_check_frequency,
            )?,
            replica_check_frequency: env_millis(
                "REKINDLE_REPLICA_CHECK_FREQUENCY_MS",
                defaults.replica_check_frequency,
            )?,
            replica_strike_threshold: env_parse(
                "REKINDLE_REPLICA_STRIKE_THRESHOLD",
                defaults.replica_strike_threshold,
                "must be a non-negative integer",
            )?,
            sign_of_life_frequency: env_millis(
                "REKINDLE_SIGN_OF_LIFE_FREQUENCY_MS",
                defaults.sign_of_life_frequency,
            )?,
            delay_startup: env_millis("REKINDLE_DELAY_STARTUP_MS", defaults.delay_startup)?,
            max_parallel_retry_invocations,
            retention_check_frequency: env_millis(
                "REKINDLE_RETENTION_CHECK_FREQUENCY_MS",
                defaults.retention_check_frequency,
            )?,
            retention_period,
        })
    }
}

fn env_parse<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid(key, "must be a duration in milliseconds")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
