/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::fleetsync::logger::LogFormat;
use std::env;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Environment-backed configuration keys understood by the syncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    Workers,
    QueueCapacity,
    NotReadyRequeue,
    PodDeletionRequeue,
    ForceDeleteDelay,
    ErrorBackoffMax,
    LogFormat,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Workers => "FLEETSYNC_WORKERS",
            Config::QueueCapacity => "FLEETSYNC_QUEUE_CAPACITY",
            Config::NotReadyRequeue => "FLEETSYNC_NOT_READY_REQUEUE",
            Config::PodDeletionRequeue => "FLEETSYNC_POD_DELETION_REQUEUE",
            Config::ForceDeleteDelay => "FLEETSYNC_FORCE_DELETE_DELAY",
            Config::ErrorBackoffMax => "FLEETSYNC_ERROR_BACKOFF_MAX",
            Config::LogFormat => "FLEETSYNC_LOG_FORMAT",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Config::Workers => "8",
            Config::QueueCapacity => "1024",
            Config::NotReadyRequeue => "1s",
            Config::PodDeletionRequeue => "3s",
            Config::ForceDeleteDelay => "20s",
            Config::ErrorBackoffMax => "10s",
            Config::LogFormat => "text",
        }
    }

    /// Returns the environment value, falling back to the default when unset or blank.
    pub fn get_value(&self) -> String {
        match env::var(self.env_var()) {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => self.default_value().to_string(),
        }
    }

    fn parse_usize(&self) -> Result<usize, ConfigError> {
        let raw = self.get_value();
        match raw.parse::<usize>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(ConfigError::invalid(*self, &raw, "expected a positive integer")),
        }
    }

    fn parse_duration(&self) -> Result<Duration, ConfigError> {
        let raw = self.get_value();
        humantime::parse_duration(&raw)
            .map_err(|err| ConfigError::invalid(*self, &raw, &err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    key: &'static str,
    value: String,
    reason: String,
}

impl ConfigError {
    fn invalid(config: Config, value: &str, reason: &str) -> Self {
        Self {
            key: config.env_var(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}='{}': {}", self.key, self.value, self.reason)
    }
}

impl Error for ConfigError {}

/// Resolved syncer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Delay used when a dependency is not ready yet (cluster, dispatch marker, pod set).
    pub not_ready_requeue: Duration,
    /// Delay used while waiting for pod deletions to propagate.
    pub pod_deletion_requeue: Duration,
    /// Age of a deletion timestamp after which a pod is force deleted.
    pub force_delete_delay: Duration,
    pub error_backoff_initial: Duration,
    pub error_backoff_max: Duration,
    pub log_format: LogFormat,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1024,
            not_ready_requeue: Duration::from_secs(1),
            pod_deletion_requeue: Duration::from_secs(3),
            force_delete_delay: Duration::from_secs(20),
            error_backoff_initial: Duration::from_millis(200),
            error_backoff_max: Duration::from_secs(10),
            log_format: LogFormat::Text,
        }
    }
}

impl SyncerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw_format = Config::LogFormat.get_value();
        let log_format = raw_format
            .parse::<LogFormat>()
            .map_err(|reason| ConfigError::invalid(Config::LogFormat, &raw_format, &reason))?;
        Ok(Self {
            workers: Config::Workers.parse_usize()?,
            queue_capacity: Config::QueueCapacity.parse_usize()?,
            not_ready_requeue: Config::NotReadyRequeue.parse_duration()?,
            pod_deletion_requeue: Config::PodDeletionRequeue.parse_duration()?,
            force_delete_delay: Config::ForceDeleteDelay.parse_duration()?,
            error_backoff_max: Config::ErrorBackoffMax.parse_duration()?,
            log_format,
            ..Self::default()
        })
    }

    /// Exponential backoff for a message that failed `attempts` times already.
    pub fn error_backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.min(16)).unwrap_or(u32::MAX);
        self.error_backoff_initial
            .saturating_mul(factor)
            .min(self.error_backoff_max)
    }
}
