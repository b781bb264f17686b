// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Controller configuration and its environment overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Enables or disables the controller entirely.
pub const ENV_ENABLE: &str = "RINGLET_CONTROLLER_ENABLE";
/// Base timeout override, in microseconds.
pub const ENV_TIMEOUT_US: &str = "RINGLET_CONTROLLER_TIMEOUT_US";
/// Maximum timeout override, in microseconds.
pub const ENV_MAX_TIMEOUT_US: &str = "RINGLET_CONTROLLER_MAX_TIMEOUT_US";
/// Copy-engine timeout divisor.
pub const ENV_BCS_TIMEOUT_DIVISOR: &str = "RINGLET_CONTROLLER_BCS_TIMEOUT_DIVISOR";
/// Compute-engine timeout divisor override.
pub const ENV_TIMEOUT_DIVISOR: &str = "RINGLET_CONTROLLER_TIMEOUT_DIVISOR";
/// Enables or disables idle probing before a stop.
pub const ENV_IDLE_DETECTION: &str = "RINGLET_CONTROLLER_IDLE_DETECTION";
/// Enables or disables the context-group sibling check.
pub const ENV_CONTEXT_GROUP_IDLE_DETECTION: &str =
    "RINGLET_CONTROLLER_CONTEXT_GROUP_IDLE_DETECTION";
/// Busy-poll window after a tag update, in nanoseconds.
pub const ENV_TAG_POLL_WINDOW_NS: &str = "RINGLET_CONTROLLER_TAG_POLL_WINDOW_NS";

/// Errors produced while reading or validating a [`ControllerConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric override did not parse.
    #[error("{key}: expected an unsigned integer, got {value:?}")]
    InvalidNumber {
        /// The offending key.
        key: &'static str,
        /// The raw value.
        value: String,
    },
    /// A boolean override did not parse.
    #[error("{key}: expected 0, 1, true or false, got {value:?}")]
    InvalidBool {
        /// The offending key.
        key: &'static str,
        /// The raw value.
        value: String,
    },
    /// A divisor was set to zero.
    #[error("{key} must be at least 1")]
    ZeroDivisor {
        /// The offending key.
        key: &'static str,
    },
    /// An explicit timeout is larger than an explicit maximum.
    #[error("timeout ({timeout_us}us) exceeds the maximum timeout ({max_timeout_us}us)")]
    TimeoutExceedsMax {
        /// Configured base timeout.
        timeout_us: u64,
        /// Configured maximum timeout.
        max_timeout_us: u64,
    },
}

/// Configuration for the direct submission controller.
///
/// `None` timeouts fall back to the platform's
/// [`TimeoutParams`](ringlet_core::TimeoutParams).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// When false, no controller is created at all.
    pub enabled: bool,
    /// Base timeout in microseconds.
    pub timeout_us: Option<u64>,
    /// Cap for adaptive timeout growth in microseconds.
    pub max_timeout_us: Option<u64>,
    /// Copy engines are checked every `timeout / bcs_timeout_divisor`.
    /// A value of 1 disables the copy-only fast path.
    pub bcs_timeout_divisor: u32,
    /// Scales the timeout with the number of compute engines per device.
    pub timeout_divisor: Option<u32>,
    /// Check engines for outstanding work before stopping them.
    pub idle_detection: bool,
    /// Require every context-group sibling to be idle before stopping.
    pub context_group_idle_detection: bool,
    /// How long to busy-poll after a tag update, in nanoseconds.
    pub tag_poll_window_ns: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_us: None,
            max_timeout_us: None,
            bcs_timeout_divisor: 1,
            timeout_divisor: None,
            idle_detection: true,
            context_group_idle_detection: true,
            tag_poll_window_ns: 20_000,
        }
    }
}

impl ControllerConfig {
    /// Defaults with overrides read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides read through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_overrides(lookup)?;
        Ok(config)
    }

    /// Applies every override `lookup` knows about, then validates.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_ENABLE) {
            self.enabled = parse_bool(ENV_ENABLE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_US) {
            self.timeout_us = Some(parse_u64(ENV_TIMEOUT_US, &raw)?);
        }
        if let Some(raw) = lookup(ENV_MAX_TIMEOUT_US) {
            self.max_timeout_us = Some(parse_u64(ENV_MAX_TIMEOUT_US, &raw)?);
        }
        if let Some(raw) = lookup(ENV_BCS_TIMEOUT_DIVISOR) {
            self.bcs_timeout_divisor = parse_u32(ENV_BCS_TIMEOUT_DIVISOR, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_DIVISOR) {
            self.timeout_divisor = Some(parse_u32(ENV_TIMEOUT_DIVISOR, &raw)?);
        }
        if let Some(raw) = lookup(ENV_IDLE_DETECTION) {
            self.idle_detection = parse_bool(ENV_IDLE_DETECTION, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CONTEXT_GROUP_IDLE_DETECTION) {
            self.context_group_idle_detection =
                parse_bool(ENV_CONTEXT_GROUP_IDLE_DETECTION, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TAG_POLL_WINDOW_NS) {
            self.tag_poll_window_ns = parse_u64(ENV_TAG_POLL_WINDOW_NS, &raw)?;
        }
        self.validate()
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bcs_timeout_divisor == 0 {
            return Err(ConfigError::ZeroDivisor {
                key: ENV_BCS_TIMEOUT_DIVISOR,
            });
        }
        if self.timeout_divisor == Some(0) {
            return Err(ConfigError::ZeroDivisor {
                key: ENV_TIMEOUT_DIVISOR,
            });
        }
        if let (Some(timeout_us), Some(max_timeout_us)) = (self.timeout_us, self.max_timeout_us) {
            if timeout_us > max_timeout_us {
                return Err(ConfigError::TimeoutExceedsMax {
                    timeout_us,
                    max_timeout_us,
                });
            }
        }
        Ok(())
    }

    /// True when any timeout parameter is pinned by configuration, which
    /// disables the platform's power-state table.
    pub fn overrides_timeouts(&self) -> bool {
        self.timeout_us.is_some() || self.max_timeout_us.is_some() || self.timeout_divisor.is_some()
    }

    /// The busy-poll window after a tag update.
    pub fn tag_poll_window(&self) -> Duration {
        Duration::from_nanos(self.tag_poll_window_ns)
    }
}

fn parse_u64(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            key,
            value: raw.to_string(),
        })
}

fn parse_u32(key: &'static str, raw: &str) -> Result<u32, ConfigError> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidNumber {
            key,
            value: raw.to_string(),
        })
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key,
            value: raw.to_string(),
        }),
    }
}
