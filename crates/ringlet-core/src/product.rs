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

//! Platform capabilities and per-platform controller timeout parameters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Built-in controller timeout used when the platform does not say otherwise.
pub const DEFAULT_CONTROLLER_TIMEOUT: Duration = Duration::from_micros(5_000);

/// Priority hint attached to a queue submission.
///
/// Ordered from least to most urgent, so `min` yields the lowest throttle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum QueueThrottle {
    /// Background work; power saving preferred.
    Low,
    /// Regular submissions.
    #[default]
    Medium,
    /// Latency sensitive work.
    High,
}

impl QueueThrottle {
    /// Every throttle level, lowest first.
    pub const ALL: [QueueThrottle; 3] = [QueueThrottle::Low, QueueThrottle::Medium, QueueThrottle::High];

    /// Compact encoding for atomics.
    pub fn as_u8(self) -> u8 {
        match self {
            QueueThrottle::Low => 0,
            QueueThrottle::Medium => 1,
            QueueThrottle::High => 2,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8). Out-of-range values saturate to `High`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => QueueThrottle::Low,
            1 => QueueThrottle::Medium,
            _ => QueueThrottle::High,
        }
    }
}

/// Controller timing for one (AC-line, throttle) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutParams {
    /// Base polling timeout.
    pub timeout: Duration,
    /// Upper bound for adaptive timeout growth.
    pub max_timeout: Duration,
    /// Scales the timeout against the number of compute engines per device.
    pub timeout_divisor: u32,
}

impl Default for TimeoutParams {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONTROLLER_TIMEOUT,
            max_timeout: DEFAULT_CONTROLLER_TIMEOUT,
            timeout_divisor: 1,
        }
    }
}

/// Per-platform knobs the controller consults.
pub trait ProductHelper: Send + Sync {
    /// Whether a non-copy engine must wait for the copy engine on its device
    /// to be quiescent before direct submission may stop.
    fn check_bcs_for_direct_submission_stop(&self) -> bool {
        false
    }

    /// Timeout parameters for the given power source and submission throttle.
    fn direct_submission_controller_timeout_params(
        &self,
        _ac_line_connected: bool,
        _throttle: QueueThrottle,
    ) -> TimeoutParams {
        TimeoutParams::default()
    }
}

/// Product helper with the built-in defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProductHelper;

impl ProductHelper for DefaultProductHelper {}
