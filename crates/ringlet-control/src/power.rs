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

//! Power-source and submission-throttle hints reported by producer threads.

use ringlet_core::QueueThrottle;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Lock-free mailbox between submitting threads and the controller thread.
#[derive(Debug)]
pub struct PowerState {
    ac_line_connected: AtomicBool,
    lowest_throttle: AtomicU8,
}

impl PowerState {
    /// Starts on AC power with no submissions seen.
    pub fn new() -> Self {
        Self {
            ac_line_connected: AtomicBool::new(true),
            lowest_throttle: AtomicU8::new(QueueThrottle::High.as_u8()),
        }
    }

    /// Records the throttle of a submission. Only the lowest one is kept.
    pub fn report_throttle(&self, throttle: QueueThrottle) {
        self.lowest_throttle
            .fetch_min(throttle.as_u8(), Ordering::AcqRel);
    }

    /// Records whether the machine is on AC power.
    pub fn set_ac_line_connected(&self, connected: bool) {
        self.ac_line_connected.store(connected, Ordering::Release);
    }

    /// Whether the machine is on AC power.
    pub fn ac_line_connected(&self) -> bool {
        self.ac_line_connected.load(Ordering::Acquire)
    }

    /// Returns the lowest throttle reported since the previous call and
    /// resets the mailbox to `High`.
    pub fn take_lowest_throttle(&self) -> QueueThrottle {
        QueueThrottle::from_u8(
            self.lowest_throttle
                .swap(QueueThrottle::High.as_u8(), Ordering::AcqRel),
        )
    }
}

impl Default for PowerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_throttle_wins_and_resets() {
        let power = PowerState::new();
        assert_eq!(power.take_lowest_throttle(), QueueThrottle::High);

        power.report_throttle(QueueThrottle::Medium);
        power.report_throttle(QueueThrottle::Low);
        power.report_throttle(QueueThrottle::High);
        assert_eq!(power.take_lowest_throttle(), QueueThrottle::Low);
        assert_eq!(power.take_lowest_throttle(), QueueThrottle::High);
    }

    #[test]
    fn test_ac_line_flag() {
        let power = PowerState::default();
        assert!(power.ac_line_connected());
        power.set_ac_line_connected(false);
        assert!(!power.ac_line_connected());
    }
}
