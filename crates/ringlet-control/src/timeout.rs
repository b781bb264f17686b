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

//! Adaptive timeout policy.
//!
//! The policy decides how often engines are swept and grows the interval
//! when stop events become rare:
//!
//! - `elapsed < timeout / bcs_timeout_divisor` → [`TimeoutElapsedMode::NotElapsed`]
//! - `elapsed < timeout` → [`TimeoutElapsedMode::BcsOnly`] (copy engines only)
//! - otherwise → [`TimeoutElapsedMode::FullyElapsed`]
//!
//! All state here is owned by the controller thread.

use crate::config::ControllerConfig;
use ringlet_core::{ProductHelper, QueueThrottle, TimeoutParams};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Floor for every computed timeout.
const MIN_TIMEOUT: Duration = Duration::from_micros(1);

/// What a wake-up is allowed to sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutElapsedMode {
    /// Too early for any sweep.
    NotElapsed,
    /// Only copy engines are due.
    BcsOnly,
    /// Every engine is due.
    FullyElapsed,
}

/// Platform timeout parameters for every (AC-line, throttle) pair.
#[derive(Debug, Clone)]
pub struct TimeoutParamsTable {
    entries: HashMap<(bool, QueueThrottle), TimeoutParams>,
}

impl TimeoutParamsTable {
    /// Queries the product helper once for every combination.
    pub fn from_product_helper(helper: &dyn ProductHelper) -> Self {
        let mut entries = HashMap::new();
        for ac_line_connected in [true, false] {
            for throttle in QueueThrottle::ALL {
                entries.insert(
                    (ac_line_connected, throttle),
                    helper.direct_submission_controller_timeout_params(ac_line_connected, throttle),
                );
            }
        }
        Self { entries }
    }

    /// Parameters for the given power state.
    pub fn get(&self, ac_line_connected: bool, throttle: QueueThrottle) -> TimeoutParams {
        self.entries
            .get(&(ac_line_connected, throttle))
            .copied()
            .unwrap_or_default()
    }
}

/// The controller's timing state.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    timeout: Duration,
    max_timeout: Duration,
    base_timeout: Duration,
    timeout_divisor: u32,
    bcs_timeout_divisor: u32,
    pinned: bool,
    table: TimeoutParamsTable,
    applied_power_state: (bool, QueueThrottle),
    compute_engines: u32,
    last_full_check: Instant,
    last_hang_check: Instant,
    last_terminate: Instant,
}

impl TimeoutPolicy {
    /// Builds the policy from platform parameters and config overrides.
    ///
    /// The initial platform entry is the one for AC power with no submission
    /// seen yet (`QueueThrottle::High`).
    pub fn new(config: &ControllerConfig, helper: &dyn ProductHelper, now: Instant) -> Self {
        let table = TimeoutParamsTable::from_product_helper(helper);
        let applied_power_state = (true, QueueThrottle::High);
        let platform = table.get(applied_power_state.0, applied_power_state.1);

        let timeout_override = config.timeout_us.map(Duration::from_micros);
        let max_timeout = match (config.max_timeout_us, timeout_override) {
            (Some(max_us), _) => Duration::from_micros(max_us),
            (None, Some(timeout)) => platform.max_timeout.max(timeout),
            (None, None) => platform.max_timeout,
        }
        .max(MIN_TIMEOUT);
        let base_timeout = timeout_override.unwrap_or(platform.timeout).min(max_timeout);

        let mut policy = Self {
            timeout: base_timeout,
            max_timeout,
            base_timeout,
            timeout_divisor: config
                .timeout_divisor
                .unwrap_or(platform.timeout_divisor)
                .max(1),
            bcs_timeout_divisor: config.bcs_timeout_divisor.max(1),
            pinned: config.overrides_timeouts(),
            table,
            applied_power_state,
            compute_engines: 0,
            last_full_check: now,
            last_hang_check: now,
            last_terminate: now,
        };
        policy.timeout = policy.effective_timeout();
        policy
    }

    /// Current sweep timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Upper bound for [`timeout`](Self::timeout).
    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// Divisor for the copy-engine cadence.
    pub fn bcs_timeout_divisor(&self) -> u32 {
        self.bcs_timeout_divisor
    }

    /// When the last full sweep finished.
    pub fn last_full_check(&self) -> Instant {
        self.last_full_check
    }

    /// Reference timestamp handed to `is_busy_without_hang`.
    pub fn last_hang_check(&self) -> Instant {
        self.last_hang_check
    }

    /// When the last timeout recalculation happened.
    pub fn last_terminate(&self) -> Instant {
        self.last_terminate
    }

    /// How long the control thread may sleep between wake-ups.
    pub fn sleep_interval(&self) -> Duration {
        (self.timeout / self.bcs_timeout_divisor).max(MIN_TIMEOUT)
    }

    /// Forgets time spent before controlling started.
    pub fn reset_timestamps(&mut self, now: Instant) {
        self.last_full_check = now;
        self.last_hang_check = now;
    }

    /// Classifies a wake-up at `now`.
    pub fn elapsed_mode(&self, now: Instant) -> TimeoutElapsedMode {
        let elapsed = now.saturating_duration_since(self.last_full_check);
        if elapsed >= self.timeout {
            TimeoutElapsedMode::FullyElapsed
        } else if self.bcs_timeout_divisor > 1
            && elapsed >= self.timeout / self.bcs_timeout_divisor
        {
            TimeoutElapsedMode::BcsOnly
        } else {
            TimeoutElapsedMode::NotElapsed
        }
    }

    /// Records the end of a full sweep.
    pub fn mark_full_check(&mut self, now: Instant) {
        self.last_full_check = now;
        self.last_hang_check = now;
    }

    /// Called after a sweep that stopped at least one engine.
    ///
    /// If the previous stop happened more than one timeout ago (but within
    /// the maximum), the timeout grows by half, capped at the maximum.
    /// Growth is `timeout × 1.5` rather than `delta × 1.5`, so one stop never
    /// grows the timeout by more than half.
    pub fn recalculate_timeout(&mut self, now: Instant) {
        let since_last_terminate = now.saturating_duration_since(self.last_terminate);
        if since_last_terminate > self.timeout && since_last_terminate <= self.max_timeout {
            let grown = (self.timeout * 3 / 2).min(self.max_timeout);
            log::debug!(
                "Direct submission controller: timeout {:?} -> {:?}",
                self.timeout,
                grown
            );
            self.timeout = grown;
        }
        self.last_terminate = now;
    }

    /// Tightens the timeout when a device gains more compute engines than
    /// previously seen.
    pub fn adjust_for_compute_engines(&mut self, compute_engines: u32) {
        if compute_engines <= self.compute_engines {
            return;
        }
        self.compute_engines = compute_engines;
        let adjusted = self.effective_timeout();
        if adjusted != self.timeout {
            log::debug!(
                "Direct submission controller: {} compute engines per device, timeout {:?} -> {:?}",
                compute_engines,
                self.timeout,
                adjusted
            );
            self.timeout = adjusted;
        }
    }

    /// Switches to the platform parameters for a new power state.
    ///
    /// Returns false when timeouts are pinned by configuration or the state
    /// did not change.
    pub fn apply_power_state(&mut self, ac_line_connected: bool, throttle: QueueThrottle) -> bool {
        if self.pinned || self.applied_power_state == (ac_line_connected, throttle) {
            return false;
        }
        let params = self.table.get(ac_line_connected, throttle);
        self.applied_power_state = (ac_line_connected, throttle);
        self.max_timeout = params.max_timeout.max(MIN_TIMEOUT);
        self.base_timeout = params.timeout.min(self.max_timeout);
        self.timeout_divisor = params.timeout_divisor.max(1);
        self.timeout = self.effective_timeout();
        log::debug!(
            "Direct submission controller: power state (ac_line={}, throttle={:?}) timeout={:?} max={:?}",
            ac_line_connected,
            throttle,
            self.timeout,
            self.max_timeout
        );
        true
    }

    fn effective_timeout(&self) -> Duration {
        let mut timeout = self.base_timeout;
        if self.compute_engines > 1 {
            timeout = timeout * self.timeout_divisor / self.compute_engines;
        }
        timeout.min(self.max_timeout).max(MIN_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringlet_core::DefaultProductHelper;

    fn config_with(timeout_us: u64, max_timeout_us: u64, bcs_divisor: u32) -> ControllerConfig {
        ControllerConfig {
            timeout_us: Some(timeout_us),
            max_timeout_us: Some(max_timeout_us),
            bcs_timeout_divisor: bcs_divisor,
            ..Default::default()
        }
    }

    struct BatteryAwareHelper;

    impl ProductHelper for BatteryAwareHelper {
        fn direct_submission_controller_timeout_params(
            &self,
            ac_line_connected: bool,
            throttle: QueueThrottle,
        ) -> TimeoutParams {
            let base_us = match (ac_line_connected, throttle) {
                (true, QueueThrottle::High) => 1_000,
                (true, _) => 2_000,
                (false, QueueThrottle::Low) => 8_000,
                (false, _) => 4_000,
            };
            TimeoutParams {
                timeout: Duration::from_micros(base_us),
                max_timeout: Duration::from_micros(base_us * 4),
                timeout_divisor: 1,
            }
        }
    }

    #[test]
    fn test_platform_defaults() {
        let policy =
            TimeoutPolicy::new(&ControllerConfig::default(), &DefaultProductHelper, Instant::now());
        assert_eq!(policy.timeout(), Duration::from_micros(5_000));
        assert_eq!(policy.max_timeout(), Duration::from_micros(5_000));
        assert_eq!(policy.bcs_timeout_divisor(), 1);
        assert_eq!(policy.sleep_interval(), policy.timeout());
    }

    #[test]
    fn test_timeout_override_raises_platform_max() {
        let config = ControllerConfig {
            timeout_us: Some(20_000),
            ..Default::default()
        };
        let policy = TimeoutPolicy::new(&config, &DefaultProductHelper, Instant::now());
        assert_eq!(policy.timeout(), Duration::from_millis(20));
        assert!(policy.timeout() <= policy.max_timeout());
    }

    #[test]
    fn test_elapsed_modes_with_bcs_divisor() {
        let start = Instant::now();
        let policy = TimeoutPolicy::new(&config_with(100_000, 100_000, 4), &DefaultProductHelper, start);
        assert_eq!(policy.sleep_interval(), Duration::from_millis(25));

        assert_eq!(
            policy.elapsed_mode(start + Duration::from_millis(10)),
            TimeoutElapsedMode::NotElapsed
        );
        assert_eq!(
            policy.elapsed_mode(start + Duration::from_millis(25)),
            TimeoutElapsedMode::BcsOnly
        );
        assert_eq!(
            policy.elapsed_mode(start + Duration::from_millis(99)),
            TimeoutElapsedMode::BcsOnly
        );
        assert_eq!(
            policy.elapsed_mode(start + Duration::from_millis(100)),
            TimeoutElapsedMode::FullyElapsed
        );
    }

    #[test]
    fn test_divisor_of_one_disables_bcs_only() {
        let start = Instant::now();
        let policy = TimeoutPolicy::new(&config_with(100_000, 100_000, 1), &DefaultProductHelper, start);
        for ms in [1, 30, 60, 99] {
            assert_eq!(
                policy.elapsed_mode(start + Duration::from_millis(ms)),
                TimeoutElapsedMode::NotElapsed
            );
        }
        assert_eq!(
            policy.elapsed_mode(start + Duration::from_millis(100)),
            TimeoutElapsedMode::FullyElapsed
        );
    }

    #[test]
    fn test_full_check_resets_the_window() {
        let start = Instant::now();
        let mut policy = TimeoutPolicy::new(&config_with(1_000, 1_000, 1), &DefaultProductHelper, start);
        let later = start + Duration::from_millis(5);
        assert_eq!(policy.elapsed_mode(later), TimeoutElapsedMode::FullyElapsed);

        policy.mark_full_check(later);
        assert_eq!(policy.last_full_check(), later);
        assert_eq!(policy.last_hang_check(), later);
        assert_eq!(policy.elapsed_mode(later), TimeoutElapsedMode::NotElapsed);
    }

    #[test]
    fn test_recalculate_grows_by_half_up_to_max() {
        let start = Instant::now();
        let mut policy = TimeoutPolicy::new(&config_with(1_000, 10_000, 1), &DefaultProductHelper, start);

        // Stop 2ms after the previous one: sparse enough to grow.
        let mut now = start + Duration::from_millis(2);
        policy.recalculate_timeout(now);
        assert_eq!(policy.timeout(), Duration::from_micros(1_500));
        assert_eq!(policy.last_terminate(), now);

        // Stops closer together than the timeout keep it unchanged.
        now += Duration::from_micros(500);
        policy.recalculate_timeout(now);
        assert_eq!(policy.timeout(), Duration::from_micros(1_500));

        // Gaps beyond the maximum do not count as churn.
        now += Duration::from_millis(50);
        policy.recalculate_timeout(now);
        assert_eq!(policy.timeout(), Duration::from_micros(1_500));

        for _ in 0..10 {
            now += Duration::from_millis(9);
            policy.recalculate_timeout(now);
        }
        assert_eq!(policy.timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_timeout_bounded_for_any_stop_sequence() {
        let start = Instant::now();
        let mut policy = TimeoutPolicy::new(&config_with(700, 9_000, 2), &DefaultProductHelper, start);
        let mut now = start;
        for step in 0..200u64 {
            let before = policy.timeout();
            now += Duration::from_micros((step * 7_919) % 12_000);
            policy.recalculate_timeout(now);
            let after = policy.timeout();
            assert!(after <= policy.max_timeout());
            assert!(after <= before * 3 / 2);
            assert!(after >= before);
        }
    }

    #[test]
    fn test_growth_follows_the_timeout_not_the_gap() {
        let start = Instant::now();
        let mut policy = TimeoutPolicy::new(&config_with(1_000, 10_000, 1), &DefaultProductHelper, start);
        policy.recalculate_timeout(start + Duration::from_micros(3_000));
        assert_eq!(
            policy.timeout(),
            Duration::from_micros(1_500),
            "A long gap must not grow the timeout past 1.5x"
        );
    }

    #[test]
    fn test_compute_engines_tighten_the_timeout() {
        let config = ControllerConfig {
            timeout_us: Some(8_000),
            timeout_divisor: Some(2),
            ..Default::default()
        };
        let mut policy = TimeoutPolicy::new(&config, &DefaultProductHelper, Instant::now());
        policy.adjust_for_compute_engines(1);
        assert_eq!(policy.timeout(), Duration::from_millis(8));

        policy.adjust_for_compute_engines(4);
        assert_eq!(policy.timeout(), Duration::from_millis(4));

        // Counts never shrink the divisor back.
        policy.adjust_for_compute_engines(2);
        assert_eq!(policy.timeout(), Duration::from_millis(4));
    }

    #[test]
    fn test_power_state_selects_platform_entry() {
        let mut policy =
            TimeoutPolicy::new(&ControllerConfig::default(), &BatteryAwareHelper, Instant::now());
        assert_eq!(policy.timeout(), Duration::from_millis(1));

        assert!(!policy.apply_power_state(true, QueueThrottle::High));
        assert!(policy.apply_power_state(false, QueueThrottle::Low));
        assert_eq!(policy.timeout(), Duration::from_millis(8));
        assert_eq!(policy.max_timeout(), Duration::from_millis(32));

        assert!(policy.apply_power_state(true, QueueThrottle::Medium));
        assert_eq!(policy.timeout(), Duration::from_millis(2));
    }

    #[test]
    fn test_pinned_timeouts_ignore_power_state() {
        let mut policy =
            TimeoutPolicy::new(&config_with(3_000, 6_000, 1), &BatteryAwareHelper, Instant::now());
        assert!(!policy.apply_power_state(false, QueueThrottle::Low));
        assert_eq!(policy.timeout(), Duration::from_millis(3));
        assert_eq!(policy.max_timeout(), Duration::from_millis(6));
    }
}
