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

//! One sweep over the monitored engines.
//!
//! The monitor compares every engine's task count against the one seen in
//! the previous sweep. An engine whose count did not move is checked for
//! idleness and, if idle, has its direct submission ring stopped.

use crate::config::ControllerConfig;
use crate::idle::IdleDetector;
use crate::power::PowerState;
use crate::registry::SharedRegistry;
use crate::stats::ControllerStats;
use crate::timeout::{TimeoutElapsedMode, TimeoutPolicy};
use ringlet_core::{Clock, CommandStreamReceiver, ProductHelper, TaskCount};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of [`SubmissionMonitor::check_new_submissions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// The elapsed mode the sweep ran in.
    pub mode: TimeoutElapsedMode,
    /// Engines whose task count was read.
    pub evaluated: usize,
    /// Engines whose direct submission was stopped.
    pub stopped: usize,
    /// Engines skipped because their lock was held elsewhere.
    pub contended: usize,
}

impl SweepReport {
    /// A wake-up that was too early to sweep anything.
    pub fn skipped() -> Self {
        Self {
            mode: TimeoutElapsedMode::NotElapsed,
            evaluated: 0,
            stopped: 0,
            contended: 0,
        }
    }

    fn new(mode: TimeoutElapsedMode) -> Self {
        Self {
            mode,
            ..Self::skipped()
        }
    }
}

/// Owns the timeout policy and runs idle-check sweeps over the registry.
///
/// Only the controller thread drives a monitor; tests drive one directly.
pub struct SubmissionMonitor {
    registry: SharedRegistry,
    policy: TimeoutPolicy,
    idle: IdleDetector,
    clock: Arc<dyn Clock>,
    power: Arc<PowerState>,
    stats: Arc<ControllerStats>,
}

impl SubmissionMonitor {
    /// Creates a monitor over `registry`.
    pub fn new(
        registry: SharedRegistry,
        config: &ControllerConfig,
        helper: &dyn ProductHelper,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_shared_state(
            registry,
            config,
            helper,
            clock,
            Arc::new(PowerState::new()),
            Arc::new(ControllerStats::default()),
        )
    }

    pub(crate) fn with_shared_state(
        registry: SharedRegistry,
        config: &ControllerConfig,
        helper: &dyn ProductHelper,
        clock: Arc<dyn Clock>,
        power: Arc<PowerState>,
        stats: Arc<ControllerStats>,
    ) -> Self {
        let policy = TimeoutPolicy::new(config, helper, clock.now());
        Self {
            registry,
            policy,
            idle: IdleDetector::new(config),
            clock,
            power,
            stats,
        }
    }

    /// The timing state.
    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Power hints consumed at the start of each full sweep.
    pub fn power_state(&self) -> &PowerState {
        &self.power
    }

    /// Counters updated by every sweep.
    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Restarts the sweep window; time spent dormant never counts.
    pub fn begin_controlling(&mut self) {
        let now = self.clock.now();
        self.policy.reset_timestamps(now);
    }

    /// How long the control loop may sleep before the next sweep.
    pub fn sleep_interval(&self) -> Duration {
        self.policy.sleep_interval()
    }

    /// Runs one sweep, stopping every engine that stayed idle since the
    /// previous one.
    ///
    /// Never blocks on a CSR lock: contended engines are reported busy and
    /// revisited on the next sweep.
    pub fn check_new_submissions(&mut self) -> SweepReport {
        let mode = self.policy.elapsed_mode(self.clock.now());
        if mode == TimeoutElapsedMode::NotElapsed {
            return SweepReport::skipped();
        }

        if mode == TimeoutElapsedMode::FullyElapsed {
            self.policy.apply_power_state(
                self.power.ac_line_connected(),
                self.power.take_lowest_throttle(),
            );
        }

        let mut report = SweepReport::new(mode);
        {
            let Ok(mut registry) = self.registry.lock() else {
                log::warn!("Direct submission controller: registry lock poisoned, sweep skipped");
                return report;
            };
            registry.prune_dead();
            self.policy
                .adjust_for_compute_engines(registry.max_compute_engines_per_device());
            let hang_check_timestamp = self.policy.last_hang_check();

            for index in 0..registry.len() {
                let engine = &registry.engines()[index];
                if mode == TimeoutElapsedMode::BcsOnly && !engine.engine_type().is_copy() {
                    continue;
                }
                let Some(csr) = engine.csr() else {
                    continue;
                };
                report.evaluated += 1;

                let copy_engine = if !engine.engine_type().is_copy()
                    && csr.product_helper().check_bcs_for_direct_submission_stop()
                {
                    registry
                        .companion_copy_engine(engine.root_device_index())
                        .map(|copy| {
                            let task_count = copy.peek_task_count();
                            (copy, task_count)
                        })
                } else {
                    None
                };

                let task_count = csr.peek_task_count();
                if task_count != engine.last_observed_task_count() {
                    let engine = registry.engine_mut(index);
                    engine.is_stopped = false;
                    engine.task_count = task_count;
                    continue;
                }
                if engine.is_stopped() {
                    continue;
                }

                let siblings = if self.idle.checks_context_groups() {
                    registry.context_group_siblings(index)
                } else {
                    Vec::new()
                };
                let outcome = self.try_stop(
                    csr.as_ref(),
                    copy_engine.as_ref(),
                    &siblings,
                    hang_check_timestamp,
                );

                let engine = registry.engine_mut(index);
                match outcome {
                    StopOutcome::Stopped => {
                        engine.is_stopped = true;
                        report.stopped += 1;
                        log::debug!(
                            "Direct submission controller: stopped {} on device {} at task count {}",
                            engine.engine_type(),
                            engine.root_device_index(),
                            task_count
                        );
                    }
                    StopOutcome::Contended => report.contended += 1,
                    StopOutcome::Busy => {}
                }
                engine.task_count = task_count;
            }
        }

        if report.stopped > 0 {
            self.policy.recalculate_timeout(self.clock.now());
        }
        if mode == TimeoutElapsedMode::FullyElapsed {
            self.policy.mark_full_check(self.clock.now());
        }

        self.stats.record_sweep(&report);
        log::trace!(
            "Direct submission controller: {:?} sweep evaluated={} stopped={} contended={}",
            report.mode,
            report.evaluated,
            report.stopped,
            report.contended
        );
        report
    }

    fn try_stop(
        &self,
        csr: &dyn CommandStreamReceiver,
        copy_engine: Option<&(Arc<dyn CommandStreamReceiver>, TaskCount)>,
        siblings: &[Arc<dyn CommandStreamReceiver>],
        hang_check_timestamp: std::time::Instant,
    ) -> StopOutcome {
        if self.idle.is_enabled() {
            if let Some((copy, copy_task_count)) = copy_engine {
                if !self
                    .idle
                    .is_copy_engine_idle(copy.as_ref(), *copy_task_count, hang_check_timestamp)
                {
                    return StopOutcome::Busy;
                }
            }
        }

        let Some(guard) = csr.try_obtain_unique_ownership() else {
            return StopOutcome::Contended;
        };
        let guard = if self.idle.is_enabled() {
            match self
                .idle
                .is_direct_submission_idle(csr, guard, siblings, hang_check_timestamp)
            {
                Some(guard) => guard,
                None => return StopOutcome::Busy,
            }
        } else {
            guard
        };

        csr.stop_direct_submission(false, false);
        drop(guard);
        StopOutcome::Stopped
    }
}

enum StopOutcome {
    Stopped,
    Busy,
    Contended,
}
