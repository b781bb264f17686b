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

//! Running counters for the controller.

use crate::monitor::SweepReport;
use crate::timeout::TimeoutElapsedMode;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the controller thread, readable from anywhere.
#[derive(Debug, Default)]
pub struct ControllerStats {
    sweeps: AtomicU64,
    full_sweeps: AtomicU64,
    stops: AtomicU64,
    contended_locks: AtomicU64,
    fences_unblocked: AtomicU64,
}

/// A point-in-time copy of [`ControllerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Sweeps that evaluated at least the copy engines.
    pub sweeps: u64,
    /// Sweeps that evaluated every engine.
    pub full_sweeps: u64,
    /// Direct submission stops issued.
    pub stops: u64,
    /// CSR locks found contended.
    pub contended_locks: u64,
    /// Paging fences unblocked.
    pub fences_unblocked: u64,
}

impl ControllerStats {
    /// Folds one sweep into the counters. Skipped sweeps are ignored.
    pub fn record_sweep(&self, report: &SweepReport) {
        match report.mode {
            TimeoutElapsedMode::NotElapsed => return,
            TimeoutElapsedMode::BcsOnly => {}
            TimeoutElapsedMode::FullyElapsed => {
                self.full_sweeps.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.stops
            .fetch_add(report.stopped as u64, Ordering::Relaxed);
        self.contended_locks
            .fetch_add(report.contended as u64, Ordering::Relaxed);
    }

    /// Counts one unblocked paging fence.
    pub fn record_fence(&self) {
        self.fences_unblocked.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            full_sweeps: self.full_sweeps.load(Ordering::Relaxed),
            stops: self.stops.load(Ordering::Relaxed),
            contended_locks: self.contended_locks.load(Ordering::Relaxed),
            fences_unblocked: self.fences_unblocked.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_sweeps_are_not_counted() {
        let stats = ControllerStats::default();
        stats.record_sweep(&SweepReport::skipped());
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_sweeps_and_fences_accumulate() {
        let stats = ControllerStats::default();
        stats.record_sweep(&SweepReport {
            mode: TimeoutElapsedMode::BcsOnly,
            evaluated: 1,
            stopped: 1,
            contended: 0,
        });
        stats.record_sweep(&SweepReport {
            mode: TimeoutElapsedMode::FullyElapsed,
            evaluated: 3,
            stopped: 2,
            contended: 1,
        });
        stats.record_fence();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sweeps, 2);
        assert_eq!(snapshot.full_sweeps, 1);
        assert_eq!(snapshot.stops, 3);
        assert_eq!(snapshot.contended_locks, 1);
        assert_eq!(snapshot.fences_unblocked, 1);
    }
}
