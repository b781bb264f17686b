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

//! Idle detection for command stream receivers.
//!
//! Every check here is biased towards "busy": a contended lock, an
//! uninitialized CSR or work still in flight all mean the engine keeps its
//! direct submission ring for another sweep.
//!
//! Lock discipline: at most one CSR ownership lock is held at any time. The
//! context-group check releases the subject's lock, checks each sibling in
//! turn, then re-takes the subject's lock and re-validates it.

use crate::config::ControllerConfig;
use ringlet_core::{CommandStreamReceiver, OwnershipGuard, TaskCount};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decides whether engines are idle enough to stop direct submission.
#[derive(Debug, Clone)]
pub struct IdleDetector {
    enabled: bool,
    context_group_detection: bool,
    tag_poll_window: Duration,
}

impl IdleDetector {
    /// Builds a detector from the controller config.
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            enabled: config.idle_detection,
            context_group_detection: config.context_group_idle_detection,
            tag_poll_window: config.tag_poll_window(),
        }
    }

    /// When disabled, unchanged task counts alone are enough to stop.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether context-group siblings are consulted.
    pub fn checks_context_groups(&self) -> bool {
        self.context_group_detection
    }

    /// Full idle check for `csr`, whose lock the caller holds as `guard`.
    ///
    /// Returns the re-held guard when the CSR (and every sibling of its
    /// context group) is idle, `None` otherwise. `siblings` must not contain
    /// `csr` itself.
    pub fn is_direct_submission_idle<'a>(
        &self,
        csr: &'a dyn CommandStreamReceiver,
        guard: OwnershipGuard<'a>,
        siblings: &[Arc<dyn CommandStreamReceiver>],
        hang_check_timestamp: Instant,
    ) -> Option<OwnershipGuard<'a>> {
        let guard = self.is_csr_idle(csr, guard, hang_check_timestamp)?;
        if !self.context_group_detection || siblings.is_empty() {
            return Some(guard);
        }

        drop(guard);
        for sibling in siblings {
            let Some(sibling_guard) = sibling.try_obtain_unique_ownership() else {
                log::trace!(
                    "Context group sibling {} is locked; group stays active",
                    sibling.os_context().engine_type()
                );
                return None;
            };
            drop(self.is_csr_idle(sibling.as_ref(), sibling_guard, hang_check_timestamp)?);
        }

        // State may have moved while the subject's lock was released.
        let guard = csr.try_obtain_unique_ownership()?;
        self.is_csr_idle(csr, guard, hang_check_timestamp)
    }

    /// Checks the copy engine a compute engine depends on.
    ///
    /// `expected_task_count` is the copy engine's task count read before the
    /// check; a submission racing with the check makes it busy.
    pub fn is_copy_engine_idle(
        &self,
        copy_engine: &dyn CommandStreamReceiver,
        expected_task_count: TaskCount,
        hang_check_timestamp: Instant,
    ) -> bool {
        let Some(guard) = copy_engine.try_obtain_unique_ownership() else {
            return false;
        };
        let idle = self
            .is_csr_idle(copy_engine, guard, hang_check_timestamp)
            .is_some();
        idle && copy_engine.peek_task_count() == expected_task_count
    }

    /// Idle check of a single CSR, ignoring its context group.
    ///
    /// If work was submitted but not yet flushed, a tag update is issued and
    /// the CSR is polled (with its lock released) for up to the poll window.
    fn is_csr_idle<'a>(
        &self,
        csr: &'a dyn CommandStreamReceiver,
        guard: OwnershipGuard<'a>,
        hang_check_timestamp: Instant,
    ) -> Option<OwnershipGuard<'a>> {
        if !csr.is_initialized() {
            return None;
        }
        if csr.peek_latest_flushed_task_count() == csr.peek_task_count() {
            return (!csr.is_busy_without_hang(hang_check_timestamp)).then_some(guard);
        }

        csr.flush_tag_update();
        drop(guard);

        let poll_start = Instant::now();
        while poll_start.elapsed() < self.tag_poll_window {
            if !csr.is_busy_without_hang(hang_check_timestamp) {
                break;
            }
            std::hint::spin_loop();
        }

        let guard = csr.try_obtain_unique_ownership()?;
        (!csr.is_busy_without_hang(hang_check_timestamp)).then_some(guard)
    }
}
