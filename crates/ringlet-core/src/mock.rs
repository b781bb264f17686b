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

//! An in-memory [`CommandStreamReceiver`] with scriptable state.
//!
//! Every observable input of the controller (task counts, busy state, lock
//! ownership) can be set from the outside, and every side effect the
//! controller causes is counted.

use crate::csr::{try_unique_ownership, CommandStreamReceiver, OwnershipGuard, TaskCount};
use crate::engine::{EngineType, OsContext};
use crate::product::ProductHelper;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

/// Product helper with a switchable copy-engine stop check.
#[derive(Debug, Default)]
pub struct MockProductHelper {
    check_bcs: AtomicBool,
}

impl ProductHelper for MockProductHelper {
    fn check_bcs_for_direct_submission_stop(&self) -> bool {
        self.check_bcs.load(Ordering::SeqCst)
    }
}

/// A scriptable command stream receiver.
#[derive(Debug)]
pub struct MockCommandStreamReceiver {
    os_context: OsContext,
    root_device_index: u32,
    product_helper: MockProductHelper,
    ownership: Mutex<()>,
    task_count: AtomicU32,
    latest_flushed_task_count: AtomicU32,
    busy: AtomicBool,
    idle_after_tag_update: AtomicBool,
    initialized: AtomicBool,
    direct_submission_active: AtomicBool,
    stop_calls: AtomicU32,
    tag_update_calls: AtomicU32,
    busy_checks: AtomicU32,
    unblocked_fences: Mutex<Vec<u64>>,
    fence_threads: Mutex<Vec<String>>,
}

impl MockCommandStreamReceiver {
    /// Creates an idle, initialized CSR on root device 0.
    pub fn new(engine_type: EngineType) -> Self {
        Self {
            os_context: OsContext::new(engine_type),
            root_device_index: 0,
            product_helper: MockProductHelper::default(),
            ownership: Mutex::new(()),
            task_count: AtomicU32::new(0),
            latest_flushed_task_count: AtomicU32::new(0),
            busy: AtomicBool::new(false),
            idle_after_tag_update: AtomicBool::new(false),
            initialized: AtomicBool::new(true),
            direct_submission_active: AtomicBool::new(true),
            stop_calls: AtomicU32::new(0),
            tag_update_calls: AtomicU32::new(0),
            busy_checks: AtomicU32::new(0),
            unblocked_fences: Mutex::new(Vec::new()),
            fence_threads: Mutex::new(Vec::new()),
        }
    }

    /// Places the CSR on another root device.
    pub fn with_root_device_index(mut self, root_device_index: u32) -> Self {
        self.root_device_index = root_device_index;
        self
    }

    /// Makes the CSR a member of a context group.
    pub fn with_context_group(mut self, context_group_id: u32) -> Self {
        self.os_context = self.os_context.with_context_group(context_group_id);
        self
    }

    /// Requires the copy engine on the same device to be idle before stopping.
    pub fn with_bcs_stop_check(self, enabled: bool) -> Self {
        self.product_helper.check_bcs.store(enabled, Ordering::SeqCst);
        self
    }

    /// Submits one flushed task and reactivates direct submission.
    pub fn submit(&self) -> TaskCount {
        let task_count = self.task_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest_flushed_task_count
            .store(task_count, Ordering::SeqCst);
        self.direct_submission_active.store(true, Ordering::SeqCst);
        task_count
    }

    /// Sets both the submitted and flushed task counts.
    pub fn set_task_count(&self, task_count: TaskCount) {
        self.task_count.store(task_count, Ordering::SeqCst);
        self.latest_flushed_task_count
            .store(task_count, Ordering::SeqCst);
    }

    /// Sets only the flushed task count.
    pub fn set_latest_flushed_task_count(&self, task_count: TaskCount) {
        self.latest_flushed_task_count
            .store(task_count, Ordering::SeqCst);
    }

    /// Sets the value returned by `is_busy_without_hang`.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// When set, a tag update completes outstanding work.
    pub fn set_idle_after_tag_update(&self, idle: bool) {
        self.idle_after_tag_update.store(idle, Ordering::SeqCst);
    }

    /// Sets the initialization state.
    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    /// Number of `stop_direct_submission` calls received.
    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of `flush_tag_update` calls received.
    pub fn tag_update_calls(&self) -> u32 {
        self.tag_update_calls.load(Ordering::SeqCst)
    }

    /// Number of `is_busy_without_hang` queries received.
    pub fn busy_checks(&self) -> u32 {
        self.busy_checks.load(Ordering::SeqCst)
    }

    /// Whether the direct submission ring is currently running.
    pub fn is_direct_submission_active(&self) -> bool {
        self.direct_submission_active.load(Ordering::SeqCst)
    }

    /// Fence values unblocked so far, in call order.
    pub fn unblocked_fences(&self) -> Vec<u64> {
        match self.unblocked_fences.lock() {
            Ok(fences) => fences.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Name of the thread behind each unblock, in call order.
    pub fn fence_threads(&self) -> Vec<String> {
        match self.fence_threads.lock() {
            Ok(names) => names.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CommandStreamReceiver for MockCommandStreamReceiver {
    fn peek_task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::SeqCst)
    }

    fn peek_latest_flushed_task_count(&self) -> TaskCount {
        self.latest_flushed_task_count.load(Ordering::SeqCst)
    }

    fn flush_tag_update(&self) {
        self.tag_update_calls.fetch_add(1, Ordering::SeqCst);
        self.latest_flushed_task_count
            .store(self.peek_task_count(), Ordering::SeqCst);
        if self.idle_after_tag_update.load(Ordering::SeqCst) {
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    fn is_busy_without_hang(&self, _hang_check_timestamp: Instant) -> bool {
        self.busy_checks.fetch_add(1, Ordering::SeqCst);
        self.busy.load(Ordering::SeqCst)
    }

    fn try_obtain_unique_ownership(&self) -> Option<OwnershipGuard<'_>> {
        try_unique_ownership(&self.ownership)
    }

    fn stop_direct_submission(&self, _force: bool, _blocking: bool) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.direct_submission_active.store(false, Ordering::SeqCst);
    }

    fn os_context(&self) -> &OsContext {
        &self.os_context
    }

    fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    fn unblock_paging_fence_semaphore(&self, fence_value: u64) {
        match self.unblocked_fences.lock() {
            Ok(mut fences) => fences.push(fence_value),
            Err(poisoned) => poisoned.into_inner().push(fence_value),
        }
        let name = thread::current().name().unwrap_or("<unnamed>").to_string();
        match self.fence_threads.lock() {
            Ok(mut names) => names.push(name),
            Err(poisoned) => poisoned.into_inner().push(name),
        }
    }

    fn product_helper(&self) -> &dyn ProductHelper {
        &self.product_helper
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}
