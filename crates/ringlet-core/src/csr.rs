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

//! The command stream receiver contract consumed by the controller.

use crate::engine::OsContext;
use crate::product::ProductHelper;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Instant;

/// Monotonic counter of work submitted through a CSR.
pub type TaskCount = u32;

/// Exclusive ownership of a CSR. Released on drop.
pub type OwnershipGuard<'a> = MutexGuard<'a, ()>;

/// One hardware submission context as seen by the direct submission controller.
///
/// Implementations own their ownership mutex; the controller only ever calls
/// [`try_obtain_unique_ownership`](Self::try_obtain_unique_ownership) and never
/// waits on a contended CSR.
pub trait CommandStreamReceiver: Send + Sync {
    /// Latest submitted task count. No side effects.
    fn peek_task_count(&self) -> TaskCount;

    /// Task count known to have been flushed to hardware.
    fn peek_latest_flushed_task_count(&self) -> TaskCount;

    /// Forces a status tag refresh. May be expensive.
    fn flush_tag_update(&self);

    /// Whether the engine is still executing. `hang_check_timestamp` bounds
    /// the hang detection window.
    fn is_busy_without_hang(&self, hang_check_timestamp: Instant) -> bool;

    /// Non-blocking attempt to take the CSR's exclusive lock.
    fn try_obtain_unique_ownership(&self) -> Option<OwnershipGuard<'_>>;

    /// Halts the direct submission ring.
    fn stop_direct_submission(&self, force: bool, blocking: bool);

    /// The OS context this CSR submits through.
    fn os_context(&self) -> &OsContext;

    /// The physical device this CSR belongs to.
    fn root_device_index(&self) -> u32;

    /// Releases the GPU-visible semaphore gating work behind a paging fence.
    fn unblock_paging_fence_semaphore(&self, fence_value: u64);

    /// Platform capabilities of the device behind this CSR.
    fn product_helper(&self) -> &dyn ProductHelper;

    /// Whether the CSR finished initialization. Uninitialized CSRs are
    /// always treated as busy.
    fn is_initialized(&self) -> bool {
        true
    }
}

/// `try_lock` on a CSR ownership mutex, mapping contention and poisoning to `None`.
pub fn try_unique_ownership(lock: &Mutex<()>) -> Option<OwnershipGuard<'_>> {
    match lock.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::WouldBlock) => None,
        Err(TryLockError::Poisoned(_)) => {
            log::warn!("CSR ownership lock is poisoned; treating CSR as busy.");
            None
        }
    }
}
