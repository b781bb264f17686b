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

//! FIFO of paging-fence requests, doubling as the controller's wake-up channel.
//!
//! Any thread may enqueue; the controller thread sleeps in
//! [`PagingFenceQueue::wait`] so a new request (or an explicit
//! [`wake`](PagingFenceQueue::wake)) cuts its sleep short.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ringlet_core::CommandStreamReceiver;
use std::sync::Arc;
use std::time::Duration;

/// A request to release the paging-fence semaphore of one CSR.
#[derive(Clone)]
pub struct PagingFenceRequest {
    /// The CSR whose semaphore must be released.
    pub csr: Arc<dyn CommandStreamReceiver>,
    /// Fence value to release up to.
    pub fence_value: u64,
}

impl PagingFenceRequest {
    /// Releases the semaphore. May be slow.
    pub fn unblock(&self) {
        log::trace!(
            "Unblocking paging fence {} on {}",
            self.fence_value,
            self.csr.os_context().engine_type()
        );
        self.csr.unblock_paging_fence_semaphore(self.fence_value);
    }
}

impl std::fmt::Debug for PagingFenceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagingFenceRequest")
            .field("engine_type", &self.csr.os_context().engine_type())
            .field("fence_value", &self.fence_value)
            .finish()
    }
}

enum ControlMessage {
    PagingFence(PagingFenceRequest),
    Wake,
}

/// Multi-producer FIFO consumed by the controller thread.
pub struct PagingFenceQueue {
    tx: Sender<ControlMessage>,
    rx: Receiver<ControlMessage>,
}

impl PagingFenceQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Appends a request and wakes the controller thread.
    pub fn enqueue(&self, csr: Arc<dyn CommandStreamReceiver>, fence_value: u64) {
        self.send(ControlMessage::PagingFence(PagingFenceRequest { csr, fence_value }));
    }

    /// Wakes the controller thread without queuing work.
    pub fn wake(&self) {
        self.send(ControlMessage::Wake);
    }

    /// Sleeps up to `timeout`. Returns the next request if one arrives first;
    /// `None` on timeout or on a plain wake-up.
    pub fn wait(&self, timeout: Duration) -> Option<PagingFenceRequest> {
        match self.rx.recv_timeout(timeout) {
            Ok(ControlMessage::PagingFence(request)) => Some(request),
            Ok(ControlMessage::Wake) => None,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pops the oldest pending request without blocking. Wake-ups in front
    /// of it are discarded.
    pub fn try_pop(&self) -> Option<PagingFenceRequest> {
        while let Ok(message) = self.rx.try_recv() {
            if let ControlMessage::PagingFence(request) = message {
                return Some(request);
            }
        }
        None
    }

    /// Pops requests one at a time until the queue is empty, handing each to
    /// `handle` with nothing held. Returns how many were handled.
    pub fn drain_with<F>(&self, mut handle: F) -> usize
    where
        F: FnMut(PagingFenceRequest),
    {
        let mut handled = 0;
        while let Some(request) = self.try_pop() {
            handle(request);
            handled += 1;
        }
        handled
    }

    /// Number of queued messages, including pending wake-ups.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn send(&self, message: ControlMessage) {
        // The queue owns its receiver, so the channel cannot be disconnected.
        if self.tx.send(message).is_err() {
            log::error!("Paging fence queue receiver vanished; request dropped.");
        }
    }
}

impl Default for PagingFenceQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringlet_core::mock::MockCommandStreamReceiver;
    use ringlet_core::EngineType;
    use std::time::Instant;

    #[test]
    fn test_requests_are_fifo() {
        let queue = PagingFenceQueue::new();
        let csr = Arc::new(MockCommandStreamReceiver::new(EngineType::Copy(0)));
        for fence in [3, 1, 2] {
            queue.enqueue(csr.clone(), fence);
        }

        let handled = queue.drain_with(|request| request.unblock());
        assert_eq!(handled, 3);
        assert_eq!(csr.unblocked_fences(), vec![3, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wait_times_out_when_empty() {
        let queue = PagingFenceQueue::new();
        let start = Instant::now();
        assert!(queue.wait(Duration::from_millis(10)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_wake_interrupts_wait_without_work() {
        let queue = PagingFenceQueue::new();
        queue.wake();
        let start = Instant::now();
        assert!(queue.wait(Duration::from_secs(5)).is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_try_pop_skips_wakeups() {
        let queue = PagingFenceQueue::new();
        let csr = Arc::new(MockCommandStreamReceiver::new(EngineType::Render));
        queue.wake();
        queue.enqueue(csr.clone(), 42);
        queue.wake();
        assert_eq!(queue.len(), 3);

        let request = queue.try_pop().unwrap();
        assert_eq!(request.fence_value, 42);
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }
}
