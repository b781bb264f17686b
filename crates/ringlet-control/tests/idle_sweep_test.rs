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

use ringlet_control::registry::{EngineRegistry, SharedRegistry};
use ringlet_control::{ControllerConfig, SubmissionMonitor, SweepReport, TimeoutElapsedMode};
use ringlet_core::mock::MockCommandStreamReceiver;
use ringlet_core::{
    Clock, CommandStreamReceiver, DefaultProductHelper, EngineType, ManualClock, OsContext,
    OwnershipGuard, ProductHelper, TaskCount,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TIMEOUT_US: u64 = 1_000;

struct Harness {
    registry: SharedRegistry,
    clock: Arc<ManualClock>,
    monitor: SubmissionMonitor,
}

impl Harness {
    fn new(config: ControllerConfig) -> Self {
        let registry: SharedRegistry = Arc::new(Mutex::new(EngineRegistry::new()));
        let clock = Arc::new(ManualClock::new());
        let mut monitor = SubmissionMonitor::new(
            registry.clone(),
            &config,
            &DefaultProductHelper,
            clock.clone(),
        );
        monitor.begin_controlling();
        Self {
            registry,
            clock,
            monitor,
        }
    }

    fn with_timeout(bcs_divisor: u32) -> Self {
        Self::new(ControllerConfig {
            timeout_us: Some(TIMEOUT_US),
            max_timeout_us: Some(TIMEOUT_US * 10),
            bcs_timeout_divisor: bcs_divisor,
            ..Default::default()
        })
    }

    fn register(&self, csr: &Arc<MockCommandStreamReceiver>) {
        self.registry.lock().unwrap().register(csr.clone());
    }

    fn is_stopped(&self, csr: &MockCommandStreamReceiver) -> bool {
        self.registry
            .lock()
            .unwrap()
            .get(csr)
            .map(|engine| engine.is_stopped())
            .unwrap_or(false)
    }

    fn last_observed(&self, csr: &MockCommandStreamReceiver) -> u32 {
        self.registry
            .lock()
            .unwrap()
            .get(csr)
            .map(|engine| engine.last_observed_task_count())
            .unwrap_or(0)
    }

    /// Moves time past the current timeout and sweeps.
    fn full_sweep(&mut self) -> SweepReport {
        self.clock.advance(self.monitor.policy().timeout());
        self.monitor.check_new_submissions()
    }
}

#[test]
fn test_stop_is_issued_once_and_cleared_by_new_work() {
    // --- 1. ARRANGE ---
    let mut harness = Harness::with_timeout(1);
    let engine = Arc::new(MockCommandStreamReceiver::new(EngineType::Compute(0)));
    harness.register(&engine);

    // --- 2. ACT & ASSERT ---
    // Sweep 1: the count moved from 0 to 5, so the engine is not idle.
    engine.set_task_count(5);
    harness.full_sweep();
    assert_eq!(engine.stop_calls(), 0);
    assert_eq!(harness.last_observed(&engine), 5);
    assert!(!harness.is_stopped(&engine));

    // Sweep 2: unchanged and not busy.
    harness.full_sweep();
    assert_eq!(engine.stop_calls(), 1, "An idle engine must be stopped");
    assert!(harness.is_stopped(&engine));

    // Sweep 3: still unchanged, already stopped.
    harness.full_sweep();
    assert_eq!(engine.stop_calls(), 1, "A stopped engine must not be stopped again");

    // Sweep 4: new work arrived.
    engine.set_task_count(9);
    harness.full_sweep();
    assert_eq!(engine.stop_calls(), 1);
    assert!(!harness.is_stopped(&engine), "New work must clear the stopped flag");
    assert_eq!(harness.last_observed(&engine), 9);
}

#[test]
fn test_busy_engine_keeps_running_until_it_drains() {
    let mut harness = Harness::with_timeout(1);
    let engine = Arc::new(MockCommandStreamReceiver::new(EngineType::Render));
    engine.set_busy(true);
    harness.register(&engine);

    for _ in 0..3 {
        harness.full_sweep();
    }
    assert_eq!(engine.stop_calls(), 0);

    engine.set_busy(false);
    harness.full_sweep();
    assert_eq!(engine.stop_calls(), 1);
}

#[test]
fn test_unflushed_work_is_flushed_before_stopping() {
    let mut harness = Harness::with_timeout(1);
    let engine = Arc::new(MockCommandStreamReceiver::new(EngineType::Compute(0)));
    engine.set_task_count(2);
    engine.set_latest_flushed_task_count(1);
    engine.set_busy(true);
    engine.set_idle_after_tag_update(true);
    harness.register(&engine);

    // First sweep only records the count.
    harness.full_sweep();
    assert_eq!(engine.tag_update_calls(), 0);

    harness.full_sweep();
    assert_eq!(engine.tag_update_calls(), 1);
    assert_eq!(engine.stop_calls(), 1);
}

#[test]
fn test_context_group_sibling_vetoes_stop() {
    // --- 1. ARRANGE ---
    let mut harness = Harness::with_timeout(1);
    let a = Arc::new(MockCommandStreamReceiver::new(EngineType::Compute(0)).with_context_group(1));
    let b = Arc::new(MockCommandStreamReceiver::new(EngineType::Compute(1)).with_context_group(1));
    harness.register(&a);
    harness.register(&b);
    a.submit();
    b.submit();
    harness.full_sweep();

    // --- 2. ACT ---
    // B's lock is held by its producer for the whole sweep.
    let held = b.try_obtain_unique_ownership().unwrap();
    let report = harness.full_sweep();
    drop(held);

    // --- 3. ASSERT ---
    assert_eq!(a.stop_calls(), 0, "A locked sibling must veto the whole group");
    assert_eq!(b.stop_calls(), 0);
    assert_eq!(report.contended, 1);

    harness.full_sweep();
    assert_eq!(a.stop_calls(), 1);
    assert_eq!(b.stop_calls(), 1);
}

#[test]
fn test_busy_sibling_vetoes_stop() {
    let mut harness = Harness::with_timeout(1);
    let a = Arc::new(MockCommandStreamReceiver::new(EngineType::Compute(0)).with_context_group(3));
    let b = Arc::new(MockCommandStreamReceiver::new(EngineType::Compute(1)).with_context_group(3));
    b.set_busy(true);
    harness.register(&a);
    harness.register(&b);

    harness.full_sweep();
    harness.full_sweep();
    assert_eq!(a.stop_calls(), 0);
    assert_eq!(b.stop_calls(), 0);
}

/// Context-group member whose busy query starts new work on another engine.
struct MarkingSibling {
    inner: MockCommandStreamReceiver,
    marks: Arc<MockCommandStreamReceiver>,
}

impl CommandStreamReceiver for MarkingSibling {
    fn peek_task_count(&self) -> TaskCount {
        self.inner.peek_task_count()
    }

    fn peek_latest_flushed_task_count(&self) -> TaskCount {
        self.inner.peek_latest_flushed_task_count()
    }

    fn flush_tag_update(&self) {
        self.inner.flush_tag_update()
    }

    fn is_busy_without_hang(&self, hang_check_timestamp: Instant) -> bool {
        self.marks.set_busy(true);
        self.inner.is_busy_without_hang(hang_check_timestamp)
    }

    fn try_obtain_unique_ownership(&self) -> Option<OwnershipGuard<'_>> {
        self.inner.try_obtain_unique_ownership()
    }

    fn stop_direct_submission(&self, force: bool, blocking: bool) {
        self.inner.stop_direct_submission(force, blocking)
    }

    fn os_context(&self) -> &OsContext {
        self.inner.os_context()
    }

    fn root_device_index(&self) -> u32 {
        self.inner.root_device_index()
    }

    fn unblock_paging_fence_semaphore(&self, fence_value: u64) {
        self.inner.unblock_paging_fence_semaphore(fence_value)
    }

    fn product_helper(&self) -> &dyn ProductHelper {
        self.inner.product_helper()
    }
}

#[test]
fn test_subject_busy_after_group_check_is_not_stopped() {
    // --- 1. ARRANGE ---
    let mut harness = Harness::with_timeout(1);
    let subject =
        Arc::new(MockCommandStreamReceiver::new(EngineType::Compute(0)).with_context_group(1));
    let sibling = Arc::new(MarkingSibling {
        inner: MockCommandStreamReceiver::new(EngineType::Compute(1)).with_context_group(1),
        marks: subject.clone(),
    });
    harness.register(&subject);
    harness.registry.lock().unwrap().register(sibling.clone());
    subject.submit();
    sibling.inner.submit();
    harness.full_sweep();

    // --- 2. ACT ---
    harness.full_sweep();

    // --- 3. ASSERT ---
    assert_eq!(
        subject.stop_calls(),
        0,
        "Work started while the group was checked must keep the subject running"
    );
    assert!(
        subject.busy_checks() >= 2,
        "The subject must be re-checked after its siblings"
    );
    assert!(!harness.is_stopped(&subject));
}

#[test]
fn test_compute_engine_waits_for_copy_engine() {
    // --- 1. ARRANGE ---
    let mut harness = Harness::with_timeout(1);
    let ccs = Arc::new(MockCommandStreamReceiver::new(EngineType::Compute(0)).with_bcs_stop_check(true));
    let bcs = Arc::new(MockCommandStreamReceiver::new(EngineType::Copy(0)));
    bcs.set_busy(true);
    harness.register(&ccs);
    harness.register(&bcs);

    // --- 2. ACT ---
    harness.full_sweep();
    harness.full_sweep();

    // --- 3. ASSERT ---
    assert_eq!(ccs.stop_calls(), 0, "A busy copy engine must keep compute running");
    assert_eq!(bcs.stop_calls(), 0);

    bcs.set_busy(false);
    harness.full_sweep();
    assert_eq!(ccs.stop_calls(), 1);
    assert_eq!(bcs.stop_calls(), 1);
}

#[test]
fn test_bcs_only_sweep_leaves_full_check_timestamp() {
    // --- 1. ARRANGE ---
    let mut harness = Harness::with_timeout(4);
    let rcs = Arc::new(MockCommandStreamReceiver::new(EngineType::Render));
    let bcs = Arc::new(MockCommandStreamReceiver::new(EngineType::Copy(0)));
    harness.register(&rcs);
    harness.register(&bcs);
    let before = harness.monitor.policy().last_full_check();

    // --- 2. ACT ---
    harness.clock.advance(Duration::from_micros(TIMEOUT_US / 2));
    let report = harness.monitor.check_new_submissions();

    // --- 3. ASSERT ---
    assert_eq!(report.mode, TimeoutElapsedMode::BcsOnly);
    assert_eq!(harness.monitor.policy().last_full_check(), before);
    assert_eq!(bcs.stop_calls(), 1);
    assert_eq!(rcs.stop_calls(), 0, "Only copy engines are swept in BcsOnly mode");

    harness.clock.advance(Duration::from_micros(TIMEOUT_US / 2));
    let report = harness.monitor.check_new_submissions();
    assert_eq!(report.mode, TimeoutElapsedMode::FullyElapsed);
    assert_eq!(harness.monitor.policy().last_full_check(), harness.clock.now());
    assert_eq!(rcs.stop_calls(), 1);
}

#[test]
fn test_sweep_never_blocks_on_a_held_lock() {
    // --- 1. ARRANGE ---
    let mut harness = Harness::with_timeout(1);
    let engine = Arc::new(MockCommandStreamReceiver::new(EngineType::Compute(0)));
    harness.register(&engine);
    engine.submit();
    harness.full_sweep();

    // --- 2. ACT ---
    // The lock stays held on this thread while another thread sweeps.
    let held = engine.try_obtain_unique_ownership().unwrap();
    harness.clock.advance(Duration::from_micros(TIMEOUT_US));
    let (tx, rx) = crossbeam_channel::bounded(1);
    let sweeper = std::thread::spawn(move || {
        let report = harness.monitor.check_new_submissions();
        let _ = tx.send(report);
        harness
    });
    let report = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Sweep blocked on a held CSR lock");
    drop(held);
    sweeper.join().unwrap();

    // --- 3. ASSERT ---
    assert_eq!(report.contended, 1);
    assert_eq!(report.stopped, 0);
    assert_eq!(engine.stop_calls(), 0);
}

#[test]
fn test_rare_stops_grow_the_timeout() {
    let mut harness = Harness::with_timeout(1);
    let engine = Arc::new(MockCommandStreamReceiver::new(EngineType::Render));
    harness.register(&engine);
    let initial = harness.monitor.policy().timeout();

    // Stop once, then wait a while before the next stop.
    harness.full_sweep();
    harness.clock.advance(initial * 3);
    engine.submit();
    harness.full_sweep();
    harness.full_sweep();

    let grown = harness.monitor.policy().timeout();
    assert!(grown > initial, "timeout {:?} should exceed {:?}", grown, initial);
    assert!(grown <= initial * 3 / 2);
    assert!(grown <= harness.monitor.policy().max_timeout());
}

#[test]
fn test_idle_detection_disabled_stops_on_unchanged_count() {
    let mut harness = Harness::new(ControllerConfig {
        timeout_us: Some(TIMEOUT_US),
        idle_detection: false,
        ..Default::default()
    });
    let engine = Arc::new(MockCommandStreamReceiver::new(EngineType::Render));
    engine.set_busy(true);
    harness.register(&engine);

    harness.full_sweep();
    assert_eq!(engine.stop_calls(), 1);
}

#[test]
fn test_unregistered_engine_is_not_swept() {
    let mut harness = Harness::with_timeout(1);
    let engine = Arc::new(MockCommandStreamReceiver::new(EngineType::Render));
    harness.register(&engine);
    harness
        .registry
        .lock()
        .unwrap()
        .unregister(engine.as_ref());

    let report = harness.full_sweep();
    assert_eq!(report.evaluated, 0);
    assert_eq!(engine.stop_calls(), 0);
}
