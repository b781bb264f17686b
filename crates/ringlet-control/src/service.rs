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

//! The direct submission controller service.
//!
//! Lifecycle: `Created → Dormant → Active → Terminated`. A dormant thread only
//! delivers paging fences; an active one also sweeps the registered engines.

use crate::config::ControllerConfig;
use crate::monitor::SubmissionMonitor;
use crate::paging_fence::{PagingFenceQueue, PagingFenceRequest};
use crate::power::PowerState;
use crate::registry::{EngineRegistry, SharedRegistry};
use crate::stats::{ControllerStats, StatsSnapshot};
use ringlet_core::{
    Clock, CommandStreamReceiver, DefaultProductHelper, ProductHelper, QueueThrottle, SystemClock,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

const THREAD_NAME: &str = "ringlet-ds-controller";

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    /// Constructed, no thread yet.
    Created,
    /// Thread running; paging fences only.
    Dormant,
    /// Thread running; paging fences and idle sweeps.
    Active,
    /// Thread stopped.
    Terminated,
}

impl ControllerPhase {
    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Dormant => 1,
            Self::Active => 2,
            Self::Terminated => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Dormant,
            2 => Self::Active,
            _ => Self::Terminated,
        }
    }
}

/// State shared between the controller object and its thread.
struct Shared {
    registry: SharedRegistry,
    queue: PagingFenceQueue,
    power: Arc<PowerState>,
    stats: Arc<ControllerStats>,
    dormant: AtomicBool,
    keep_controlling: AtomicBool,
    phase: AtomicU8,
}

impl Shared {
    fn set_phase(&self, phase: ControllerPhase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    fn keep_controlling(&self) -> bool {
        self.keep_controlling.load(Ordering::Acquire)
    }

    fn is_dormant(&self) -> bool {
        self.dormant.load(Ordering::Acquire)
    }

    /// Unblocks one request and, when active, sweeps right after.
    fn deliver(&self, request: PagingFenceRequest, monitor: Option<&mut SubmissionMonitor>) {
        request.unblock();
        self.stats.record_fence();
        if let Some(monitor) = monitor {
            monitor.check_new_submissions();
        }
    }

    fn handle_paging_fence_requests(&self, mut monitor: Option<&mut SubmissionMonitor>) {
        while let Some(request) = self.queue.try_pop() {
            self.deliver(request, monitor.as_deref_mut());
        }
    }
}

/// Pauses the direct submission ring of idle engines from a background
/// thread, and delivers paging-fence unblocks on behalf of producers.
///
/// Every method takes `&self`, so one controller can be shared by all
/// producer threads.
pub struct DirectSubmissionController {
    config: ControllerConfig,
    shared: Arc<Shared>,
    monitor: Mutex<Option<SubmissionMonitor>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DirectSubmissionController {
    /// Creates a controller with platform defaults and the system clock.
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_platform(config, &DefaultProductHelper)
    }

    /// Creates a controller whose timeout table comes from `helper`.
    pub fn with_platform(config: ControllerConfig, helper: &dyn ProductHelper) -> Self {
        Self::with_clock(config, helper, Arc::new(SystemClock))
    }

    /// Creates a controller driven by `clock`.
    pub fn with_clock(
        config: ControllerConfig,
        helper: &dyn ProductHelper,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry: SharedRegistry = Arc::new(Mutex::new(EngineRegistry::new()));
        let power = Arc::new(PowerState::new());
        let stats = Arc::new(ControllerStats::default());
        let monitor = SubmissionMonitor::with_shared_state(
            registry.clone(),
            &config,
            helper,
            clock,
            power.clone(),
            stats.clone(),
        );
        log::debug!(
            "Direct submission controller: timeout={:?} max={:?} bcs_divisor={}",
            monitor.policy().timeout(),
            monitor.policy().max_timeout(),
            monitor.policy().bcs_timeout_divisor()
        );

        Self {
            config,
            shared: Arc::new(Shared {
                registry,
                queue: PagingFenceQueue::new(),
                power,
                stats,
                dormant: AtomicBool::new(true),
                keep_controlling: AtomicBool::new(true),
                phase: AtomicU8::new(ControllerPhase::Created.as_u8()),
            }),
            monitor: Mutex::new(Some(monitor)),
            handle: Mutex::new(None),
        }
    }

    /// Creates a controller unless `config` disables it.
    pub fn initialize(config: ControllerConfig) -> Option<Self> {
        if !config.enabled {
            log::info!("Direct submission controller disabled by configuration.");
            return None;
        }
        Some(Self::new(config))
    }

    /// The configuration the controller was built from.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ControllerPhase {
        ControllerPhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Starts monitoring `csr`.
    pub fn register_direct_submission(&self, csr: Arc<dyn CommandStreamReceiver>) {
        if let Some(mut registry) = self.registry() {
            registry.register(csr);
        }
    }

    /// Stops monitoring `csr`. Safe while a sweep is running.
    pub fn unregister_direct_submission(&self, csr: &dyn CommandStreamReceiver) {
        if let Some(mut registry) = self.registry() {
            registry.unregister(csr);
        }
    }

    /// Number of monitored CSRs.
    pub fn registered_count(&self) -> usize {
        self.registry().map_or(0, |registry| registry.len())
    }

    /// Spawns the control thread in the dormant phase. Calling it again is a
    /// no-op. If the spawn fails, the controller stays `Created` and a later
    /// call may retry.
    pub fn start_thread(&self) -> io::Result<()> {
        self.spawn_control_thread(thread::Builder::new().name(THREAD_NAME.to_string()))
    }

    fn spawn_control_thread(&self, builder: thread::Builder) -> io::Result<()> {
        let mut slot = match self.monitor.lock() {
            Ok(slot) => slot,
            Err(_) => {
                log::warn!("Direct submission controller: monitor slot poisoned");
                return Ok(());
            }
        };
        if slot.is_none() {
            return Ok(());
        }

        // The monitor is only handed over once the thread exists.
        let (monitor_tx, monitor_rx) = crossbeam_channel::bounded::<SubmissionMonitor>(1);
        let shared = Arc::clone(&self.shared);
        let handle = builder.spawn(move || {
            if let Ok(monitor) = monitor_rx.recv() {
                control_loop(shared, monitor);
            }
        })?;

        let _ = self.shared.phase.compare_exchange(
            ControllerPhase::Created.as_u8(),
            ControllerPhase::Dormant.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Some(monitor) = slot.take() {
            let _ = monitor_tx.send(monitor);
        }
        if let Ok(mut handle_slot) = self.handle.lock() {
            *handle_slot = Some(handle);
        }
        Ok(())
    }

    /// Leaves the dormant phase; idle sweeps begin on the next wake-up.
    pub fn start_controlling(&self) {
        self.shared.dormant.store(false, Ordering::Release);
        self.shared.queue.wake();
    }

    /// Stops the control thread and waits for it. Idempotent.
    pub fn stop_thread(&self) {
        self.shared.keep_controlling.store(false, Ordering::Release);
        self.shared.dormant.store(false, Ordering::Release);
        self.shared.queue.wake();

        let handle = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Direct submission controller thread panicked.");
            }
        }
        self.shared.set_phase(ControllerPhase::Terminated);
    }

    /// Queues a paging-fence unblock for the control thread. Callable from
    /// any thread.
    pub fn enqueue_wait_for_paging_fence(&self, csr: Arc<dyn CommandStreamReceiver>, fence_value: u64) {
        self.shared.queue.enqueue(csr, fence_value);
    }

    /// Unblocks every queued paging fence on the calling thread, without
    /// sweeping. Returns how many were delivered.
    pub fn drain_paging_fence_queue(&self) -> usize {
        let shared = &self.shared;
        shared.queue.drain_with(|request| shared.deliver(request, None))
    }

    /// Records the throttle of a submission. The lowest one seen between two
    /// full sweeps selects the next timeout parameters.
    pub fn report_submitted_throttle(&self, throttle: QueueThrottle) {
        self.shared.power.report_throttle(throttle);
    }

    /// Records whether the machine runs on AC power.
    pub fn set_ac_line_connected(&self, connected: bool) {
        self.shared.power.set_ac_line_connected(connected);
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn registry(&self) -> Option<MutexGuard<'_, EngineRegistry>> {
        match self.shared.registry.lock() {
            Ok(registry) => Some(registry),
            Err(_) => {
                log::warn!("Direct submission controller: registry lock poisoned");
                None
            }
        }
    }
}

impl Drop for DirectSubmissionController {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

fn control_loop(shared: Arc<Shared>, mut monitor: SubmissionMonitor) {
    log::info!("Direct submission controller thread started.");

    while shared.is_dormant() && shared.keep_controlling() {
        shared.handle_paging_fence_requests(None);
        if let Some(request) = shared.queue.wait(monitor.sleep_interval()) {
            shared.deliver(request, None);
        }
        shared.handle_paging_fence_requests(None);
    }

    if shared.keep_controlling() {
        monitor.begin_controlling();
        shared.set_phase(ControllerPhase::Active);
        log::info!(
            "Direct submission controller active (timeout={:?}).",
            monitor.policy().timeout()
        );
    }

    while shared.keep_controlling() {
        shared.handle_paging_fence_requests(Some(&mut monitor));
        if let Some(request) = shared.queue.wait(monitor.sleep_interval()) {
            shared.deliver(request, Some(&mut monitor));
        }
        shared.handle_paging_fence_requests(Some(&mut monitor));

        if !shared.keep_controlling() {
            break;
        }
        monitor.check_new_submissions();
    }

    // Producers may still be waiting on fences queued during shutdown.
    shared.handle_paging_fence_requests(None);
    shared.set_phase(ControllerPhase::Terminated);
    let stats = shared.stats.snapshot();
    log::info!(
        "Direct submission controller thread stopped ({} stops, {} fences).",
        stats.stops,
        stats.fences_unblocked
    );
}
