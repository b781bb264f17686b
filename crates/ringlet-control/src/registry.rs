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

//! Registry of command stream receivers under direct submission control.

use ringlet_core::{CommandStreamReceiver, ContextGroupKey, EngineType, TaskCount};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// The registry as shared between producers and the controller thread.
pub type SharedRegistry = Arc<Mutex<EngineRegistry>>;

/// Observed state of one registered CSR.
///
/// The registry does not own the CSR; the handle stops upgrading once the
/// CSR is dropped.
pub struct MonitoredEngine {
    csr: Weak<dyn CommandStreamReceiver>,
    engine_type: EngineType,
    root_device_index: u32,
    context_group: Option<ContextGroupKey>,
    pub(crate) task_count: TaskCount,
    pub(crate) is_stopped: bool,
}

impl MonitoredEngine {
    fn new(csr: &Arc<dyn CommandStreamReceiver>) -> Self {
        let root_device_index = csr.root_device_index();
        let os_context = csr.os_context();
        Self {
            csr: Arc::downgrade(csr),
            engine_type: os_context.engine_type(),
            root_device_index,
            context_group: os_context.context_group_key(root_device_index),
            task_count: 0,
            is_stopped: false,
        }
    }

    /// The CSR, if it is still alive.
    pub fn csr(&self) -> Option<Arc<dyn CommandStreamReceiver>> {
        self.csr.upgrade()
    }

    /// Engine the CSR submits to.
    pub fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    /// Device the CSR belongs to.
    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    /// Context group the CSR shares its hardware context with, if any.
    pub fn context_group(&self) -> Option<ContextGroupKey> {
        self.context_group
    }

    /// Task count seen during the previous sweep.
    pub fn last_observed_task_count(&self) -> TaskCount {
        self.task_count
    }

    /// Whether direct submission was stopped and nothing was submitted since.
    pub fn is_stopped(&self) -> bool {
        self.is_stopped
    }

    fn is(&self, csr: &dyn CommandStreamReceiver) -> bool {
        std::ptr::addr_eq(self.csr.as_ptr(), csr as *const dyn CommandStreamReceiver)
    }
}

impl std::fmt::Debug for MonitoredEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredEngine")
            .field("engine_type", &self.engine_type)
            .field("root_device_index", &self.root_device_index)
            .field("context_group", &self.context_group)
            .field("task_count", &self.task_count)
            .field("is_stopped", &self.is_stopped)
            .finish()
    }
}

/// Registered CSRs in registration order.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    engines: Vec<MonitoredEngine>,
    compute_engines_per_device: HashMap<u32, u32>,
}

impl EngineRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts monitoring `csr` with a task count of zero.
    ///
    /// Registering the same CSR twice is the caller's bug.
    pub fn register(&mut self, csr: Arc<dyn CommandStreamReceiver>) {
        let engine = MonitoredEngine::new(&csr);
        if engine.engine_type.is_compute() {
            *self
                .compute_engines_per_device
                .entry(engine.root_device_index)
                .or_insert(0) += 1;
        }
        log::info!(
            "EngineRegistry: Registered {} on device {} (group={:?})",
            engine.engine_type,
            engine.root_device_index,
            engine.context_group.map(|key| key.context_group_id)
        );
        self.engines.push(engine);
    }

    /// Stops monitoring `csr`. Returns false if it was not registered.
    pub fn unregister(&mut self, csr: &dyn CommandStreamReceiver) -> bool {
        let Some(position) = self.engines.iter().position(|engine| engine.is(csr)) else {
            return false;
        };
        let engine = self.engines.remove(position);
        self.forget_compute_engine(&engine);
        log::info!(
            "EngineRegistry: Unregistered {} on device {}",
            engine.engine_type,
            engine.root_device_index
        );
        true
    }

    /// Whether `csr` is registered.
    pub fn contains(&self, csr: &dyn CommandStreamReceiver) -> bool {
        self.engines.iter().any(|engine| engine.is(csr))
    }

    /// The monitored state of `csr`.
    pub fn get(&self, csr: &dyn CommandStreamReceiver) -> Option<&MonitoredEngine> {
        self.engines.iter().find(|engine| engine.is(csr))
    }

    /// Number of registered CSRs.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// All monitored engines in registration order.
    pub fn engines(&self) -> &[MonitoredEngine] {
        &self.engines
    }

    pub(crate) fn engine_mut(&mut self, index: usize) -> &mut MonitoredEngine {
        &mut self.engines[index]
    }

    /// Largest number of compute engines registered on a single device.
    pub fn max_compute_engines_per_device(&self) -> u32 {
        self.compute_engines_per_device
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Live CSRs sharing a context group with the engine at `index`, excluding itself.
    pub fn context_group_siblings(&self, index: usize) -> Vec<Arc<dyn CommandStreamReceiver>> {
        let Some(key) = self.engines.get(index).and_then(|engine| engine.context_group) else {
            return Vec::new();
        };
        self.engines
            .iter()
            .enumerate()
            .filter(|(other, engine)| *other != index && engine.context_group == Some(key))
            .filter_map(|(_, engine)| engine.csr())
            .collect()
    }

    /// The first registered live copy engine on `root_device_index`.
    pub fn companion_copy_engine(
        &self,
        root_device_index: u32,
    ) -> Option<Arc<dyn CommandStreamReceiver>> {
        self.engines
            .iter()
            .filter(|engine| {
                engine.engine_type.is_copy() && engine.root_device_index == root_device_index
            })
            .find_map(MonitoredEngine::csr)
    }

    /// Drops entries whose CSR no longer exists. Returns how many were removed.
    pub fn prune_dead(&mut self) -> usize {
        let (live, dead): (Vec<_>, Vec<_>) = std::mem::take(&mut self.engines)
            .into_iter()
            .partition(|engine| engine.csr.strong_count() > 0);
        self.engines = live;
        for engine in &dead {
            log::warn!(
                "EngineRegistry: {} on device {} was dropped without unregistering",
                engine.engine_type,
                engine.root_device_index
            );
            self.forget_compute_engine(engine);
        }
        dead.len()
    }

    fn forget_compute_engine(&mut self, engine: &MonitoredEngine) {
        if !engine.engine_type.is_compute() {
            return;
        }
        if let Some(count) = self
            .compute_engines_per_device
            .get_mut(&engine.root_device_index)
        {
            *count = count.saturating_sub(1);
        }
    }
}
