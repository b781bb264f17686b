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

//! Simulated producers: a burst of submissions and paging fences, then quiet.

use anyhow::{ensure, Result};
use ringlet_control::{DirectSubmissionController, StatsSnapshot};
use ringlet_core::mock::MockCommandStreamReceiver;
use ringlet_core::{CommandStreamReceiver, EngineType, QueueThrottle, TaskCount};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Context group shared by the grouped compute engines.
const SIM_CONTEXT_GROUP: u32 = 1;

/// Shape of the simulated device and its workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Compute engines on the device.
    pub compute_engines: u8,
    /// Copy engines on the device.
    pub copy_engines: u8,
    /// How many compute engines share one context group.
    pub group_size: u8,
    /// Total run time; the first half is busy, the second half quiet.
    pub duration_ms: u64,
    /// Paging fences enqueued during the busy half.
    pub fences: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            compute_engines: 2,
            copy_engines: 1,
            group_size: 0,
            duration_ms: 200,
            fences: 16,
        }
    }
}

/// Final state of one simulated engine.
#[derive(Debug)]
pub struct EngineSummary {
    pub engine_type: EngineType,
    pub task_count: TaskCount,
    pub stop_calls: u32,
    pub active: bool,
    pub fences: usize,
}

/// What a run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub engines: Vec<EngineSummary>,
    pub stats: StatsSnapshot,
}

/// Builds the simulated engines described by `workload`.
pub fn build_engines(workload: &WorkloadConfig) -> Result<Vec<Arc<MockCommandStreamReceiver>>> {
    ensure!(
        workload.group_size <= workload.compute_engines,
        "group size {} exceeds the {} compute engines",
        workload.group_size,
        workload.compute_engines
    );
    ensure!(
        workload.compute_engines as usize + workload.copy_engines as usize > 0,
        "the workload has no engines"
    );

    let mut engines = Vec::new();
    for index in 0..workload.compute_engines {
        let mut csr = MockCommandStreamReceiver::new(EngineType::Compute(index))
            .with_bcs_stop_check(workload.copy_engines > 0);
        if index < workload.group_size {
            csr = csr.with_context_group(SIM_CONTEXT_GROUP);
        }
        engines.push(Arc::new(csr));
    }
    for index in 0..workload.copy_engines {
        engines.push(Arc::new(MockCommandStreamReceiver::new(EngineType::Copy(index))));
    }
    Ok(engines)
}

/// Registers `engines`, runs the producer, then shuts the controller down.
pub fn run(
    controller: &DirectSubmissionController,
    engines: &[Arc<MockCommandStreamReceiver>],
    workload: &WorkloadConfig,
) -> Result<RunSummary> {
    for csr in engines {
        controller.register_direct_submission(csr.clone());
    }
    controller.start_thread()?;
    controller.start_controlling();

    let start = Instant::now();
    let busy_for = Duration::from_millis(workload.duration_ms / 2);
    let total = Duration::from_millis(workload.duration_ms);

    thread::scope(|scope| {
        scope.spawn(|| produce(controller, engines, workload.fences, busy_for));
    });
    if let Some(remaining) = total.checked_sub(start.elapsed()) {
        log::info!("Producers quiet; waiting {:?} for the controller", remaining);
        thread::sleep(remaining);
    }

    controller.stop_thread();
    for csr in engines {
        controller.unregister_direct_submission(csr.as_ref());
    }

    Ok(RunSummary {
        elapsed: start.elapsed(),
        engines: engines
            .iter()
            .map(|csr| EngineSummary {
                engine_type: csr.os_context().engine_type(),
                task_count: csr.peek_task_count(),
                stop_calls: csr.stop_calls(),
                active: csr.is_direct_submission_active(),
                fences: csr.unblocked_fences().len(),
            })
            .collect(),
        stats: controller.stats(),
    })
}

fn produce(
    controller: &DirectSubmissionController,
    engines: &[Arc<MockCommandStreamReceiver>],
    fences: u64,
    busy_for: Duration,
) {
    if engines.is_empty() {
        return;
    }
    let start = Instant::now();
    let mut round: u64 = 0;
    let mut fences_sent = 0;
    while start.elapsed() < busy_for {
        let csr = &engines[(round % engines.len() as u64) as usize];
        let task_count = csr.submit();
        controller.report_submitted_throttle(throttle_for(round));
        log::trace!(
            "Submitted task {} to {}",
            task_count,
            csr.os_context().engine_type()
        );

        if fences_sent < fences && round % 8 == 0 {
            fences_sent += 1;
            controller.enqueue_wait_for_paging_fence(csr.clone(), fences_sent);
        }
        round += 1;
        thread::sleep(Duration::from_micros(200));
    }

    // Anything the busy window did not reach is still delivered.
    for fence in fences_sent + 1..=fences {
        controller.enqueue_wait_for_paging_fence(engines[0].clone(), fence);
    }
    log::info!(
        "Producer finished: {} submissions, {} fences",
        round,
        fences
    );
}

fn throttle_for(round: u64) -> QueueThrottle {
    match round % 3 {
        0 => QueueThrottle::High,
        1 => QueueThrottle::Medium,
        _ => QueueThrottle::Low,
    }
}
