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

// Ringlet simulator
// Runs a direct submission controller against simulated engines.
// Run with: cargo run -p ringlet-sim -- --engines 4 --group-size 2

mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use ringlet_control::{ControllerConfig, DirectSubmissionController};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use workload::{RunSummary, WorkloadConfig};

#[derive(Debug, Parser)]
#[command(version, about = "Simulate direct submission control over mock engines")]
struct Cli {
    /// RON file with `controller` and `workload` sections.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of compute engines.
    #[arg(long)]
    engines: Option<u8>,
    /// Number of copy engines.
    #[arg(long)]
    copy_engines: Option<u8>,
    /// Compute engines sharing one context group.
    #[arg(long)]
    group_size: Option<u8>,
    /// Total run time in milliseconds.
    #[arg(long)]
    duration_ms: Option<u64>,
    /// Paging fences to enqueue.
    #[arg(long)]
    fences: Option<u64>,
    /// Base controller timeout in microseconds.
    #[arg(long)]
    timeout_us: Option<u64>,
    /// Maximum controller timeout in microseconds.
    #[arg(long)]
    max_timeout_us: Option<u64>,
    /// Copy-engine timeout divisor.
    #[arg(long)]
    bcs_divisor: Option<u32>,
}

/// Layout of the `--config` file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct SimFile {
    controller: ControllerConfig,
    workload: WorkloadConfig,
}

impl SimFile {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        ron::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

impl Cli {
    fn resolve(&self) -> Result<(ControllerConfig, WorkloadConfig)> {
        let SimFile {
            mut controller,
            mut workload,
        } = match &self.config {
            Some(path) => SimFile::load(path)?,
            None => SimFile {
                controller: ControllerConfig::from_env()?,
                workload: WorkloadConfig::default(),
            },
        };

        if let Some(timeout_us) = self.timeout_us {
            controller.timeout_us = Some(timeout_us);
        }
        if let Some(max_timeout_us) = self.max_timeout_us {
            controller.max_timeout_us = Some(max_timeout_us);
        }
        if let Some(divisor) = self.bcs_divisor {
            controller.bcs_timeout_divisor = divisor;
        }
        controller.validate()?;

        if let Some(engines) = self.engines {
            workload.compute_engines = engines;
        }
        if let Some(copy_engines) = self.copy_engines {
            workload.copy_engines = copy_engines;
        }
        if let Some(group_size) = self.group_size {
            workload.group_size = group_size;
        }
        if let Some(duration_ms) = self.duration_ms {
            workload.duration_ms = duration_ms;
        }
        if let Some(fences) = self.fences {
            workload.fences = fences;
        }
        Ok((controller, workload))
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Simulated {:?}", summary.elapsed);
    println!("{:<8} {:>8} {:>6} {:>7} {:>7}", "engine", "tasks", "stops", "fences", "active");
    for engine in &summary.engines {
        println!(
            "{:<8} {:>8} {:>6} {:>7} {:>7}",
            engine.engine_type.to_string(),
            engine.task_count,
            engine.stop_calls,
            engine.fences,
            engine.active
        );
    }
    let stats = &summary.stats;
    println!(
        "sweeps={} full={} stops={} contended={} fences={}",
        stats.sweeps, stats.full_sweeps, stats.stops, stats.contended_locks, stats.fences_unblocked
    );
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let (config, workload) = cli.resolve()?;
    let Some(controller) = DirectSubmissionController::initialize(config) else {
        log::warn!("Controller disabled; nothing to simulate.");
        return Ok(());
    };

    let engines = workload::build_engines(&workload)?;
    let summary = workload::run(&controller, &engines, &workload)?;
    print_summary(&summary);
    Ok(())
}
