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

//! # Ringlet Control
//!
//! The direct submission controller: a background thread that pauses the
//! direct submission ring of command stream receivers once they go idle, and
//! that delivers paging-fence unblock requests to them.
//!
//! The pieces, leaves first:
//! - [`registry`]: the monitored-engine registry.
//! - [`paging_fence`]: the FIFO of paging-fence requests that also wakes the thread.
//! - [`timeout`]: the adaptive timeout and elapsed-mode policy.
//! - [`idle`]: the idle detector, including context-group checks.
//! - [`monitor`]: one sweep over all monitored engines.
//! - [`service`]: the controller object and its control loop.

#![warn(missing_docs)]

pub mod config;
pub mod idle;
pub mod monitor;
pub mod paging_fence;
pub mod power;
pub mod registry;
pub mod service;
pub mod stats;
pub mod timeout;

pub use config::{ConfigError, ControllerConfig};
pub use monitor::{SubmissionMonitor, SweepReport};
pub use service::{ControllerPhase, DirectSubmissionController};
pub use stats::StatsSnapshot;
pub use timeout::{TimeoutElapsedMode, TimeoutPolicy};
