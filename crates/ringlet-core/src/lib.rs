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

//! # Ringlet Core
//!
//! Contracts between the direct submission controller and the command stream
//! receivers (CSRs) it supervises, plus the small value types they exchange.
//!
//! Nothing in this crate spawns threads or owns policy. The controller lives in
//! `ringlet-control`; GPU-facing code implements [`CommandStreamReceiver`].

#![warn(missing_docs)]

pub mod clock;
pub mod csr;
pub mod engine;
#[cfg(feature = "mock")]
pub mod mock;
pub mod product;

pub use clock::{Clock, ManualClock, SystemClock};
pub use csr::{try_unique_ownership, CommandStreamReceiver, OwnershipGuard, TaskCount};
pub use engine::{ContextGroupKey, EngineType, OsContext};
pub use product::{
    DefaultProductHelper, ProductHelper, QueueThrottle, TimeoutParams, DEFAULT_CONTROLLER_TIMEOUT,
};
