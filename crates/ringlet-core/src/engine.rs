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

//! Engine identity and hardware context-group membership.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of hardware engine a command stream receiver submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineType {
    /// The render (3D) command streamer.
    Render,
    /// A compute command streamer, by instance index.
    Compute(u8),
    /// A blitter/copy engine (BCS), by instance index.
    Copy(u8),
    /// Video and other fixed-function engines.
    Other,
}

impl EngineType {
    /// Returns true for blitter/copy engines.
    pub fn is_copy(self) -> bool {
        matches!(self, EngineType::Copy(_))
    }

    /// Returns true for compute command streamers.
    pub fn is_compute(self) -> bool {
        matches!(self, EngineType::Compute(_))
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineType::Render => write!(f, "rcs"),
            EngineType::Compute(index) => write!(f, "ccs{}", index),
            EngineType::Copy(index) => write!(f, "bcs{}", index),
            EngineType::Other => write!(f, "other"),
        }
    }
}

/// Identifies one physical engine context shared by a group of CSRs.
///
/// CSRs with equal keys must all be idle before any of them may stop
/// direct submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextGroupKey {
    /// Physical device the group lives on.
    pub root_device_index: u32,
    /// Group identifier, unique per root device.
    pub context_group_id: u32,
}

/// The OS-level context a CSR submits through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsContext {
    engine_type: EngineType,
    context_group_id: Option<u32>,
}

impl OsContext {
    /// Creates a standalone context for the given engine.
    pub fn new(engine_type: EngineType) -> Self {
        Self {
            engine_type,
            context_group_id: None,
        }
    }

    /// Marks the context as a member of the given context group.
    pub fn with_context_group(mut self, context_group_id: u32) -> Self {
        self.context_group_id = Some(context_group_id);
        self
    }

    /// The engine this context submits to.
    pub fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    /// Whether the context shares its hardware context with siblings.
    pub fn is_part_of_context_group(&self) -> bool {
        self.context_group_id.is_some()
    }

    /// The context group id, if any.
    pub fn context_group_id(&self) -> Option<u32> {
        self.context_group_id
    }

    /// Derives the group key for a context living on `root_device_index`.
    pub fn context_group_key(&self, root_device_index: u32) -> Option<ContextGroupKey> {
        self.context_group_id.map(|context_group_id| ContextGroupKey {
            root_device_index,
            context_group_id,
        })
    }
}
