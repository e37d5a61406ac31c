// Copyright 2026 Boundless Foundation, Inc.
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

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use alloy::primitives::U256;

use crate::{confirmation::ResponseCounts, events::LogPosition};

/// Scheduling state shared by the polling loop and the simulation tasks it spawns
#[derive(Debug, Default)]
pub struct SchedulerState {
    latest_head: AtomicU64,
    inflight: Mutex<HashSet<LogPosition>>,
    responses: Mutex<ResponseCounts>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_head(&self) -> u64 {
        self.latest_head.load(Ordering::Acquire)
    }

    pub fn set_latest_head(&self, head: u64) {
        self.latest_head.store(head, Ordering::Release);
    }

    fn inflight(&self) -> MutexGuard<'_, HashSet<LogPosition>> {
        // A panicked holder cannot leave the set half updated
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn responses(&self) -> MutexGuard<'_, ResponseCounts> {
        self.responses.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True if the log at `position` was already acted on
    pub fn is_inflight(&self, position: &LogPosition) -> bool {
        self.inflight().contains(position)
    }

    pub fn mark_inflight(&self, positions: impl IntoIterator<Item = LogPosition>) {
        self.inflight().extend(positions);
    }

    /// Evicts positions from blocks below the watermark, they are never rescanned
    pub fn evict_inflight_below(&self, watermark: u64) -> usize {
        let mut inflight = self.inflight();
        let before = inflight.len();
        inflight.retain(|pos| pos.block_number >= watermark);
        before - inflight.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight().len()
    }

    pub fn record_fulfillment(&self, request_id: U256, position: LogPosition) -> bool {
        self.responses().record(request_id, position)
    }

    pub fn response_count(&self, request_id: &U256) -> u64 {
        self.responses().count(request_id)
    }

    /// Prunes response counts relative to the latest head
    pub fn prune_responses(&self) -> usize {
        let head = self.latest_head();
        self.responses().prune(head)
    }
}
