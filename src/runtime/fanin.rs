// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Fan-in completion counter.
//!
//! Responsibilities:
//! - Detects "all upstream batches seen" exactly once despite batches
//!   and the total-count announcement arriving concurrently from
//!   different worker threads.
//!
//! Key exported interfaces:
//! - Types: `FanInCounter`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// High half: announced total (all-ones while unset). Low half: batches
// counted so far. Sharing one word keeps the pair consistent: the racing
// final increment and total announcement are both read-modify-writes on
// the same atomic, so at least one of them observes the other's update.
const TOTAL_UNSET: u64 = u32::MAX as u64;
const COUNT_MASK: u64 = u32::MAX as u64;
const TOTAL_SHIFT: u32 = 32;

/// Atomic counter resolving the deliberate race between the final
/// `input_received` and `input_finished(total)`: whichever observer sees
/// `count == total` first claims completion through one compare/exchange,
/// so the finalize path runs exactly once.
pub struct FanInCounter {
    state: AtomicU64,
    completed: AtomicBool,
}

impl FanInCounter {
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(TOTAL_UNSET << TOTAL_SHIFT),
            completed: AtomicBool::new(false),
        }
    }

    fn claim(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record one received batch. Returns true iff this call completes
    /// the fan-in.
    pub fn increment(&self) -> bool {
        let state = self.state.fetch_add(1, Ordering::AcqRel) + 1;
        let count = state & COUNT_MASK;
        let total = state >> TOTAL_SHIFT;
        total != TOTAL_UNSET && count >= total && self.claim()
    }

    /// Record the eventual total. Returns true iff this call completes
    /// the fan-in (all batches were already counted).
    pub fn set_total(&self, total: usize) -> bool {
        let total = total as u64;
        let mut observed = self.state.load(Ordering::Acquire);
        loop {
            let next = (total << TOTAL_SHIFT) | (observed & COUNT_MASK);
            match self.state.compare_exchange_weak(
                observed,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => observed = current,
            }
        }
        (observed & COUNT_MASK) >= total && self.claim()
    }

    /// Claim completion for cancellation, so no later increment or
    /// total announcement can trigger finalize.
    pub fn cancel(&self) -> bool {
        self.claim()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn count(&self) -> usize {
        (self.state.load(Ordering::Acquire) & COUNT_MASK) as usize
    }
}

impl Default for FanInCounter {
    fn default() -> Self {
        Self::new()
    }
}
