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
//! Stable thread-to-slot assignment for sharded per-thread state.
//!
//! Responsibilities:
//! - Maps the calling thread to a small dense slot index, memoized per
//!   thread, so aggregation nodes can shard mutable state without locks
//!   on the hot path.
//!
//! Key exported interfaces:
//! - Types: `ThreadIndexer`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_INDEXER_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Memoized slot per (indexer, thread). Keyed by indexer id because
    // concurrent plans each carry their own indexer.
    static CACHED_SLOTS: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

/// Assigns each calling thread a stable slot in `0..capacity`.
///
/// First use by a thread takes an atomic round-robin ticket; later calls
/// from the same thread return the memoized slot. More threads than
/// capacity wrap around and share slots, which is safe because slot
/// state is mutex-guarded and sized to the executor's concurrency.
pub struct ThreadIndexer {
    id: u64,
    capacity: usize,
    next_slot: AtomicUsize,
}

impl ThreadIndexer {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: NEXT_INDEXER_ID.fetch_add(1, Ordering::Relaxed),
            capacity: capacity.max(1),
            next_slot: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slot index for the calling thread.
    pub fn slot(&self) -> usize {
        CACHED_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(slot) = slots.get(&self.id) {
                return *slot;
            }
            let slot = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.capacity;
            slots.insert(self.id, slot);
            slot
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn slot_is_memoized_per_thread() {
        let indexer = ThreadIndexer::new(8);
        let first = indexer.slot();
        for _ in 0..10 {
            assert_eq!(indexer.slot(), first);
        }
    }

    #[test]
    fn slots_stay_within_capacity() {
        let indexer = Arc::new(ThreadIndexer::new(2));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let indexer = Arc::clone(&indexer);
            handles.push(std::thread::spawn(move || indexer.slot()));
        }
        for handle in handles {
            let slot = handle.join().expect("join");
            assert!(slot < 2);
        }
    }

    #[test]
    fn distinct_indexers_do_not_share_memoization() {
        let a = ThreadIndexer::new(4);
        let b = ThreadIndexer::new(4);
        // Both see this thread as their first caller.
        assert_eq!(a.slot(), 0);
        assert_eq!(b.slot(), 0);
    }
}
