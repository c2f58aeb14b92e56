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
//! Single-assignment future/promise cells with continuation chaining.
//!
//! Responsibilities:
//! - Carries one `Result<T>` from producer to consumers, resolving
//!   registered callbacks exactly once.
//! - Aggregates node-completion futures for the plan-level finished
//!   signal.
//!
//! Key exported interfaces:
//! - Types: `ExecFuture`, `ExecPromise`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::common::error::{EngineError, Result};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

enum CellState<T> {
    Pending(Vec<Callback<T>>),
    Ready(Result<T>),
}

struct FutureCell<T> {
    state: Mutex<CellState<T>>,
    cv: Condvar,
}

/// Read side of a single-assignment asynchronous result cell.
///
/// Cloning shares the same cell. Callbacks registered after resolution
/// run inline on the registering thread; callbacks registered before run
/// on the thread that resolves the promise. Payloads are `Clone` because
/// multiple consumers may observe the same resolution (batches are
/// arc-backed, so clones are cheap).
pub struct ExecFuture<T: Clone> {
    cell: Arc<FutureCell<T>>,
}

impl<T: Clone> Clone for ExecFuture<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

/// Write side of the cell. `set` may be called exactly once; later calls
/// are ignored so racing completion paths stay idempotent.
pub struct ExecPromise<T: Clone> {
    cell: Arc<FutureCell<T>>,
}

impl<T: Clone + Send + 'static> ExecPromise<T> {
    pub fn new() -> (Self, ExecFuture<T>) {
        let cell = Arc::new(FutureCell {
            state: Mutex::new(CellState::Pending(Vec::new())),
            cv: Condvar::new(),
        });
        (
            Self {
                cell: Arc::clone(&cell),
            },
            ExecFuture { cell },
        )
    }

    /// Resolve the cell. The first call wins; the value of any later
    /// call is dropped. Callbacks run on the resolving thread, after the
    /// cell lock is released.
    pub fn set(&self, value: Result<T>) {
        let (callbacks, value) = {
            let mut state = self.cell.state.lock().expect("future cell lock");
            match &mut *state {
                CellState::Ready(_) => return,
                CellState::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = CellState::Ready(value.clone());
                    (callbacks, value)
                }
            }
        };
        self.cell.cv.notify_all();
        for callback in callbacks {
            callback(&value);
        }
    }
}

impl<T: Clone + Send + 'static> ExecFuture<T> {
    /// A future that is already resolved.
    pub fn ready(value: Result<T>) -> Self {
        let (promise, future) = ExecPromise::new();
        promise.set(value);
        future
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            &*self.cell.state.lock().expect("future cell lock"),
            CellState::Ready(_)
        )
    }

    /// Register a continuation. Runs inline if the cell is already
    /// resolved.
    pub fn add_callback(&self, callback: impl FnOnce(&Result<T>) + Send + 'static) {
        let resolved = {
            let mut state = self.cell.state.lock().expect("future cell lock");
            match &mut *state {
                CellState::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                CellState::Ready(value) => value.clone(),
            }
        };
        callback(&resolved);
    }

    /// Block the calling thread until resolution. Only the top-level
    /// driving caller should use this; engine callbacks never block.
    pub fn wait(&self) -> Result<T> {
        let mut state = self.cell.state.lock().expect("future cell lock");
        loop {
            if let CellState::Ready(value) = &*state {
                return value.clone();
            }
            state = self
                .cell
                .cv
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Non-blocking read of a resolved cell.
    pub fn try_get(&self) -> Option<Result<T>> {
        match &*self.cell.state.lock().expect("future cell lock") {
            CellState::Ready(value) => Some(value.clone()),
            CellState::Pending(_) => None,
        }
    }
}

impl ExecFuture<()> {
    /// Resolves once every input future resolves, carrying the first
    /// error observed (in registration order for already-failed inputs,
    /// otherwise in completion order).
    pub fn all_complete(futures: Vec<ExecFuture<()>>) -> ExecFuture<()> {
        if futures.is_empty() {
            return ExecFuture::ready(Ok(()));
        }
        let (promise, future) = ExecPromise::new();
        let promise = Arc::new(promise);
        let remaining = Arc::new(AtomicUsize::new(futures.len()));
        let first_error: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));
        for f in futures {
            let promise = Arc::clone(&promise);
            let remaining = Arc::clone(&remaining);
            let first_error = Arc::clone(&first_error);
            f.add_callback(move |result| {
                if let Err(err) = result {
                    let mut slot = first_error.lock().expect("first error lock");
                    if slot.is_none() {
                        *slot = Some(err.clone());
                    }
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let error = first_error.lock().expect("first error lock").take();
                    promise.set(match error {
                        Some(err) => Err(err),
                        None => Ok(()),
                    });
                }
            });
        }
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn callback_after_resolve_runs_inline() {
        let future = ExecFuture::ready(Ok(7));
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        future.add_callback(move |v| {
            assert_eq!(*v.as_ref().expect("value"), 7);
            fired2.store(true, Ordering::Release);
        });
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn set_is_single_assignment() {
        let (promise, future) = ExecPromise::new();
        promise.set(Ok(1));
        promise.set(Ok(2));
        assert_eq!(future.wait().expect("value"), 1);
    }

    #[test]
    fn wait_blocks_until_cross_thread_set() {
        let (promise, future) = ExecPromise::<i32>::new();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            promise.set(Ok(42));
        });
        assert_eq!(future.wait().expect("value"), 42);
        handle.join().expect("join");
    }

    #[test]
    fn all_complete_carries_first_error() {
        let ok = ExecFuture::ready(Ok(()));
        let (promise, pending) = ExecPromise::new();
        let combined = ExecFuture::all_complete(vec![ok, pending]);
        assert!(!combined.is_ready());
        promise.set(Err(EngineError::execution("boom")));
        match combined.wait() {
            Err(EngineError::Execution(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
