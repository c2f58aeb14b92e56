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
//! Worker thread pool and serial executor.
//!
//! Responsibilities:
//! - Runs submitted closures on lazily-spawned worker threads behind one
//!   FIFO queue, with cooperative cancellation tokens and capacity
//!   shrink via worker self-retirement.
//! - Provides a single-threaded executor running the identical queue
//!   discipline for deterministic tests.
//!
//! Key exported interfaces:
//! - Types: `Executor`, `ThreadPool`, `SerialExecutor`, `StopToken`.
//! - Functions: `default_thread_pool`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use crate::common::config;
use crate::common::error::{EngineError, Result};

/// Shared flag requesting cooperative stop. Readers observe the flag at
/// their next check; setting it never interrupts running work.
#[derive(Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Task execution abstraction shared by the pool and the serial
/// executor, injected into plans through the execution context.
pub trait Executor: Send + Sync {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) -> Result<()>;

    /// Maximum number of tasks that can run concurrently. Sizes the
    /// per-thread aggregation state arrays.
    fn capacity(&self) -> usize;
}

struct Task {
    run: Box<dyn FnOnce() + Send>,
    token: Option<StopToken>,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl Task {
    fn execute(self) {
        if let Some(token) = &self.token {
            if token.is_stopped() {
                if let Some(on_stop) = self.on_stop {
                    on_stop();
                }
                return;
            }
        }
        (self.run)();
    }
}

struct PoolState {
    queue: VecDeque<Task>,
    desired_capacity: usize,
    workers: usize,
    idle: usize,
    shutdown: bool,
    keep_pending: bool,
}

struct PoolShared {
    mu: Mutex<PoolState>,
    cv: Condvar,
}

/// Fixed-or-growable pool of OS worker threads over one FIFO task queue.
///
/// Workers are launched lazily when a task is queued and no idle worker
/// exists; shrinking the capacity lets surplus workers retire at their
/// next queue visit instead of killing them mid-task.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(PoolShared {
                mu: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    desired_capacity: capacity.max(1),
                    workers: 0,
                    idle: 0,
                    shutdown: false,
                    keep_pending: true,
                }),
                cv: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Enqueue a task with an optional cancellation token. If the token
    /// is already triggered when a worker picks the task up, `on_stop`
    /// runs instead of the task body.
    pub fn spawn_cancellable(
        &self,
        task: Box<dyn FnOnce() + Send>,
        token: Option<StopToken>,
        on_stop: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        let mut state = self.shared.mu.lock().expect("thread pool lock");
        if state.shutdown {
            return Err(EngineError::Scheduler(
                "spawn on a thread pool after shutdown".to_string(),
            ));
        }
        state.queue.push_back(Task {
            run: task,
            token,
            on_stop,
        });
        if state.idle == 0 && state.workers < state.desired_capacity {
            state.workers += 1;
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("cascade-worker-{}", state.workers))
                .spawn(move || worker_loop(shared))
                .map_err(|e| EngineError::Scheduler(format!("failed to spawn worker: {e}")))?;
            self.handles.lock().expect("thread pool handles lock").push(handle);
        }
        drop(state);
        self.shared.cv.notify_one();
        Ok(())
    }

    /// Change the desired worker count. Growth takes effect as new tasks
    /// arrive; surplus workers retire at their next queue visit.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.shared.mu.lock().expect("thread pool lock");
        state.desired_capacity = capacity.max(1);
        drop(state);
        self.shared.cv.notify_all();
    }

    /// Stop accepting tasks and join every worker. With `wait` the
    /// pending queue drains first; without it pending tasks are dropped.
    pub fn shutdown(&self, wait: bool) {
        {
            let mut state = self.shared.mu.lock().expect("thread pool lock");
            state.shutdown = true;
            state.keep_pending = wait;
            if !wait {
                state.queue.clear();
            }
        }
        self.shared.cv.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock().expect("thread pool handles lock"));
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn queued_tasks(&self) -> usize {
        self.shared.mu.lock().expect("thread pool lock").queue.len()
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    let mut state = shared.mu.lock().expect("thread pool lock");
    loop {
        if state.shutdown && (!state.keep_pending || state.queue.is_empty()) {
            break;
        }
        // Capacity shrank below the live worker count: retire.
        if state.workers > state.desired_capacity {
            break;
        }
        if let Some(task) = state.queue.pop_front() {
            drop(state);
            task.execute();
            state = shared.mu.lock().expect("thread pool lock");
            continue;
        }
        state.idle += 1;
        state = shared.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        state.idle -= 1;
    }
    state.workers -= 1;
    drop(state);
    shared.cv.notify_all();
}

impl Executor for ThreadPool {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) -> Result<()> {
        self.spawn_cancellable(task, None, None)
    }

    fn capacity(&self) -> usize {
        self.shared
            .mu
            .lock()
            .expect("thread pool lock")
            .desired_capacity
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

struct SerialState {
    queue: VecDeque<Box<dyn FnOnce() + Send>>,
    finished: bool,
}

/// Degenerate executor running the pool's queue discipline on the
/// calling thread. `run_loop` drains tasks until `mark_finished`.
pub struct SerialExecutor {
    mu: Mutex<SerialState>,
    cv: Condvar,
}

impl SerialExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mu: Mutex::new(SerialState {
                queue: VecDeque::new(),
                finished: false,
            }),
            cv: Condvar::new(),
        })
    }

    /// Run queued tasks on the calling thread until `mark_finished` and
    /// the queue is drained.
    pub fn run_loop(&self) {
        let mut state = self.mu.lock().expect("serial executor lock");
        loop {
            if let Some(task) = state.queue.pop_front() {
                drop(state);
                task();
                state = self.mu.lock().expect("serial executor lock");
                continue;
            }
            if state.finished {
                break;
            }
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn mark_finished(&self) {
        self.mu.lock().expect("serial executor lock").finished = true;
        self.cv.notify_all();
    }
}

impl Executor for SerialExecutor {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) -> Result<()> {
        let mut state = self.mu.lock().expect("serial executor lock");
        if state.finished {
            return Err(EngineError::Scheduler(
                "spawn on a finished serial executor".to_string(),
            ));
        }
        state.queue.push_back(task);
        drop(state);
        self.cv.notify_all();
        Ok(())
    }

    fn capacity(&self) -> usize {
        1
    }
}

static DEFAULT_POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();

/// Process-wide shared pool, lazily initialized from config. Callers
/// needing isolation supply their own pool through the execution
/// context instead.
pub fn default_thread_pool() -> Arc<ThreadPool> {
    Arc::clone(DEFAULT_POOL.get_or_init(|| ThreadPool::new(config::default_worker_threads())))
}
