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
//! Source node: adapts an async batch generator into the push chain.
//!
//! Responsibilities:
//! - Drives a cooperative pull loop over the generator, pushing each
//!   batch downstream either inline or as an executor task.
//! - Honors pause/resume backpressure and cooperative stop, announcing
//!   the exact delivered batch count on exhaustion.
//!
//! Key exported interfaces:
//! - Types: `SourceNode`, `SourceNodeOptions`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arrow::datatypes::SchemaRef;

use crate::cascade_logging::debug;
use crate::common::config;
use crate::common::error::{EngineError, Result};
use crate::exec::batch::Batch;
use crate::runtime::async_generator::AsyncGenerator;

use super::{ExecNode, NodeBase, NodeCtx, NodeId};

pub struct SourceNodeOptions {
    pub output_schema: SchemaRef,
    pub generator: AsyncGenerator,
}

// Mutable loop state; stop/pause may race with the pull loop, so every
// transition happens under this lock.
struct LoopState {
    paused: bool,
    // The loop parked itself on pause; resume must restart it.
    parked: bool,
    done: bool,
    // Generator failure; the last outstanding push task finishes with it.
    error: Option<EngineError>,
    batch_count: usize,
}

/// Zero-input node wrapping an `AsyncGenerator`.
///
/// `finished()` resolves only after the pull loop ended and every
/// dispatched-but-unexecuted push task has run, tracked by an in-flight
/// counter.
pub struct SourceNode {
    base: NodeBase,
    generator: AsyncGenerator,
    state: Mutex<LoopState>,
    inflight: AtomicUsize,
    transfer: bool,
    // Loop continuations and push tasks hold the node through this.
    weak: Weak<SourceNode>,
}

impl SourceNode {
    pub(crate) fn try_new(
        ctx: NodeCtx,
        options: SourceNodeOptions,
    ) -> Result<Arc<dyn ExecNode>> {
        if !ctx.inputs.is_empty() {
            return Err(EngineError::invalid_argument(
                "source node takes no inputs",
            ));
        }
        if options.output_schema.fields().is_empty() {
            return Err(EngineError::invalid_argument(
                "source node requires a non-empty output schema",
            ));
        }
        let base = NodeBase::new(&ctx, "source", options.output_schema);
        Ok(Arc::new_cyclic(|weak| Self {
            base,
            generator: options.generator,
            state: Mutex::new(LoopState {
                paused: false,
                parked: false,
                done: false,
                error: None,
                batch_count: 0,
            }),
            inflight: AtomicUsize::new(0),
            transfer: config::source_transfer_to_executor(),
            weak: Weak::clone(weak),
        }))
    }

    fn self_arc(&self) -> Result<Arc<Self>> {
        self.weak
            .upgrade()
            .ok_or_else(|| EngineError::execution("source node dropped while producing"))
    }

    /// One pull-loop step per iteration; a pending generator future
    /// continues the loop from its resolution callback instead of
    /// recursing, so unbounded streams never grow the stack.
    fn run_pull_loop(self: &Arc<Self>) {
        loop {
            {
                let mut state = self.state.lock().expect("source state lock");
                if state.done {
                    return;
                }
                if self.base.is_stopped() {
                    self.end_loop(&mut state);
                    return;
                }
                if state.paused {
                    state.parked = true;
                    return;
                }
            }
            let future = (self.generator)();
            match future.try_get() {
                Some(result) => {
                    if !self.handle_pull(result) {
                        return;
                    }
                }
                None => {
                    let node = Arc::clone(self);
                    future.add_callback(move |result| {
                        if node.handle_pull(result.clone()) {
                            node.run_pull_loop();
                        }
                    });
                    return;
                }
            }
        }
    }

    /// Returns true when the loop should keep pulling.
    fn handle_pull(self: &Arc<Self>, result: Result<Option<Batch>>) -> bool {
        match result {
            Ok(Some(batch)) => {
                self.state.lock().expect("source state lock").batch_count += 1;
                self.dispatch_push(batch);
                true
            }
            Ok(None) => {
                let mut state = self.state.lock().expect("source state lock");
                self.end_loop(&mut state);
                false
            }
            Err(err) => {
                // Earlier batches may still sit on the executor queue;
                // the error resolves `finished()` only once they drain.
                let finish_now = {
                    let mut state = self.state.lock().expect("source state lock");
                    state.done = true;
                    state.error = Some(err.clone());
                    self.inflight.load(Ordering::Acquire) == 0
                };
                self.base.push_error(err.clone());
                if finish_now {
                    self.base.finish(Err(err));
                }
                false
            }
        }
    }

    /// Push one batch downstream, hopping onto the executor when
    /// configured so I/O-bound generators never run consumer code on
    /// their own thread.
    fn dispatch_push(self: &Arc<Self>, batch: Batch) {
        if self.transfer {
            if let Ok(executor) = self.base.executor() {
                self.inflight.fetch_add(1, Ordering::AcqRel);
                let node = Arc::clone(self);
                // Batches are arc-backed; the clone shares the arrays.
                let task_batch = batch.clone();
                let spawned = executor.spawn(Box::new(move || {
                    node.base.push_batch(task_batch);
                    node.push_task_done();
                }));
                match spawned {
                    Ok(()) => return,
                    Err(_) => {
                        // Executor shut down; push inline instead.
                        self.inflight.fetch_sub(1, Ordering::AcqRel);
                    }
                }
            }
        }
        self.base.push_batch(batch);
    }

    fn push_task_done(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let result = {
                let state = self.state.lock().expect("source state lock");
                if !state.done {
                    return;
                }
                match &state.error {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                }
            };
            self.base.finish(result);
        }
    }

    /// End of stream or stop observed: announce the final batch count
    /// exactly once and resolve once no push task is outstanding.
    fn end_loop(&self, state: &mut LoopState) {
        if state.done {
            return;
        }
        state.done = true;
        let total = state.batch_count;
        debug!(
            "source node {} finished after {} batches",
            self.base.id(),
            total
        );
        self.base.push_finished(total);
        if self.inflight.load(Ordering::Acquire) == 0 {
            self.base.finish(Ok(()));
        }
    }
}

impl ExecNode for SourceNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn kind(&self) -> &'static str {
        "source"
    }

    fn input_received(&self, _input: NodeId, _batch: Batch) {
        debug!("source node {} ignored an unexpected batch", self.base.id());
    }

    fn error_received(&self, _input: NodeId, error: EngineError) {
        // No inputs exist; only reachable through misuse.
        self.base.finish(Err(error));
    }

    fn input_finished(&self, _input: NodeId, _total_batches: usize) {}

    fn start_producing(&self) -> Result<()> {
        self.base.mark_started()?;
        let this = self.self_arc()?;
        // The pull loop runs as an executor task so an unbounded
        // generator never pins the starting thread.
        let executor = self.base.executor()?;
        executor.spawn(Box::new(move || this.run_pull_loop()))?;
        Ok(())
    }

    fn pause_producing(&self, _output: NodeId) {
        let mut state = self.state.lock().expect("source state lock");
        state.paused = true;
    }

    fn resume_producing(&self, _output: NodeId) {
        let restart = {
            let mut state = self.state.lock().expect("source state lock");
            state.paused = false;
            let restart = state.parked && !state.done;
            state.parked = false;
            restart
        };
        if restart {
            if let Ok(this) = self.self_arc() {
                let spawned = match self.base.executor() {
                    Ok(executor) => {
                        let task = Arc::clone(&this);
                        executor
                            .spawn(Box::new(move || task.run_pull_loop()))
                            .is_ok()
                    }
                    Err(_) => false,
                };
                if !spawned {
                    this.run_pull_loop();
                }
            }
        }
    }

    fn stop_producing(&self) {
        if !self.base.begin_stop() {
            return;
        }
        let mut state = self.state.lock().expect("source state lock");
        self.end_loop(&mut state);
    }
}
