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
//! Sink nodes: the plan's terminal consumers.
//!
//! Responsibilities:
//! - `SinkNode` re-exposes the pushed stream as an `AsyncGenerator` the
//!   driving caller drains, with optional watermark backpressure on the
//!   queued byte estimate.
//! - `ConsumingSinkNode` hands each batch to a caller-supplied consumer
//!   instead of queueing.
//!
//! Key exported interfaces:
//! - Types: `SinkNode`, `SinkNodeOptions`, `BackpressureOptions`,
//!   `ConsumingSinkNode`, `ConsumingSinkNodeOptions`, `SinkConsumer`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::cascade_logging::debug;
use crate::common::config;
use crate::common::error::{EngineError, Result};
use crate::exec::batch::Batch;
use crate::runtime::async_generator::AsyncGenerator;
use crate::runtime::fanin::FanInCounter;
use crate::runtime::future::{ExecFuture, ExecPromise};
use crate::runtime::mem_tracker::{process_mem_tracker, MemTracker};

use super::{ExecNode, NodeBase, NodeCtx, NodeId};

/// Watermarks over the sink's queued byte estimate. Above the high mark
/// the sink pauses its input; once the caller drains below the low mark
/// it resumes.
#[derive(Clone, Copy)]
pub struct BackpressureOptions {
    pub low_watermark_bytes: usize,
    pub high_watermark_bytes: usize,
}

impl BackpressureOptions {
    pub fn from_config() -> Self {
        Self {
            low_watermark_bytes: config::sink_low_watermark_bytes(),
            high_watermark_bytes: config::sink_high_watermark_bytes(),
        }
    }
}

#[derive(Default)]
pub struct SinkNodeOptions {
    /// `None` runs unthrottled.
    pub backpressure: Option<BackpressureOptions>,
}

struct SinkQueue {
    batches: VecDeque<Batch>,
    // At most one outstanding pull; the generator contract forbids a new
    // pull before the previous future resolves.
    waiter: Option<ExecPromise<Option<Batch>>>,
    error: Option<EngineError>,
    done: bool,
    paused: bool,
}

/// Terminal node queueing pushed batches for the driving caller.
///
/// `finished()` resolves on fan-in completion, independently of how far
/// the caller has drained the queue.
pub struct SinkNode {
    base: NodeBase,
    fanin: FanInCounter,
    queue: Mutex<SinkQueue>,
    tracker: Arc<MemTracker>,
    backpressure: Option<BackpressureOptions>,
    weak: Weak<SinkNode>,
}

impl SinkNode {
    pub(crate) fn try_new(ctx: NodeCtx, options: SinkNodeOptions) -> Result<Arc<dyn ExecNode>> {
        if ctx.inputs.len() != 1 {
            return Err(EngineError::invalid_argument(
                "sink node takes exactly one input",
            ));
        }
        if let Some(bp) = &options.backpressure {
            if bp.low_watermark_bytes > bp.high_watermark_bytes {
                return Err(EngineError::invalid_argument(format!(
                    "sink low watermark {} above high watermark {}",
                    bp.low_watermark_bytes, bp.high_watermark_bytes
                )));
            }
        }
        let schema = ctx.input_schemas[0].clone();
        let base = NodeBase::new(&ctx, "sink", schema);
        Ok(Arc::new_cyclic(|weak| Self {
            base,
            fanin: FanInCounter::new(),
            queue: Mutex::new(SinkQueue {
                batches: VecDeque::new(),
                waiter: None,
                error: None,
                done: false,
                paused: false,
            }),
            tracker: MemTracker::new_child("sink", &process_mem_tracker()),
            backpressure: options.backpressure,
            weak: Weak::clone(weak),
        }))
    }

    /// Pull side handed to the driving caller. Exhausts with `None` once
    /// the producer finished and the queue drained; a failed plan makes
    /// every later pull resolve with the error.
    pub fn generator(&self) -> AsyncGenerator {
        let weak = Weak::clone(&self.weak);
        Arc::new(move || {
            let Some(sink) = weak.upgrade() else {
                return ExecFuture::ready(Ok(None));
            };
            sink.pull()
        })
    }

    fn pull(&self) -> ExecFuture<Option<Batch>> {
        let mut resume = false;
        let result = {
            let mut queue = self.queue.lock().expect("sink queue lock");
            if let Some(err) = &queue.error {
                ExecFuture::ready(Err(err.clone()))
            } else if let Some(batch) = queue.batches.pop_front() {
                self.tracker.release(batch.estimated_bytes() as i64);
                if queue.paused {
                    let low = self
                        .backpressure
                        .map(|bp| bp.low_watermark_bytes as i64)
                        .unwrap_or(0);
                    if self.tracker.current() <= low {
                        queue.paused = false;
                        resume = true;
                    }
                }
                ExecFuture::ready(Ok(Some(batch)))
            } else if queue.done {
                ExecFuture::ready(Ok(None))
            } else if queue.waiter.is_some() {
                ExecFuture::ready(Err(EngineError::invalid_argument(
                    "sink pulled again before the previous pull resolved",
                )))
            } else {
                let (promise, future) = ExecPromise::new();
                queue.waiter = Some(promise);
                future
            }
        };
        if resume {
            debug!("sink node {} resuming input", self.base.id());
            self.base.resume_inputs();
        }
        result
    }

    fn complete(&self) {
        let waiter = {
            let mut queue = self.queue.lock().expect("sink queue lock");
            queue.done = true;
            if queue.batches.is_empty() && queue.error.is_none() {
                queue.waiter.take()
            } else {
                None
            }
        };
        if let Some(waiter) = waiter {
            waiter.set(Ok(None));
        }
        self.base.finish(Ok(()));
    }

    fn fail(&self, error: EngineError) {
        self.fanin.cancel();
        let waiter = {
            let mut queue = self.queue.lock().expect("sink queue lock");
            queue.error = Some(error.clone());
            queue.waiter.take()
        };
        if let Some(waiter) = waiter {
            waiter.set(Err(error.clone()));
        }
        self.base.finish(Err(error));
        self.base.stop_inputs();
    }
}

impl ExecNode for SinkNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn kind(&self) -> &'static str {
        "sink"
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn input_received(&self, _input: NodeId, batch: Batch) {
        if self.base.is_stopped() {
            return;
        }
        let mut pause = false;
        let waiter = {
            let mut queue = self.queue.lock().expect("sink queue lock");
            match queue.waiter.take() {
                // A pending pull takes the batch directly, bypassing the
                // queue and its byte accounting.
                Some(waiter) => Some(waiter),
                None => {
                    self.tracker.consume(batch.estimated_bytes() as i64);
                    queue.batches.push_back(batch.clone());
                    if let Some(bp) = &self.backpressure {
                        if !queue.paused
                            && self.tracker.current() >= bp.high_watermark_bytes as i64
                        {
                            queue.paused = true;
                            pause = true;
                        }
                    }
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            waiter.set(Ok(Some(batch)));
        }
        if pause {
            debug!("sink node {} pausing input", self.base.id());
            self.base.pause_inputs();
        }
        if self.fanin.increment() {
            self.complete();
        }
    }

    fn error_received(&self, _input: NodeId, error: EngineError) {
        self.fail(error);
    }

    fn input_finished(&self, _input: NodeId, total_batches: usize) {
        if self.fanin.set_total(total_batches) {
            self.complete();
        }
    }

    fn start_producing(&self) -> Result<()> {
        self.base.mark_started()
    }

    fn stop_producing(&self) {
        if !self.base.begin_stop() {
            return;
        }
        self.fanin.cancel();
        self.complete();
        self.base.stop_inputs();
    }
}

/// Caller-supplied batch consumer for `ConsumingSinkNode`. Must be
/// thread-safe; batches may arrive concurrently from worker threads.
pub trait SinkConsumer: Send + Sync {
    fn consume(&self, batch: Batch) -> Result<()>;

    /// Called exactly once after the last batch, before `finished()`
    /// resolves.
    fn finish(&self) -> Result<()>;
}

pub struct ConsumingSinkNodeOptions {
    pub consumer: Arc<dyn SinkConsumer>,
}

/// Terminal node forwarding each batch straight into a consumer instead
/// of queueing for a pull side.
pub struct ConsumingSinkNode {
    base: NodeBase,
    fanin: FanInCounter,
    consumer: Arc<dyn SinkConsumer>,
}

impl ConsumingSinkNode {
    pub(crate) fn try_new(
        ctx: NodeCtx,
        options: ConsumingSinkNodeOptions,
    ) -> Result<Arc<dyn ExecNode>> {
        if ctx.inputs.len() != 1 {
            return Err(EngineError::invalid_argument(
                "consuming sink node takes exactly one input",
            ));
        }
        let schema = ctx.input_schemas[0].clone();
        let base = NodeBase::new(&ctx, "consuming_sink", schema);
        Ok(Arc::new(Self {
            base,
            fanin: FanInCounter::new(),
            consumer: options.consumer,
        }))
    }

    fn fail(&self, error: EngineError) {
        self.fanin.cancel();
        self.base.finish(Err(error));
        self.base.stop_inputs();
    }

    fn complete(&self) {
        self.base.finish(self.consumer.finish());
    }
}

impl ExecNode for ConsumingSinkNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn kind(&self) -> &'static str {
        "consuming_sink"
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn input_received(&self, _input: NodeId, batch: Batch) {
        if self.base.is_stopped() {
            return;
        }
        if let Err(err) = self.consumer.consume(batch) {
            self.fail(err);
            return;
        }
        if self.fanin.increment() {
            self.complete();
        }
    }

    fn error_received(&self, _input: NodeId, error: EngineError) {
        self.fail(error);
    }

    fn input_finished(&self, _input: NodeId, total_batches: usize) {
        if self.fanin.set_total(total_batches) {
            self.complete();
        }
    }

    fn start_producing(&self) -> Result<()> {
        self.base.mark_started()
    }

    fn stop_producing(&self) {
        if !self.base.begin_stop() {
            return;
        }
        self.fanin.cancel();
        self.base.finish(Ok(()));
        self.base.stop_inputs();
    }
}
