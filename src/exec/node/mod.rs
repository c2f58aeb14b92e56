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
//! Push-based execution nodes.
//!
//! Responsibilities:
//! - Defines the polymorphic node contract every operator implements:
//!   batches are pushed downstream through `input_received`, exhaustion
//!   is announced through `input_finished(total)`, errors through
//!   `error_received`, and cancellation flows backward through
//!   `stop_producing`.
//! - Provides `NodeBase`, the plumbing shared by all node kinds: plan
//!   back-reference, single-output edge, finished future, stop token.
//!
//! Key exported interfaces:
//! - Types: `ExecNode`, `NodeBase`, `NodeCtx`, `NodeId`.

pub mod aggregate;
pub mod filter;
pub mod hash_join;
pub mod order_by;
pub mod project;
pub mod registry;
pub mod sink;
pub mod source;

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arrow::datatypes::SchemaRef;

use crate::cascade_logging::warn;
use crate::common::error::{EngineError, Result};
use crate::exec::batch::Batch;
use crate::exec::plan::ExecPlan;
use crate::runtime::future::{ExecFuture, ExecPromise};
use crate::runtime::thread_pool::{Executor, StopToken};

/// Ordinal position of a node in its plan.
pub type NodeId = usize;

/// The push contract every operator implements.
///
/// `input_received` may be called concurrently from any worker thread;
/// each node is responsible for thread-safe accumulation of its own
/// state. Errors never propagate through return values on the data path,
/// only through `error_received` and the `finished` future.
pub trait ExecNode: Send + Sync {
    fn base(&self) -> &NodeBase;

    fn kind(&self) -> &'static str;

    /// Concrete-type access for callers holding `Arc<dyn ExecNode>`,
    /// e.g. to obtain a sink's drain generator.
    fn as_any(&self) -> &dyn Any;

    /// Terminal nodes never get a downstream consumer; plan validation
    /// and plan-level stop use this to find them.
    fn is_sink(&self) -> bool {
        false
    }

    /// An upstream node delivers one batch.
    fn input_received(&self, input: NodeId, batch: Batch);

    /// An upstream node delivers a terminal failure. The default for a
    /// passthrough node is forward unchanged and finish with the error.
    fn error_received(&self, input: NodeId, error: EngineError);

    /// An upstream node announces exactly how many batches it will have
    /// delivered in total. May arrive before or after the last batch.
    fn input_finished(&self, input: NodeId, total_batches: usize);

    /// Begin producing. Called exactly once per plan run, sinks before
    /// sources.
    fn start_producing(&self) -> Result<()>;

    /// Advisory backpressure from the downstream consumer. Forwarded
    /// upstream by default; only sources actually throttle.
    fn pause_producing(&self, _output: NodeId) {
        self.base().pause_inputs();
    }

    fn resume_producing(&self, _output: NodeId) {
        self.base().resume_inputs();
    }

    /// Cooperative cancellation. Idempotent; cascades to this node's
    /// inputs so production genuinely halts.
    fn stop_producing(&self);

    fn id(&self) -> NodeId {
        self.base().id()
    }

    fn output_schema(&self) -> SchemaRef {
        self.base().schema()
    }

    /// Resolves once this node will emit no more batches and has
    /// released its resources, successfully or not.
    fn finished(&self) -> ExecFuture<()> {
        self.base().finished_future()
    }
}

/// Construction context handed to node factories by the plan.
pub struct NodeCtx {
    pub plan: Weak<ExecPlan>,
    pub id: NodeId,
    pub inputs: Vec<NodeId>,
    pub input_schemas: Vec<SchemaRef>,
}

/// State shared by every node kind.
///
/// Nodes are single-output: the output edge is set once when a consumer
/// registers this node as its input. The finished promise is
/// single-assignment, so racing completion paths stay idempotent.
pub struct NodeBase {
    id: NodeId,
    label: String,
    plan: Weak<ExecPlan>,
    schema: SchemaRef,
    inputs: Vec<NodeId>,
    output: Mutex<Option<NodeId>>,
    promise: ExecPromise<()>,
    future: ExecFuture<()>,
    stop: StopToken,
    stop_claimed: AtomicBool,
    started: AtomicBool,
}

impl NodeBase {
    pub fn new(ctx: &NodeCtx, label: impl Into<String>, schema: SchemaRef) -> Self {
        let (promise, future) = ExecPromise::new();
        Self {
            id: ctx.id,
            label: label.into(),
            plan: Weak::clone(&ctx.plan),
            schema,
            inputs: ctx.inputs.clone(),
            output: Mutex::new(None),
            promise,
            future,
            stop: StopToken::new(),
            stop_claimed: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn plan(&self) -> Result<Arc<ExecPlan>> {
        self.plan
            .upgrade()
            .ok_or_else(|| EngineError::execution("execution plan dropped while node active"))
    }

    pub fn executor(&self) -> Result<Arc<dyn Executor>> {
        Ok(self.plan()?.executor())
    }

    /// Register the single downstream consumer. Called by the plan when
    /// a node names this one as an input.
    pub(crate) fn set_output(&self, output: NodeId) -> Result<()> {
        let mut slot = self.output.lock().expect("node output lock");
        if slot.is_some() {
            return Err(EngineError::invalid_argument(format!(
                "node '{}' already has a downstream consumer",
                self.label
            )));
        }
        *slot = Some(output);
        Ok(())
    }

    pub fn output(&self) -> Option<NodeId> {
        *self.output.lock().expect("node output lock")
    }

    fn output_node(&self) -> Option<Arc<dyn ExecNode>> {
        let output = self.output()?;
        match self.plan() {
            Ok(plan) => plan.node(output),
            Err(_) => None,
        }
    }

    /// Record the one allowed `start_producing` call.
    pub fn mark_started(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::invalid_argument(format!(
                "start_producing called twice on node '{}'",
                self.label
            )));
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Set the stop flag. Returns true only for the first caller, so
    /// stop cascades and repeated stop requests stay idempotent.
    pub fn begin_stop(&self) -> bool {
        self.stop.stop();
        !self.stop_claimed.swap(true, Ordering::AcqRel)
    }

    /// Resolve the finished future. First resolution wins.
    pub fn finish(&self, result: Result<()>) {
        self.promise.set(result);
    }

    pub fn finished_future(&self) -> ExecFuture<()> {
        self.future.clone()
    }

    /// Deliver one batch to the downstream consumer.
    pub fn push_batch(&self, batch: Batch) {
        match self.output_node() {
            Some(node) => node.input_received(self.id, batch),
            None => warn!("node '{}' dropped a batch: no consumer wired", self.label),
        }
    }

    /// Forward a terminal failure downstream.
    pub fn push_error(&self, error: EngineError) {
        if let Some(node) = self.output_node() {
            node.error_received(self.id, error);
        }
    }

    /// Announce this node's eventual total batch count downstream.
    pub fn push_finished(&self, total_batches: usize) {
        if let Some(node) = self.output_node() {
            node.input_finished(self.id, total_batches);
        }
    }

    fn for_each_input(&self, f: impl Fn(&Arc<dyn ExecNode>)) {
        let plan = match self.plan() {
            Ok(plan) => plan,
            Err(_) => return,
        };
        for input in &self.inputs {
            if let Some(node) = plan.node(*input) {
                f(&node);
            }
        }
    }

    pub fn pause_inputs(&self) {
        let id = self.id;
        self.for_each_input(|node| node.pause_producing(id));
    }

    pub fn resume_inputs(&self) {
        let id = self.id;
        self.for_each_input(|node| node.resume_producing(id));
    }

    pub fn stop_inputs(&self) {
        self.for_each_input(|node| node.stop_producing());
    }
}
