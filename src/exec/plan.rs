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
//! Execution plan: sole owner of the node DAG for one run.
//!
//! Responsibilities:
//! - Builds nodes through the factory registry, wiring single-output
//!   edges as consumers register their inputs.
//! - Validates the DAG, starts nodes in reverse-topological order (sinks
//!   before sources), cascades cooperative stop from the sinks, and
//!   aggregates per-node completion into one plan future.
//!
//! Key exported interfaces:
//! - Types: `ExecPlan`, `ExecContext`, `PlanState`.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::cascade_logging::{debug, info};
use crate::common::error::{EngineError, Result};
use crate::exec::node::registry::{make_node, NodeOptions};
use crate::exec::node::{ExecNode, NodeCtx, NodeId};
use crate::runtime::future::ExecFuture;
use crate::runtime::thread_pool::{default_thread_pool, Executor};

/// Per-run execution environment. The default shares the process-wide
/// thread pool; tests inject a serial executor for determinism.
#[derive(Clone)]
pub struct ExecContext {
    pub executor: Arc<dyn Executor>,
}

impl ExecContext {
    pub fn with_executor(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            executor: default_thread_pool(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Created,
    Validated,
    Producing,
    Finished,
    Stopped,
}

impl PlanState {
    fn from_u8(value: u8) -> PlanState {
        match value {
            0 => PlanState::Created,
            1 => PlanState::Validated,
            2 => PlanState::Producing,
            3 => PlanState::Finished,
            _ => PlanState::Stopped,
        }
    }
}

/// Owning container of the node set.
///
/// Nodes reference the plan weakly for context lookup, so dropping the
/// plan drops the whole DAG. The node set freezes at `start_producing`.
pub struct ExecPlan {
    ctx: ExecContext,
    nodes: Mutex<Vec<Arc<dyn ExecNode>>>,
    state: AtomicU8,
    stop_requested: AtomicBool,
}

impl ExecPlan {
    pub fn new(ctx: ExecContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            nodes: Mutex::new(Vec::new()),
            state: AtomicU8::new(PlanState::Created as u8),
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.ctx.executor)
    }

    pub fn state(&self) -> PlanState {
        PlanState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PlanState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<dyn ExecNode>> {
        self.nodes.lock().expect("plan nodes lock").get(id).cloned()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.lock().expect("plan nodes lock").len()
    }

    /// Construct a node through the factory registry and register it.
    /// Inputs must already be in the plan; each may feed one consumer.
    pub fn add_node(
        self: &Arc<Self>,
        factory: &str,
        inputs: &[NodeId],
        options: NodeOptions,
    ) -> Result<NodeId> {
        match self.state() {
            PlanState::Created | PlanState::Validated => {}
            state => {
                return Err(EngineError::invalid_argument(format!(
                    "nodes can only be added before the plan starts (state {state:?})"
                )))
            }
        }
        // Any edit invalidates an earlier validation pass.
        self.set_state(PlanState::Created);
        let mut nodes = self.nodes.lock().expect("plan nodes lock");
        let id = nodes.len();
        let mut input_schemas = Vec::with_capacity(inputs.len());
        for input in inputs {
            let node = nodes.get(*input).ok_or_else(|| {
                EngineError::invalid_argument(format!("input node {input} does not exist"))
            })?;
            if node.base().output().is_some() {
                return Err(EngineError::invalid_argument(format!(
                    "input node {input} already feeds another consumer"
                )));
            }
            input_schemas.push(node.output_schema());
        }
        let ctx = NodeCtx {
            plan: Arc::downgrade(self),
            id,
            inputs: inputs.to_vec(),
            input_schemas,
        };
        let node = make_node(factory, ctx, options)?;
        for input in inputs {
            nodes[*input].base().set_output(id)?;
        }
        debug!("plan added node {id} ({factory})");
        nodes.push(node);
        Ok(id)
    }

    /// Check DAG shape before the run; the first violation is reported.
    pub fn validate(&self) -> Result<()> {
        if self.state() != PlanState::Created {
            return Ok(());
        }
        let nodes = self.nodes.lock().expect("plan nodes lock");
        if nodes.is_empty() {
            return Err(EngineError::invalid_argument("plan has no nodes"));
        }
        for node in nodes.iter() {
            let base = node.base();
            for input in base.inputs() {
                // Inputs precede their consumer by construction; an
                // equal-or-larger ordinal would be a cycle.
                if *input >= base.id() {
                    return Err(EngineError::invalid_argument(format!(
                        "node {} consumes a non-upstream node {}",
                        base.id(),
                        input
                    )));
                }
                let producer = nodes.get(*input).ok_or_else(|| {
                    EngineError::invalid_argument(format!(
                        "node {} consumes missing node {}",
                        base.id(),
                        input
                    ))
                })?;
                if producer.base().output() != Some(base.id()) {
                    return Err(EngineError::invalid_argument(format!(
                        "edge mismatch between nodes {} and {}",
                        input,
                        base.id()
                    )));
                }
            }
            if node.is_sink() {
                if base.output().is_some() {
                    return Err(EngineError::invalid_argument(format!(
                        "sink node {} must not have a consumer",
                        base.id()
                    )));
                }
            } else if base.output().is_none() {
                return Err(EngineError::invalid_argument(format!(
                    "node {} ({}) has no downstream consumer",
                    base.id(),
                    node.kind()
                )));
            }
            if node.output_schema().fields().is_empty() {
                return Err(EngineError::invalid_argument(format!(
                    "node {} has an empty output schema",
                    base.id()
                )));
            }
        }
        drop(nodes);
        self.set_state(PlanState::Validated);
        Ok(())
    }

    /// Start every node, sinks before sources, so each producer only
    /// pushes into consumers that are already running. A failed start
    /// aborts the remainder and stops what already started.
    pub fn start_producing(self: &Arc<Self>) -> Result<()> {
        if self.state() != PlanState::Validated {
            return Err(EngineError::invalid_argument(format!(
                "plan must be validated before starting (state {:?})",
                self.state()
            )));
        }
        self.set_state(PlanState::Producing);
        let nodes: Vec<Arc<dyn ExecNode>> =
            self.nodes.lock().expect("plan nodes lock").clone();
        info!("plan starting with {} nodes", nodes.len());
        for node in nodes.iter().rev() {
            if let Err(err) = node.start_producing() {
                for started in nodes.iter() {
                    started.stop_producing();
                }
                self.set_state(PlanState::Stopped);
                return Err(err);
            }
        }
        let plan = Arc::downgrade(self);
        self.finished().add_callback(move |result| {
            if let Some(plan) = plan.upgrade() {
                let stopped =
                    result.is_err() || plan.stop_requested.load(Ordering::Acquire);
                plan.set_state(if stopped {
                    PlanState::Stopped
                } else {
                    PlanState::Finished
                });
            }
        });
        Ok(())
    }

    /// Request cooperative stop on every terminal node; cancellation
    /// cascades backward through the DAG.
    pub fn stop_producing(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let nodes: Vec<Arc<dyn ExecNode>> =
            self.nodes.lock().expect("plan nodes lock").clone();
        info!("plan stop requested");
        for node in nodes.iter() {
            if node.base().output().is_none() {
                node.stop_producing();
            }
        }
    }

    /// Resolves once every node finished, carrying the first error.
    pub fn finished(&self) -> ExecFuture<()> {
        let futures: Vec<ExecFuture<()>> = self
            .nodes
            .lock()
            .expect("plan nodes lock")
            .iter()
            .map(|node| node.finished())
            .collect();
        ExecFuture::all_complete(futures)
    }
}
