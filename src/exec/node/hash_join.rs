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
//! Hash join node: inner equi-join of two input streams.
//!
//! Responsibilities:
//! - Buffers the build side (second input), indexes it by key tuple once
//!   exhausted, then streams the probe side (first input) against it.
//! - Probe batches arriving before the build side is ready are parked
//!   and flushed when the table is built.
//!
//! Key exported interfaces:
//! - Types: `HashJoinNode`, `HashJoinNodeOptions`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::{Schema, SchemaRef};

use crate::cascade_logging::debug;
use crate::common::error::{EngineError, Result};
use crate::exec::batch::Batch;
use crate::exec::grouper::Grouper;
use crate::runtime::fanin::FanInCounter;

use super::{ExecNode, NodeBase, NodeCtx, NodeId};

pub struct HashJoinNodeOptions {
    /// Key columns in the probe (first) input.
    pub left_keys: Vec<usize>,
    /// Key columns in the build (second) input.
    pub right_keys: Vec<usize>,
}

struct BuildSide {
    batch: Batch,
    grouper: Grouper,
    // Group id to row indices within `batch`.
    rows_per_group: Vec<Vec<u32>>,
}

struct ProbeState {
    pending: Vec<Batch>,
    ready: bool,
}

/// Two-input node producing `[left columns..., right columns...]` for
/// every key match. Non-matching probe rows are dropped (inner join).
pub struct HashJoinNode {
    base: NodeBase,
    left_keys: Vec<usize>,
    right_keys: Vec<usize>,
    right_schema: SchemaRef,
    build_batches: Mutex<Vec<Batch>>,
    build: OnceLock<BuildSide>,
    probe_state: Mutex<ProbeState>,
    build_fanin: FanInCounter,
    probe_fanin: FanInCounter,
    probe_done: AtomicBool,
    emitted: AtomicUsize,
    finish_claimed: AtomicBool,
}

impl HashJoinNode {
    pub(crate) fn try_new(
        ctx: NodeCtx,
        options: HashJoinNodeOptions,
    ) -> Result<Arc<dyn ExecNode>> {
        if ctx.inputs.len() != 2 {
            return Err(EngineError::invalid_argument(
                "hash join node takes exactly two inputs",
            ));
        }
        if options.left_keys.is_empty() || options.left_keys.len() != options.right_keys.len() {
            return Err(EngineError::invalid_argument(format!(
                "hash join got {} probe keys and {} build keys",
                options.left_keys.len(),
                options.right_keys.len()
            )));
        }
        let left_schema = ctx.input_schemas[0].clone();
        let right_schema = ctx.input_schemas[1].clone();
        for (left, right) in options.left_keys.iter().zip(&options.right_keys) {
            let left_field = left_schema.fields().get(*left).ok_or_else(|| {
                EngineError::invalid_argument(format!(
                    "probe key column {left} out of bounds"
                ))
            })?;
            let right_field = right_schema.fields().get(*right).ok_or_else(|| {
                EngineError::invalid_argument(format!(
                    "build key column {right} out of bounds"
                ))
            })?;
            if left_field.data_type() != right_field.data_type() {
                return Err(EngineError::invalid_argument(format!(
                    "join key type mismatch: {} vs {}",
                    left_field.data_type(),
                    right_field.data_type()
                )));
            }
        }
        let fields: Vec<_> = left_schema
            .fields()
            .iter()
            .chain(right_schema.fields().iter())
            .map(|f| f.as_ref().clone())
            .collect();
        let schema: SchemaRef = Arc::new(Schema::new(fields));
        let base = NodeBase::new(&ctx, "hash_join", schema);
        Ok(Arc::new(Self {
            base,
            left_keys: options.left_keys,
            right_keys: options.right_keys,
            right_schema,
            build_batches: Mutex::new(Vec::new()),
            build: OnceLock::new(),
            probe_state: Mutex::new(ProbeState {
                pending: Vec::new(),
                ready: false,
            }),
            build_fanin: FanInCounter::new(),
            probe_fanin: FanInCounter::new(),
            probe_done: AtomicBool::new(false),
            emitted: AtomicUsize::new(0),
            finish_claimed: AtomicBool::new(false),
        }))
    }

    fn probe_input(&self) -> NodeId {
        self.base.inputs()[0]
    }

    /// Index the buffered build side. Runs exactly once, from the
    /// build-side fan-in winner; no build batch can still be in flight.
    fn build_table(&self) -> Result<()> {
        let batches = std::mem::take(&mut *self.build_batches.lock().expect("join build lock"));
        let combined = if batches.is_empty() {
            Batch::new(RecordBatch::new_empty(self.right_schema.clone()))
        } else {
            Batch::concat(&self.right_schema, &batches)?
        };
        let key_types: Vec<_> = self
            .right_keys
            .iter()
            .map(|key| self.right_schema.field(*key).data_type().clone())
            .collect();
        let mut grouper = Grouper::new(&key_types)?;
        let mut rows_per_group: Vec<Vec<u32>> = Vec::new();
        if !combined.is_empty() {
            let key_columns: Vec<ArrayRef> = self
                .right_keys
                .iter()
                .map(|key| combined.column(*key).clone())
                .collect();
            let group_ids = grouper.consume(&key_columns)?;
            rows_per_group.resize(grouper.num_groups(), Vec::new());
            for (row, group) in group_ids.iter().enumerate() {
                rows_per_group[*group as usize].push(row as u32);
            }
        }
        debug!(
            "hash join node {} built {} groups over {} rows",
            self.base.id(),
            grouper.num_groups(),
            combined.len()
        );
        let side = BuildSide {
            batch: combined,
            grouper,
            rows_per_group,
        };
        if self.build.set(side).is_err() {
            return Err(EngineError::execution("join build table built twice"));
        }
        // Flush probes parked while the table was under construction.
        // New arrivals keep parking until the backlog is empty; `ready`
        // is published only once every parked batch has been pushed, so
        // `maybe_finish` cannot claim completion with flushed output
        // still in flight.
        loop {
            let pending = {
                let mut state = self.probe_state.lock().expect("join probe lock");
                if state.pending.is_empty() {
                    state.ready = true;
                    return Ok(());
                }
                std::mem::take(&mut state.pending)
            };
            for batch in &pending {
                self.probe_batch(batch)?;
            }
        }
    }

    fn probe_batch(&self, batch: &Batch) -> Result<()> {
        let build = self
            .build
            .get()
            .ok_or_else(|| EngineError::execution("join probed before build completed"))?;
        let key_columns: Vec<ArrayRef> = self
            .left_keys
            .iter()
            .map(|key| batch.column(*key).clone())
            .collect();
        let matches = build.grouper.probe(&key_columns)?;
        let mut probe_rows: Vec<u32> = Vec::new();
        let mut build_rows: Vec<u32> = Vec::new();
        for (row, group) in matches.iter().enumerate() {
            let Some(group) = group else { continue };
            for build_row in &build.rows_per_group[*group as usize] {
                probe_rows.push(row as u32);
                build_rows.push(*build_row);
            }
        }
        if probe_rows.is_empty() {
            return Ok(());
        }
        let probe_indices = UInt32Array::from(probe_rows);
        let build_indices = UInt32Array::from(build_rows);
        let mut columns: Vec<ArrayRef> =
            Vec::with_capacity(batch.num_columns() + build.batch.num_columns());
        for column in batch.columns() {
            columns.push(take(column.as_ref(), &probe_indices, None)?);
        }
        for column in build.batch.columns() {
            columns.push(take(column.as_ref(), &build_indices, None)?);
        }
        let joined = RecordBatch::try_new(self.base.schema(), columns)?;
        self.emitted.fetch_add(1, Ordering::AcqRel);
        self.base.push_batch(Batch::new(joined));
        Ok(())
    }

    fn maybe_finish(&self) {
        let ready = self.probe_state.lock().expect("join probe lock").ready;
        if !(ready && self.probe_done.load(Ordering::Acquire)) {
            return;
        }
        if self.finish_claimed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.base.push_finished(self.emitted.load(Ordering::Acquire));
        self.base.finish(Ok(()));
    }

    fn fail(&self, error: EngineError) {
        self.build_fanin.cancel();
        self.probe_fanin.cancel();
        self.finish_claimed.store(true, Ordering::Release);
        self.base.push_error(error.clone());
        self.base.finish(Err(error));
        self.base.stop_inputs();
    }
}

impl ExecNode for HashJoinNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn kind(&self) -> &'static str {
        "hash_join"
    }

    fn input_received(&self, input: NodeId, batch: Batch) {
        if self.base.is_stopped() {
            return;
        }
        if input == self.probe_input() {
            let parked = {
                let mut state = self.probe_state.lock().expect("join probe lock");
                if state.ready {
                    false
                } else {
                    state.pending.push(batch.clone());
                    true
                }
            };
            if !parked {
                if let Err(err) = self.probe_batch(&batch) {
                    self.fail(err);
                    return;
                }
            }
            if self.probe_fanin.increment() {
                self.probe_done.store(true, Ordering::Release);
                self.maybe_finish();
            }
        } else {
            self.build_batches
                .lock()
                .expect("join build lock")
                .push(batch);
            if self.build_fanin.increment() {
                match self.build_table() {
                    Ok(()) => self.maybe_finish(),
                    Err(err) => self.fail(err),
                }
            }
        }
    }

    fn error_received(&self, _input: NodeId, error: EngineError) {
        self.fail(error);
    }

    fn input_finished(&self, input: NodeId, total_batches: usize) {
        if input == self.probe_input() {
            if self.probe_fanin.set_total(total_batches) {
                self.probe_done.store(true, Ordering::Release);
                self.maybe_finish();
            }
        } else if self.build_fanin.set_total(total_batches) {
            match self.build_table() {
                Ok(()) => self.maybe_finish(),
                Err(err) => self.fail(err),
            }
        }
    }

    fn start_producing(&self) -> Result<()> {
        self.base.mark_started()
    }

    fn stop_producing(&self) {
        if !self.base.begin_stop() {
            return;
        }
        self.build_fanin.cancel();
        self.probe_fanin.cancel();
        self.finish_claimed.store(true, Ordering::Release);
        self.base.finish(Ok(()));
        self.base.stop_inputs();
    }
}
