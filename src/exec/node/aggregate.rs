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
//! Aggregation nodes: ungrouped (scalar) and grouped (hash) variants.
//!
//! Responsibilities:
//! - Shards accumulation state per worker-thread slot so concurrent
//!   batch delivery never contends on one lock, merging the slots in
//!   ascending order exactly once on fan-in completion.
//! - Emits scalar aggregation as one row; grouped aggregation chunked
//!   by the configured output chunk size, with the chunk count announced
//!   downstream before any chunk is pushed.
//!
//! Key exported interfaces:
//! - Types: `Aggregate`, `AggregateNodeOptions`, `ScalarAggregateNode`,
//!   `GroupByNode`.

use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::cascade_logging::debug;
use crate::common::config;
use crate::common::error::{EngineError, Result};
use crate::exec::batch::Batch;
use crate::exec::grouper::Grouper;
use crate::exec::kernel::{
    aggregate_output_type, lookup_hash_kernel, lookup_scalar_kernel, HashAggKernel,
    ScalarAggKernel,
};
use crate::runtime::fanin::FanInCounter;
use crate::runtime::thread_indexer::ThreadIndexer;

use super::{ExecNode, NodeBase, NodeCtx, NodeId};

/// One requested aggregate column.
#[derive(Clone)]
pub struct Aggregate {
    pub function: String,
    pub target: usize,
    pub output_name: String,
}

pub struct AggregateNodeOptions {
    pub aggregates: Vec<Aggregate>,
    /// Grouping-key column indices; empty selects the scalar variant.
    pub keys: Vec<usize>,
}

struct AggSpec {
    function: String,
    target: usize,
    input_type: DataType,
}

fn resolve_specs(
    aggregates: &[Aggregate],
    input_schema: &SchemaRef,
) -> Result<Vec<AggSpec>> {
    if aggregates.is_empty() {
        return Err(EngineError::invalid_argument(
            "aggregate node requires at least one aggregate",
        ));
    }
    let mut specs = Vec::with_capacity(aggregates.len());
    for aggregate in aggregates {
        let field = input_schema.fields().get(aggregate.target).ok_or_else(|| {
            EngineError::invalid_argument(format!(
                "aggregate target column {} out of bounds for schema with {} fields",
                aggregate.target,
                input_schema.fields().len()
            ))
        })?;
        specs.push(AggSpec {
            function: aggregate.function.clone(),
            target: aggregate.target,
            input_type: field.data_type().clone(),
        });
    }
    Ok(specs)
}

/// Dispatch to the scalar or grouped variant on key count.
pub(crate) fn try_new(ctx: NodeCtx, options: AggregateNodeOptions) -> Result<Arc<dyn ExecNode>> {
    if ctx.inputs.len() != 1 {
        return Err(EngineError::invalid_argument(
            "aggregate node takes exactly one input",
        ));
    }
    if options.keys.is_empty() {
        ScalarAggregateNode::try_new(ctx, options)
    } else {
        GroupByNode::try_new(ctx, options)
    }
}

fn state_capacity(ctx: &NodeCtx) -> usize {
    ctx.plan
        .upgrade()
        .map(|plan| plan.executor().capacity())
        .unwrap_or(1)
        .max(1)
}

// ---------------------------------------------------------------------------
// scalar variant

/// Zero-key aggregation: per-slot kernel states fed in parallel, merged
/// ascending on exhaustion, finalized into exactly one output row.
pub struct ScalarAggregateNode {
    base: NodeBase,
    specs: Vec<AggSpec>,
    indexer: ThreadIndexer,
    // Lazily initialized per slot; a slot untouched by any thread stays
    // `None` and is skipped by the merge.
    states: Vec<Mutex<Option<Vec<Box<dyn ScalarAggKernel>>>>>,
    fanin: FanInCounter,
}

impl ScalarAggregateNode {
    fn try_new(ctx: NodeCtx, options: AggregateNodeOptions) -> Result<Arc<dyn ExecNode>> {
        let input_schema = ctx.input_schemas[0].clone();
        let specs = resolve_specs(&options.aggregates, &input_schema)?;
        let mut fields = Vec::with_capacity(specs.len());
        for (spec, aggregate) in specs.iter().zip(&options.aggregates) {
            // Also validates the function/type pair supports scalar
            // execution before the node enters the plan.
            lookup_scalar_kernel(&spec.function, &spec.input_type)?;
            let output_type = aggregate_output_type(&spec.function, &spec.input_type)?;
            fields.push(Field::new(&aggregate.output_name, output_type, true));
        }
        let schema: SchemaRef = Arc::new(Schema::new(fields));
        let capacity = state_capacity(&ctx);
        let base = NodeBase::new(&ctx, "scalar_aggregate", schema);
        Ok(Arc::new(Self {
            base,
            specs,
            indexer: ThreadIndexer::new(capacity),
            states: (0..capacity).map(|_| Mutex::new(None)).collect(),
            fanin: FanInCounter::new(),
        }))
    }

    fn make_kernels(&self) -> Result<Vec<Box<dyn ScalarAggKernel>>> {
        self.specs
            .iter()
            .map(|spec| lookup_scalar_kernel(&spec.function, &spec.input_type))
            .collect()
    }

    fn consume(&self, batch: &Batch) -> Result<()> {
        let slot = self.indexer.slot();
        let mut state = self.states[slot].lock().expect("aggregate slot lock");
        if state.is_none() {
            *state = Some(self.make_kernels()?);
        }
        let kernels = state.as_mut().expect("slot state initialized");
        for (spec, kernel) in self.specs.iter().zip(kernels.iter_mut()) {
            kernel.consume(batch.column(spec.target))?;
        }
        Ok(())
    }

    /// Merge every slot in ascending order, finalize, emit the one row.
    /// Reached exactly once through the fan-in counter.
    fn finalize(&self) {
        let result = self.finalize_inner();
        match result {
            Ok(batch) => {
                self.base.push_batch(batch);
                self.base.push_finished(1);
                self.base.finish(Ok(()));
            }
            Err(err) => self.fail(err),
        }
    }

    fn finalize_inner(&self) -> Result<Batch> {
        let mut merged: Option<Vec<Box<dyn ScalarAggKernel>>> = None;
        for slot in &self.states {
            let taken = slot.lock().expect("aggregate slot lock").take();
            let Some(state) = taken else { continue };
            match merged.as_mut() {
                None => merged = Some(state),
                Some(accumulator) => {
                    for (kernel, other) in accumulator.iter_mut().zip(state) {
                        kernel.merge(other)?;
                    }
                }
            }
        }
        // No batch arrived at all: fresh kernels produce the empty-input
        // results (null sums, zero counts).
        let mut kernels = match merged {
            Some(kernels) => kernels,
            None => self.make_kernels()?,
        };
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(kernels.len());
        for kernel in &mut kernels {
            columns.push(kernel.finalize()?.to_array(1));
        }
        let batch = RecordBatch::try_new(self.base.schema(), columns)?;
        Ok(Batch::new(batch))
    }

    fn fail(&self, error: EngineError) {
        self.fanin.cancel();
        self.base.push_error(error.clone());
        self.base.finish(Err(error));
        self.base.stop_inputs();
    }
}

impl ExecNode for ScalarAggregateNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn kind(&self) -> &'static str {
        "scalar_aggregate"
    }

    fn input_received(&self, _input: NodeId, batch: Batch) {
        if self.base.is_stopped() {
            return;
        }
        if let Err(err) = self.consume(&batch) {
            self.fail(err);
            return;
        }
        if self.fanin.increment() {
            self.finalize();
        }
    }

    fn error_received(&self, _input: NodeId, error: EngineError) {
        self.fail(error);
    }

    fn input_finished(&self, _input: NodeId, total_batches: usize) {
        if self.fanin.set_total(total_batches) {
            self.finalize();
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

// ---------------------------------------------------------------------------
// grouped variant

struct SlotState {
    grouper: Grouper,
    kernels: Vec<Box<dyn HashAggKernel>>,
}

/// Keyed aggregation: per-slot grouper plus hash-kernel states; the
/// merge transposes every other slot's group ids into the accumulating
/// slot's id space. Output columns are aggregates first, then keys.
pub struct GroupByNode {
    base: NodeBase,
    specs: Vec<AggSpec>,
    keys: Vec<usize>,
    key_types: Vec<DataType>,
    indexer: ThreadIndexer,
    states: Vec<Mutex<Option<SlotState>>>,
    fanin: FanInCounter,
    chunk_rows: usize,
}

impl GroupByNode {
    fn try_new(ctx: NodeCtx, options: AggregateNodeOptions) -> Result<Arc<dyn ExecNode>> {
        let input_schema = ctx.input_schemas[0].clone();
        let specs = resolve_specs(&options.aggregates, &input_schema)?;
        let mut fields = Vec::with_capacity(specs.len() + options.keys.len());
        for (spec, aggregate) in specs.iter().zip(&options.aggregates) {
            lookup_hash_kernel(&spec.function, &spec.input_type)?;
            let output_type = aggregate_output_type(&spec.function, &spec.input_type)?;
            fields.push(Field::new(&aggregate.output_name, output_type, true));
        }
        let mut key_types = Vec::with_capacity(options.keys.len());
        for key in &options.keys {
            let field = input_schema.fields().get(*key).ok_or_else(|| {
                EngineError::invalid_argument(format!(
                    "grouping key column {} out of bounds for schema with {} fields",
                    key,
                    input_schema.fields().len()
                ))
            })?;
            key_types.push(field.data_type().clone());
            fields.push(field.as_ref().clone());
        }
        let schema: SchemaRef = Arc::new(Schema::new(fields));
        let capacity = state_capacity(&ctx);
        let base = NodeBase::new(&ctx, "group_by", schema);
        Ok(Arc::new(Self {
            base,
            specs,
            keys: options.keys,
            key_types,
            indexer: ThreadIndexer::new(capacity),
            states: (0..capacity).map(|_| Mutex::new(None)).collect(),
            fanin: FanInCounter::new(),
            chunk_rows: config::aggregate_output_chunk_rows(),
        }))
    }

    fn make_slot_state(&self) -> Result<SlotState> {
        let kernels = self
            .specs
            .iter()
            .map(|spec| lookup_hash_kernel(&spec.function, &spec.input_type))
            .collect::<Result<Vec<_>>>()?;
        Ok(SlotState {
            grouper: Grouper::new(&self.key_types)?,
            kernels,
        })
    }

    fn consume(&self, batch: &Batch) -> Result<()> {
        let slot = self.indexer.slot();
        let mut state = self.states[slot].lock().expect("group-by slot lock");
        if state.is_none() {
            *state = Some(self.make_slot_state()?);
        }
        let state = state.as_mut().expect("slot state initialized");
        let key_columns: Vec<ArrayRef> = self
            .keys
            .iter()
            .map(|key| batch.column(*key).clone())
            .collect();
        let group_ids = state.grouper.consume(&key_columns)?;
        let num_groups = state.grouper.num_groups();
        for (spec, kernel) in self.specs.iter().zip(state.kernels.iter_mut()) {
            kernel.resize(num_groups);
            kernel.consume(batch.column(spec.target), &group_ids)?;
        }
        Ok(())
    }

    /// Merge every slot into the first non-empty one in ascending slot
    /// order, finalize, and emit the groups in fixed-size chunks. The
    /// chunk count is announced downstream before any chunk is pushed so
    /// a downstream fan-in counter never undercounts.
    fn finalize(&self) {
        match self.finalize_inner() {
            Ok(None) => {
                self.base.push_finished(0);
                self.base.finish(Ok(()));
            }
            Ok(Some(batch)) => {
                let chunks = batch.slice_chunks(self.chunk_rows);
                debug!(
                    "group-by node {} emitting {} rows in {} chunks",
                    self.base.id(),
                    batch.len(),
                    chunks.len()
                );
                self.base.push_finished(chunks.len());
                for chunk in chunks {
                    // A stop arriving mid-emission skips the rest.
                    if self.base.is_stopped() {
                        break;
                    }
                    self.base.push_batch(chunk);
                }
                self.base.finish(Ok(()));
            }
            Err(err) => self.fail(err),
        }
    }

    fn finalize_inner(&self) -> Result<Option<Batch>> {
        let mut merged: Option<SlotState> = None;
        for slot in &self.states {
            let taken = slot.lock().expect("group-by slot lock").take();
            let Some(state) = taken else { continue };
            match merged.as_mut() {
                None => merged = Some(state),
                Some(accumulator) => {
                    let foreign_keys = state.grouper.key_columns()?;
                    let transposition = accumulator.grouper.consume(&foreign_keys)?;
                    let num_groups = accumulator.grouper.num_groups();
                    for (kernel, other) in
                        accumulator.kernels.iter_mut().zip(state.kernels)
                    {
                        kernel.resize(num_groups);
                        kernel.merge(other, &transposition)?;
                    }
                }
            }
        }
        let Some(mut state) = merged else {
            return Ok(None);
        };
        if state.grouper.is_empty() {
            return Ok(None);
        }
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.specs.len() + self.keys.len());
        for kernel in &mut state.kernels {
            columns.push(kernel.finalize()?);
        }
        columns.extend(state.grouper.key_columns()?);
        let batch = RecordBatch::try_new(self.base.schema(), columns)?;
        Ok(Some(Batch::new(batch)))
    }

    fn fail(&self, error: EngineError) {
        self.fanin.cancel();
        self.base.push_error(error.clone());
        self.base.finish(Err(error));
        self.base.stop_inputs();
    }
}

impl ExecNode for GroupByNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn kind(&self) -> &'static str {
        "group_by"
    }

    fn input_received(&self, _input: NodeId, batch: Batch) {
        if self.base.is_stopped() {
            return;
        }
        if let Err(err) = self.consume(&batch) {
            self.fail(err);
            return;
        }
        if self.fanin.increment() {
            self.finalize();
        }
    }

    fn error_received(&self, _input: NodeId, error: EngineError) {
        self.fail(error);
    }

    fn input_finished(&self, _input: NodeId, total_batches: usize) {
        if self.fanin.set_total(total_batches) {
            self.finalize();
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
