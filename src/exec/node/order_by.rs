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
//! Order-by node: pipeline breaker producing a globally sorted stream.
//!
//! Buffers the whole input, sorts once on exhaustion, and re-emits in
//! chunks. A row limit turns it into a top-k.

use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, RecordBatch};
use arrow::compute::{lexsort_to_indices, take, SortColumn, SortOptions};

use crate::cascade_logging::debug;
use crate::common::config;
use crate::common::error::{EngineError, Result};
use crate::exec::batch::Batch;
use crate::runtime::fanin::FanInCounter;

use super::{ExecNode, NodeBase, NodeCtx, NodeId};

#[derive(Clone)]
pub struct SortKey {
    pub column: usize,
    pub descending: bool,
}

pub struct OrderByNodeOptions {
    pub sort_keys: Vec<SortKey>,
    /// Keep only the first `limit` rows of the sorted output (top-k).
    pub limit: Option<usize>,
}

/// One-in one-out pipeline breaker. Output schema equals the input
/// schema; only row order (and, with a limit, row count) changes.
pub struct OrderByNode {
    base: NodeBase,
    sort_keys: Vec<SortKey>,
    limit: Option<usize>,
    buffered: Mutex<Vec<Batch>>,
    fanin: FanInCounter,
    chunk_rows: usize,
}

impl OrderByNode {
    pub(crate) fn try_new(
        ctx: NodeCtx,
        options: OrderByNodeOptions,
    ) -> Result<Arc<dyn ExecNode>> {
        if ctx.inputs.len() != 1 {
            return Err(EngineError::invalid_argument(
                "order-by node takes exactly one input",
            ));
        }
        if options.sort_keys.is_empty() {
            return Err(EngineError::invalid_argument(
                "order-by node requires at least one sort key",
            ));
        }
        let input_schema = ctx.input_schemas[0].clone();
        for key in &options.sort_keys {
            if key.column >= input_schema.fields().len() {
                return Err(EngineError::invalid_argument(format!(
                    "sort key column {} out of bounds for schema with {} fields",
                    key.column,
                    input_schema.fields().len()
                )));
            }
        }
        if options.limit == Some(0) {
            return Err(EngineError::invalid_argument(
                "order-by limit must be positive",
            ));
        }
        let base = NodeBase::new(&ctx, "order_by", input_schema);
        Ok(Arc::new(Self {
            base,
            sort_keys: options.sort_keys,
            limit: options.limit,
            buffered: Mutex::new(Vec::new()),
            fanin: FanInCounter::new(),
            chunk_rows: config::aggregate_output_chunk_rows(),
        }))
    }

    fn sort_all(&self) -> Result<Option<Batch>> {
        let buffered = std::mem::take(&mut *self.buffered.lock().expect("order-by buffer lock"));
        let total_rows: usize = buffered.iter().map(Batch::len).sum();
        if total_rows == 0 {
            return Ok(None);
        }
        let schema = self.base.schema();
        let combined = Batch::concat(&schema, &buffered)?;
        let sort_columns: Vec<SortColumn> = self
            .sort_keys
            .iter()
            .map(|key| SortColumn {
                values: combined.column(key.column).clone(),
                options: Some(SortOptions {
                    descending: key.descending,
                    nulls_first: true,
                }),
            })
            .collect();
        let indices = lexsort_to_indices(&sort_columns, self.limit)?;
        let columns: Vec<ArrayRef> = combined
            .columns()
            .iter()
            .map(|column| take(column.as_ref(), &indices, None))
            .collect::<std::result::Result<_, _>>()?;
        let sorted = RecordBatch::try_new(schema, columns)?;
        Ok(Some(Batch::new(sorted)))
    }

    /// Reached exactly once via the fan-in counter.
    fn finalize(&self) {
        match self.sort_all() {
            Ok(None) => {
                self.base.push_finished(0);
                self.base.finish(Ok(()));
            }
            Ok(Some(sorted)) => {
                let chunks = sorted.slice_chunks(self.chunk_rows);
                debug!(
                    "order-by node {} emitting {} sorted rows in {} chunks",
                    self.base.id(),
                    sorted.len(),
                    chunks.len()
                );
                self.base.push_finished(chunks.len());
                for chunk in chunks {
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

    fn fail(&self, error: EngineError) {
        self.fanin.cancel();
        self.base.push_error(error.clone());
        self.base.finish(Err(error));
        self.base.stop_inputs();
    }
}

impl ExecNode for OrderByNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn kind(&self) -> &'static str {
        "order_by"
    }

    fn input_received(&self, _input: NodeId, batch: Batch) {
        if self.base.is_stopped() {
            return;
        }
        self.buffered
            .lock()
            .expect("order-by buffer lock")
            .push(batch);
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
        self.buffered.lock().expect("order-by buffer lock").clear();
        self.base.finish(Ok(()));
        self.base.stop_inputs();
    }
}
