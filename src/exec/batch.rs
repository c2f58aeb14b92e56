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
//! Columnar batch flowing through the plan.
//!
//! Responsibilities:
//! - Wraps an arrow `RecordBatch` as the immutable unit of dataflow;
//!   transformation always constructs a new batch.
//!
//! Key exported interfaces:
//! - Types: `Batch`.

use arrow::array::{ArrayRef, RecordBatch};
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;

use crate::common::error::Result;

/// A batch of rows: equal-length columnar arrays plus a row count.
///
/// Batches flow by value along the push chain; a node never mutates a
/// batch it did not construct. Cloning shares the underlying arrays.
#[derive(Debug, Clone)]
pub struct Batch {
    batch: RecordBatch,
}

impl Batch {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn column(&self, index: usize) -> &ArrayRef {
        self.batch.column(index)
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_record_batch(self) -> RecordBatch {
        self.batch
    }

    /// Zero-copy row-range view.
    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
        }
    }

    /// Split into batches of at most `max_rows` rows each.
    pub fn slice_chunks(&self, max_rows: usize) -> Vec<Batch> {
        let max_rows = max_rows.max(1);
        let total = self.len();
        if total <= max_rows {
            return vec![self.clone()];
        }
        let mut chunks = Vec::with_capacity(total.div_ceil(max_rows));
        let mut offset = 0;
        while offset < total {
            let length = max_rows.min(total - offset);
            chunks.push(self.slice(offset, length));
            offset += length;
        }
        chunks
    }

    /// Buffer-size estimate used for backpressure accounting.
    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }

    /// Concatenate same-schema batches into one.
    pub fn concat(schema: &SchemaRef, batches: &[Batch]) -> Result<Batch> {
        let record_batches: Vec<&RecordBatch> = batches.iter().map(|b| &b.batch).collect();
        let combined = concat_batches(schema, record_batches)?;
        Ok(Batch::new(combined))
    }
}

impl From<RecordBatch> for Batch {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}
