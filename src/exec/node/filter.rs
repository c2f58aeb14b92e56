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
//! Filter node: row selection by a boolean predicate expression.

use std::sync::Arc;

use arrow::array::BooleanArray;
use arrow::compute::filter_record_batch;
use arrow::datatypes::DataType;

use crate::common::error::{EngineError, Result};
use crate::exec::batch::Batch;
use crate::exec::expr::Expr;
use crate::runtime::fanin::FanInCounter;

use super::{ExecNode, NodeBase, NodeCtx, NodeId};

pub struct FilterNodeOptions {
    pub predicate: Expr,
}

/// One-in one-out node keeping the rows where the predicate is true.
///
/// Emits exactly one output batch per input batch (possibly empty), so
/// the upstream batch count forwards unchanged.
pub struct FilterNode {
    base: NodeBase,
    predicate: Expr,
    fanin: FanInCounter,
}

impl FilterNode {
    pub(crate) fn try_new(
        ctx: NodeCtx,
        options: FilterNodeOptions,
    ) -> Result<Arc<dyn ExecNode>> {
        if ctx.inputs.len() != 1 {
            return Err(EngineError::invalid_argument(
                "filter node takes exactly one input",
            ));
        }
        let input_schema = ctx.input_schemas[0].clone();
        let predicate_type = options.predicate.data_type(&input_schema)?;
        if predicate_type != DataType::Boolean {
            return Err(EngineError::invalid_argument(format!(
                "filter predicate must be boolean, got {predicate_type}"
            )));
        }
        let base = NodeBase::new(&ctx, "filter", input_schema);
        Ok(Arc::new(Self {
            base,
            predicate: options.predicate,
            fanin: FanInCounter::new(),
        }))
    }

    fn apply(&self, batch: &Batch) -> Result<Batch> {
        let mask = self.predicate.eval(batch)?;
        let mask = mask
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| EngineError::execution("filter predicate produced a non-boolean"))?;
        let filtered = filter_record_batch(batch.record_batch(), mask)?;
        Ok(Batch::new(filtered))
    }

    fn fail(&self, error: EngineError) {
        self.fanin.cancel();
        self.base.push_error(error.clone());
        self.base.finish(Err(error));
        self.base.stop_inputs();
    }
}

impl ExecNode for FilterNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn kind(&self) -> &'static str {
        "filter"
    }

    fn input_received(&self, _input: NodeId, batch: Batch) {
        if self.base.is_stopped() {
            return;
        }
        match self.apply(&batch) {
            Ok(filtered) => self.base.push_batch(filtered),
            Err(err) => {
                self.fail(err);
                return;
            }
        }
        if self.fanin.increment() {
            self.base.finish(Ok(()));
        }
    }

    fn error_received(&self, _input: NodeId, error: EngineError) {
        self.fail(error);
    }

    fn input_finished(&self, _input: NodeId, total_batches: usize) {
        self.base.push_finished(total_batches);
        if self.fanin.set_total(total_batches) {
            self.base.finish(Ok(()));
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
