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
//! Project node: per-batch expression evaluation into new columns.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{Field, Schema, SchemaRef};

use crate::common::error::{EngineError, Result};
use crate::exec::batch::Batch;
use crate::exec::expr::Expr;
use crate::runtime::fanin::FanInCounter;

use super::{ExecNode, NodeBase, NodeCtx, NodeId};

pub struct ProjectNodeOptions {
    pub expressions: Vec<Expr>,
    pub output_names: Vec<String>,
}

/// One-in one-out node evaluating a fixed expression list per batch.
/// The output schema is inferred against the input schema at
/// construction and never changes.
pub struct ProjectNode {
    base: NodeBase,
    expressions: Vec<Expr>,
    fanin: FanInCounter,
}

impl ProjectNode {
    pub(crate) fn try_new(
        ctx: NodeCtx,
        options: ProjectNodeOptions,
    ) -> Result<Arc<dyn ExecNode>> {
        if ctx.inputs.len() != 1 {
            return Err(EngineError::invalid_argument(
                "project node takes exactly one input",
            ));
        }
        if options.expressions.is_empty() {
            return Err(EngineError::invalid_argument(
                "project node requires at least one expression",
            ));
        }
        if options.expressions.len() != options.output_names.len() {
            return Err(EngineError::invalid_argument(format!(
                "project node got {} expressions but {} output names",
                options.expressions.len(),
                options.output_names.len()
            )));
        }
        let input_schema = &ctx.input_schemas[0];
        let mut fields = Vec::with_capacity(options.expressions.len());
        for (expr, name) in options.expressions.iter().zip(&options.output_names) {
            let data_type = expr.data_type(input_schema)?;
            fields.push(Field::new(name, data_type, true));
        }
        let schema: SchemaRef = Arc::new(Schema::new(fields));
        let base = NodeBase::new(&ctx, "project", schema);
        Ok(Arc::new(Self {
            base,
            expressions: options.expressions,
            fanin: FanInCounter::new(),
        }))
    }

    fn apply(&self, batch: &Batch) -> Result<Batch> {
        let mut columns = Vec::with_capacity(self.expressions.len());
        for expr in &self.expressions {
            columns.push(expr.eval(batch)?);
        }
        let projected = RecordBatch::try_new(self.base.schema(), columns)?;
        Ok(Batch::new(projected))
    }

    fn fail(&self, error: EngineError) {
        self.fanin.cancel();
        self.base.push_error(error.clone());
        self.base.finish(Err(error));
        self.base.stop_inputs();
    }
}

impl ExecNode for ProjectNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn kind(&self) -> &'static str {
        "project"
    }

    fn input_received(&self, _input: NodeId, batch: Batch) {
        if self.base.is_stopped() {
            return;
        }
        match self.apply(&batch) {
            Ok(projected) => self.base.push_batch(projected),
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
