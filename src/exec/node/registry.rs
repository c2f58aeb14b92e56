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
//! Factory registry mapping node kind names to constructors.
//!
//! Built-in factories are installed on first use; additional node kinds
//! can be registered at startup before any plan is built.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::common::error::{EngineError, Result};

use super::aggregate::{self, AggregateNodeOptions};
use super::filter::{FilterNode, FilterNodeOptions};
use super::hash_join::{HashJoinNode, HashJoinNodeOptions};
use super::order_by::{OrderByNode, OrderByNodeOptions};
use super::project::{ProjectNode, ProjectNodeOptions};
use super::sink::{ConsumingSinkNode, ConsumingSinkNodeOptions, SinkNode, SinkNodeOptions};
use super::source::{SourceNode, SourceNodeOptions};
use super::{ExecNode, NodeCtx};

/// Configuration value object for one node kind, dispatched by the
/// matching factory. A mismatched variant is an invalid-argument error.
pub enum NodeOptions {
    Source(SourceNodeOptions),
    Filter(FilterNodeOptions),
    Project(ProjectNodeOptions),
    Aggregate(AggregateNodeOptions),
    Sink(SinkNodeOptions),
    ConsumingSink(ConsumingSinkNodeOptions),
    OrderBy(OrderByNodeOptions),
    HashJoin(HashJoinNodeOptions),
}

pub type NodeFactory =
    Arc<dyn Fn(NodeCtx, NodeOptions) -> Result<Arc<dyn ExecNode>> + Send + Sync>;

fn mismatch(name: &str) -> EngineError {
    EngineError::invalid_argument(format!("node factory '{name}' got mismatched options"))
}

fn registry() -> &'static Mutex<HashMap<String, NodeFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, NodeFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut table: HashMap<String, NodeFactory> = HashMap::new();
        table.insert(
            "source".to_string(),
            Arc::new(|ctx, options| match options {
                NodeOptions::Source(options) => SourceNode::try_new(ctx, options),
                _ => Err(mismatch("source")),
            }),
        );
        table.insert(
            "filter".to_string(),
            Arc::new(|ctx, options| match options {
                NodeOptions::Filter(options) => FilterNode::try_new(ctx, options),
                _ => Err(mismatch("filter")),
            }),
        );
        table.insert(
            "project".to_string(),
            Arc::new(|ctx, options| match options {
                NodeOptions::Project(options) => ProjectNode::try_new(ctx, options),
                _ => Err(mismatch("project")),
            }),
        );
        table.insert(
            "aggregate".to_string(),
            Arc::new(|ctx, options| match options {
                NodeOptions::Aggregate(options) => aggregate::try_new(ctx, options),
                _ => Err(mismatch("aggregate")),
            }),
        );
        table.insert(
            "sink".to_string(),
            Arc::new(|ctx, options| match options {
                NodeOptions::Sink(options) => SinkNode::try_new(ctx, options),
                _ => Err(mismatch("sink")),
            }),
        );
        table.insert(
            "consuming_sink".to_string(),
            Arc::new(|ctx, options| match options {
                NodeOptions::ConsumingSink(options) => ConsumingSinkNode::try_new(ctx, options),
                _ => Err(mismatch("consuming_sink")),
            }),
        );
        table.insert(
            "order_by".to_string(),
            Arc::new(|ctx, options| match options {
                NodeOptions::OrderBy(options) => OrderByNode::try_new(ctx, options),
                _ => Err(mismatch("order_by")),
            }),
        );
        table.insert(
            "hash_join".to_string(),
            Arc::new(|ctx, options| match options {
                NodeOptions::HashJoin(options) => HashJoinNode::try_new(ctx, options),
                _ => Err(mismatch("hash_join")),
            }),
        );
        Mutex::new(table)
    })
}

/// Install a custom node kind. Fails if the name is already taken.
pub fn register_node_factory(name: impl Into<String>, factory: NodeFactory) -> Result<()> {
    let name = name.into();
    let mut table = registry().lock().expect("node registry lock");
    if table.contains_key(&name) {
        return Err(EngineError::invalid_argument(format!(
            "node factory '{name}' already registered"
        )));
    }
    table.insert(name, factory);
    Ok(())
}

pub(crate) fn make_node(
    name: &str,
    ctx: NodeCtx,
    options: NodeOptions,
) -> Result<Arc<dyn ExecNode>> {
    let factory = registry()
        .lock()
        .expect("node registry lock")
        .get(name)
        .cloned()
        .ok_or_else(|| {
            EngineError::invalid_argument(format!("unknown node factory '{name}'"))
        })?;
    factory(ctx, options)
}
