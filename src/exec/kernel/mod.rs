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
//! Aggregate kernel contracts and the process-wide kernel registry.
//!
//! Responsibilities:
//! - Defines the incremental consume/merge/finalize contracts consumed
//!   by the aggregation nodes, for both ungrouped (scalar) and grouped
//!   (hash) execution.
//! - Resolves `(function name, input type)` to a concrete kernel
//!   instance through a read-only-after-init lookup table.
//!
//! Key exported interfaces:
//! - Types: `ScalarAggKernel`, `HashAggKernel`, `KernelEntry`.
//! - Functions: `lookup_scalar_kernel`, `lookup_hash_kernel`,
//!   `aggregate_output_type`.

pub mod functions;

use std::any::Any;
use std::collections::HashMap;
use std::sync::OnceLock;

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;

use crate::common::error::{EngineError, Result};
use crate::exec::expr::ScalarValue;

/// Incremental state of one ungrouped aggregate function.
///
/// One instance exists per worker-thread slot; `consume` is serial
/// within a slot, `merge` folds another slot's state in (ascending slot
/// order), `finalize` runs once on the merged state.
pub trait ScalarAggKernel: Send {
    fn consume(&mut self, values: &ArrayRef) -> Result<()>;
    fn merge(&mut self, other: Box<dyn ScalarAggKernel>) -> Result<()>;
    fn finalize(&mut self) -> Result<ScalarValue>;
    fn output_type(&self) -> DataType;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Incremental per-group state of one grouped aggregate function.
///
/// `resize` grows the per-group slots to the owning grouper's current
/// group count before each consume; `merge` remaps the other state's
/// group ids through `transposition` while folding it in.
pub trait HashAggKernel: Send {
    fn resize(&mut self, num_groups: usize);
    fn consume(&mut self, values: &ArrayRef, group_ids: &[u32]) -> Result<()>;
    fn merge(&mut self, other: Box<dyn HashAggKernel>, transposition: &[u32]) -> Result<()>;
    fn finalize(&mut self) -> Result<ArrayRef>;
    fn output_type(&self) -> DataType;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl std::fmt::Debug for dyn ScalarAggKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScalarAggKernel")
    }
}

type ScalarCtor = fn(&DataType) -> Result<Box<dyn ScalarAggKernel>>;
type HashCtor = fn(&DataType) -> Result<Box<dyn HashAggKernel>>;
type OutputTypeFn = fn(&DataType) -> Result<DataType>;

/// One registered aggregate function. A function missing one of the two
/// constructors does not support that execution kind.
pub struct KernelEntry {
    make_scalar: Option<ScalarCtor>,
    make_hash: Option<HashCtor>,
    output_type: OutputTypeFn,
}

fn registry() -> &'static HashMap<&'static str, KernelEntry> {
    static REGISTRY: OnceLock<HashMap<&'static str, KernelEntry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut table = HashMap::new();
        table.insert(
            "sum",
            KernelEntry {
                make_scalar: Some(functions::make_scalar_sum),
                make_hash: Some(functions::make_hash_sum),
                output_type: functions::numeric_identity_type,
            },
        );
        table.insert(
            "count",
            KernelEntry {
                make_scalar: Some(functions::make_scalar_count),
                make_hash: Some(functions::make_hash_count),
                output_type: functions::count_output_type,
            },
        );
        table.insert(
            "min",
            KernelEntry {
                make_scalar: Some(functions::make_scalar_min),
                make_hash: Some(functions::make_hash_min),
                output_type: functions::numeric_identity_type,
            },
        );
        table.insert(
            "max",
            KernelEntry {
                make_scalar: Some(functions::make_scalar_max),
                make_hash: Some(functions::make_hash_max),
                output_type: functions::numeric_identity_type,
            },
        );
        table.insert(
            "mean",
            KernelEntry {
                make_scalar: Some(functions::make_scalar_mean),
                make_hash: Some(functions::make_hash_mean),
                output_type: functions::mean_output_type,
            },
        );
        table
    })
}

fn entry(function: &str) -> Result<&'static KernelEntry> {
    registry().get(function).ok_or_else(|| EngineError::KernelDispatch {
        function: function.to_string(),
        input_type: "*".to_string(),
    })
}

/// Resolve a scalar-aggregate kernel. Fails with an invalid-argument
/// error when the function exists only as a hash aggregate, and with a
/// kernel-dispatch error when the function or input type is unknown.
pub fn lookup_scalar_kernel(function: &str, input_type: &DataType) -> Result<Box<dyn ScalarAggKernel>> {
    let entry = entry(function)?;
    let ctor = entry.make_scalar.ok_or_else(|| {
        EngineError::invalid_argument(format!(
            "aggregate function '{function}' is not a scalar aggregate"
        ))
    })?;
    ctor(input_type)
}

/// Resolve a hash-aggregate kernel for grouped execution.
pub fn lookup_hash_kernel(function: &str, input_type: &DataType) -> Result<Box<dyn HashAggKernel>> {
    let entry = entry(function)?;
    let ctor = entry.make_hash.ok_or_else(|| {
        EngineError::invalid_argument(format!(
            "aggregate function '{function}' is not a hash aggregate"
        ))
    })?;
    ctor(input_type)
}

/// Output type of an aggregate, for node schema construction.
pub fn aggregate_output_type(function: &str, input_type: &DataType) -> Result<DataType> {
    (entry(function)?.output_type)(input_type)
}
