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
//! Engine error taxonomy.
//!
//! Responsibilities:
//! - Defines the error categories surfaced by plan construction, kernel
//!   dispatch, runtime execution, and the task scheduler.
//! - Provides the crate-wide `Result` alias.
//!
//! Key exported interfaces:
//! - Types: `EngineError`, `Result`.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the execution engine.
///
/// Construction-time validation and kernel dispatch failures are
/// distinct from runtime execution failures: the former fail the node
/// factory call synchronously before any node enters the plan, the
/// latter propagate through the push chain and fail `finished()`
/// futures.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Schema/field-reference mismatch, wrong options type, or other
    /// invalid plan construction input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No kernel matches the requested function/type combination.
    #[error("no kernel matches {function}({input_type})")]
    KernelDispatch { function: String, input_type: String },

    /// Runtime failure raised by a kernel or an upstream node.
    #[error("execution error: {0}")]
    Execution(String),

    /// Scheduler misuse, e.g. spawning a task after shutdown.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Cooperative stop observed where a value was expected.
    #[error("cancelled")]
    Cancelled,

    /// Arrow kernel failure.
    #[error("arrow error: {0}")]
    Arrow(String),
}

impl EngineError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        EngineError::Execution(msg.into())
    }

    pub fn kernel_dispatch(
        function: impl Into<String>,
        input_type: &arrow::datatypes::DataType,
    ) -> Self {
        EngineError::KernelDispatch {
            function: function.into(),
            input_type: format!("{input_type}"),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

impl From<arrow::error::ArrowError> for EngineError {
    fn from(err: arrow::error::ArrowError) -> Self {
        EngineError::Arrow(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_dispatch_names_function_and_type() {
        let err = EngineError::kernel_dispatch("sum", &arrow::datatypes::DataType::Utf8);
        assert_eq!(err.to_string(), "no kernel matches sum(Utf8)");
    }
}
