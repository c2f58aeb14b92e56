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
//! cascade: a push-based streaming columnar execution engine.
//!
//! A declarative plan of relational operators (source, filter, project,
//! aggregate, join, sink) is turned into a running pipeline that pushes
//! arrow record batches downstream with backpressure, cooperative
//! cancellation, and multi-threaded fan-out.

pub mod common;
pub mod exec;
pub mod runtime;

// Folder layout mirrors the engine split, with `cascade_*` convenience aliases.
pub use common::app_config as cascade_config;
pub use common::error::{EngineError, Result};
pub use common::logging as cascade_logging;

pub use exec::batch::Batch;
pub use exec::plan::{ExecContext, ExecPlan};
pub use runtime::thread_pool::{default_thread_pool, Executor, SerialExecutor, ThreadPool};
