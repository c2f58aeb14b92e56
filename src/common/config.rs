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
//! Typed accessors over the application config with hard-coded fallbacks.
//!
//! Every accessor tolerates a missing config file so the engine runs as a
//! plain library with defaults.

use crate::cascade_config::config as cascade_app_config;

pub(crate) fn default_worker_threads() -> usize {
    let configured = cascade_app_config()
        .ok()
        .map(|c| c.runtime.worker_threads)
        .unwrap_or(0);
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub(crate) fn aggregate_output_chunk_rows() -> usize {
    cascade_app_config()
        .ok()
        .map(|c| c.runtime.aggregate_output_chunk_rows)
        .unwrap_or(32 * 1024)
        .max(1)
}

pub(crate) fn sink_high_watermark_bytes() -> usize {
    cascade_app_config()
        .ok()
        .map(|c| c.runtime.sink_high_watermark_bytes)
        .unwrap_or(64 * 1024 * 1024)
}

pub(crate) fn sink_low_watermark_bytes() -> usize {
    cascade_app_config()
        .ok()
        .map(|c| c.runtime.sink_low_watermark_bytes)
        .unwrap_or(16 * 1024 * 1024)
}

pub(crate) fn source_transfer_to_executor() -> bool {
    cascade_app_config()
        .ok()
        .map(|c| c.runtime.source_transfer_to_executor)
        .unwrap_or(true)
}
