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
//! Application configuration loaded from a TOML file.
//!
//! Responsibilities:
//! - Loads and caches the engine config from `$CASCADE_CONFIG` or
//!   `./cascade.toml`, once per process.
//! - Provides serde defaults for every field so partial files work.
//!
//! Key exported interfaces:
//! - Types: `CascadeConfig`, `RuntimeConfig`.
//! - Functions: `config`, `init_from_path`, `init_from_env_or_default`.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<CascadeConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static CascadeConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = CascadeConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static CascadeConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = CascadeConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static CascadeConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("CASCADE_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("cascade.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $CASCADE_CONFIG or create ./cascade.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct CascadeConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads in the process-wide default pool. Zero means
    /// "use available parallelism".
    #[serde(default)]
    pub worker_threads: usize,

    #[serde(default = "default_aggregate_output_chunk_rows")]
    pub aggregate_output_chunk_rows: usize,

    #[serde(default = "default_sink_high_watermark_bytes")]
    pub sink_high_watermark_bytes: usize,

    #[serde(default = "default_sink_low_watermark_bytes")]
    pub sink_low_watermark_bytes: usize,

    /// When false, a source pushes batches inline even if the plan
    /// context carries an executor.
    #[serde(default = "default_true")]
    pub source_transfer_to_executor: bool,
}

fn default_aggregate_output_chunk_rows() -> usize {
    32 * 1024
}

fn default_sink_high_watermark_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_sink_low_watermark_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            aggregate_output_chunk_rows: default_aggregate_output_chunk_rows(),
            sink_high_watermark_bytes: default_sink_high_watermark_bytes(),
            sink_low_watermark_bytes: default_sink_low_watermark_bytes(),
            source_transfer_to_executor: true,
        }
    }
}

impl CascadeConfig {
    fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: CascadeConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> String {
        match &self.log_filter {
            Some(filter) if !filter.trim().is_empty() => filter.clone(),
            _ => self.log_level.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_uses_field_defaults() {
        let cfg: CascadeConfig = toml::from_str("log_level = \"debug\"").expect("parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(
            cfg.runtime.aggregate_output_chunk_rows,
            default_aggregate_output_chunk_rows()
        );
        assert!(cfg.runtime.source_transfer_to_executor);
    }

    #[test]
    fn log_filter_overrides_level() {
        let cfg: CascadeConfig =
            toml::from_str("log_level = \"info\"\nlog_filter = \"cascade=trace\"").expect("parse");
        assert_eq!(cfg.effective_log_filter(), "cascade=trace");
    }
}
