//! External metadata overrides.
//!
//! Operators drop `*.algometa.yaml` files next to the service to adjust
//! non-key spec fields — descriptions, timeouts, logging switches — without
//! touching algorithm code. Each entry names the four match keys and any
//! subset of override fields; match keys themselves are never overridden.
//!
//! ```yaml
//! - name: double
//!   version: v1
//!   category: arithmetic
//!   algorithmType: general
//!   execution:
//!     timeoutS: 1.0
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;

use crate::spec::{AlgorithmSpec, AlgorithmType, ExecutionMode};

/// Partial override of a spec's logging config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingOverride {
    pub enabled: Option<bool>,
    pub log_input: Option<bool>,
    pub log_output: Option<bool>,
}

/// Partial override of a spec's execution config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOverride {
    pub execution_mode: Option<ExecutionMode>,
    pub stateful: Option<bool>,
    pub isolated_pool: Option<bool>,
    pub max_workers: Option<usize>,
    pub timeout_s: Option<f64>,
    pub gpu: Option<String>,
    pub kill_tree: Option<bool>,
    pub kill_grace_s: Option<f64>,
}

/// One override entry: four required match keys plus optional overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideEntry {
    // Match keys — used for selection, never applied.
    pub name: String,
    pub version: String,
    pub category: String,
    pub algorithm_type: AlgorithmType,

    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub application_scenarios: Option<String>,
    #[serde(default)]
    pub extra: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub logging: Option<LoggingOverride>,
    #[serde(default)]
    pub execution: Option<ExecutionOverride>,

    /// Collects keys this schema does not know, so the loader can warn and
    /// skip the entry instead of silently accepting typos.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

impl OverrideEntry {
    /// All four match keys must agree.
    pub fn matches(&self, spec: &AlgorithmSpec) -> bool {
        self.name == spec.name
            && self.version == spec.version
            && self.category == spec.category
            && self.algorithm_type == spec.algorithm_type
    }

    /// Apply the provided override fields to `spec`, leaving match keys and
    /// unset fields alone.
    pub fn apply(&self, spec: &mut AlgorithmSpec) {
        if let Some(description) = &self.description {
            spec.description = Some(description.clone());
        }
        if let Some(created_time) = &self.created_time {
            if NaiveDate::parse_from_str(created_time, "%Y-%m-%d").is_ok() {
                spec.created_time = created_time.clone();
            } else {
                warn!(
                    algorithm = %spec.key(),
                    value = %created_time,
                    "override createdTime is not a valid date, ignoring field"
                );
            }
        }
        if let Some(author) = &self.author {
            spec.author = author.clone();
        }
        if let Some(scenarios) = &self.application_scenarios {
            spec.application_scenarios = Some(scenarios.clone());
        }
        if let Some(extra) = &self.extra {
            for (k, v) in extra {
                spec.extra.insert(k.clone(), v.clone());
            }
        }
        if let Some(logging) = &self.logging {
            if let Some(enabled) = logging.enabled {
                spec.logging.enabled = enabled;
            }
            if let Some(log_input) = logging.log_input {
                spec.logging.log_input = log_input;
            }
            if let Some(log_output) = logging.log_output {
                spec.logging.log_output = log_output;
            }
        }
        if let Some(execution) = &self.execution {
            if let Some(mode) = execution.execution_mode {
                spec.execution.execution_mode = mode;
            }
            if let Some(stateful) = execution.stateful {
                spec.execution.stateful = stateful;
            }
            if let Some(isolated) = execution.isolated_pool {
                spec.execution.isolated_pool = isolated;
            }
            if let Some(max_workers) = execution.max_workers {
                spec.execution.max_workers = max_workers.max(1);
            }
            if let Some(timeout_s) = execution.timeout_s {
                spec.execution.timeout_s = Some(timeout_s);
            }
            if let Some(gpu) = &execution.gpu {
                spec.execution.gpu = Some(gpu.clone());
            }
            if let Some(kill_tree) = execution.kill_tree {
                spec.execution.kill_tree = kill_tree;
            }
            if let Some(kill_grace_s) = execution.kill_grace_s {
                spec.execution.kill_grace_s = kill_grace_s.max(0.0);
            }
        }
    }
}

/// Read every `*.algometa.yaml` in `dir`, lexically ordered, into a flat
/// entry list. Unreadable files, unparsable documents, and entries with
/// unknown keys are warned about and skipped; loading always continues.
pub fn load_override_dir(dir: &Path) -> Result<Vec<OverrideEntry>, String> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| format!("cannot read {}: {e}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".algometa.yaml"))
        })
        .collect();
    files.sort();

    let mut entries = Vec::new();
    for path in files {
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "cannot read override file, skipping");
                continue;
            }
        };
        let documents: Vec<serde_yaml::Value> = match serde_yaml::from_str(&content) {
            Ok(documents) => documents,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "override file does not parse, skipping");
                continue;
            }
        };
        for (index, document) in documents.into_iter().enumerate() {
            match serde_yaml::from_value::<OverrideEntry>(document) {
                Ok(entry) if entry.unknown.is_empty() => entries.push(entry),
                Ok(entry) => {
                    let keys: Vec<_> = entry.unknown.keys().cloned().collect();
                    warn!(
                        file = %path.display(),
                        index,
                        unknown_keys = ?keys,
                        "override entry has unknown keys, skipping"
                    );
                }
                Err(e) => {
                    warn!(
                        file = %path.display(),
                        index,
                        error = %e,
                        "override entry does not match the schema, skipping"
                    );
                }
            }
        }
    }
    Ok(entries)
}
