// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Result loaders
//!
//! A loader turns a finished job directory into a flat map of metrics.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::GridflowError;
use crate::pipeline::Node;
use crate::schedule::JobRecord;

/// Flat metric name to value mapping
pub type MetricMap = BTreeMap<String, Value>;

/// Trait for turning a job directory into metrics
pub trait ResultLoader: Send + Sync {
    fn load(&self, node_dpath: &Path) -> Result<MetricMap, GridflowError>;

    /// File the metrics are read from; its mtime keys the row cache
    fn source(&self, _node_dpath: &Path) -> Option<PathBuf> {
        None
    }
}

/// Reads a JSON (or YAML) file and flattens nested objects with dots
#[derive(Debug, Clone)]
pub struct JsonResultLoader {
    /// File relative to the job directory; the job's recorded primary output when unset
    file: Option<PathBuf>,
    /// JSON pointer to the metrics object
    pointer: Option<String>,
}

impl JsonResultLoader {
    pub fn new(file: impl Into<PathBuf>, pointer: Option<String>) -> Self {
        Self {
            file: Some(file.into()),
            pointer,
        }
    }

    /// Loader declared by a node, defaulting to each job's primary output
    pub fn for_node(node: &Node) -> Self {
        let spec = node.result_spec();
        Self {
            file: spec.and_then(|s| s.file.clone()).map(PathBuf::from),
            pointer: spec.and_then(|s| s.metrics_pointer.clone()),
        }
    }

    /// Result file of the job in `node_dpath`
    pub fn result_path(&self, node_dpath: &Path) -> Result<PathBuf, GridflowError> {
        if let Some(file) = &self.file {
            return Ok(node_dpath.join(file));
        }

        let primary_out = JobRecord::load(&JobRecord::path_in(node_dpath))?.primary_out;
        if primary_out.exists() {
            return Ok(primary_out);
        }
        // Run directories may have moved since the record was written
        Ok(match primary_out.file_name() {
            Some(name) if primary_out.is_absolute() => node_dpath.join(name),
            _ => node_dpath.join(&primary_out),
        })
    }
}

impl ResultLoader for JsonResultLoader {
    fn load(&self, node_dpath: &Path) -> Result<MetricMap, GridflowError> {
        let fail = |reason: String| GridflowError::ResultLoad {
            dpath: node_dpath.to_path_buf(),
            reason,
        };
        let path = self
            .result_path(node_dpath)
            .map_err(|e| fail(e.to_string()))?;

        let content = std::fs::read_to_string(&path)
            .map_err(|e| fail(format!("cannot read {}: {}", path.display(), e)))?;
        let document: Value = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| fail(format!("cannot parse {}: {}", path.display(), e)))?,
            _ => serde_json::from_str(&content)
                .map_err(|e| fail(format!("cannot parse {}: {}", path.display(), e)))?,
        };

        let target = match &self.pointer {
            Some(pointer) => document
                .pointer(pointer)
                .ok_or_else(|| fail(format!("pointer '{}' not found", pointer)))?,
            None => &document,
        };

        let Value::Object(_) = target else {
            return Err(fail("metrics are not an object".into()));
        };

        let mut metrics = MetricMap::new();
        flatten_into("", target, &mut metrics);
        Ok(metrics)
    }

    fn source(&self, node_dpath: &Path) -> Option<PathBuf> {
        self.result_path(node_dpath).ok()
    }
}

/// Flatten nested objects into dotted keys; arrays are kept whole
pub fn flatten_into(prefix: &str, value: &Value, out: &mut MetricMap) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(&name, child, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}
