// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Grid expansion
//!
//! Turns a matrix into concrete configurations: the cartesian product over
//! all dimensions, enumerated in sorted dimension order.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

use crate::errors::GridflowError;
use crate::grid::GridSpec;
use crate::pipeline::ParamMap;

const INCLUDE_KEY: &str = "__include__";
const OVERLAY_KEYS: [&str; 2] = ["__slurm_options__", "__execution_options__"];

/// One element of a grid expansion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    /// Node name to explicitly assigned parameters
    pub values: BTreeMap<String, ParamMap>,
    /// Node name to execution option overlay
    pub execution_options: BTreeMap<String, ParamMap>,
}

impl Configuration {
    /// Explicitly specified keys as `node.key`
    pub fn specified(&self) -> BTreeSet<String> {
        self.values
            .iter()
            .flat_map(|(node, params)| params.keys().map(move |k| format!("{}.{}", node, k)))
            .collect()
    }

    /// Value assigned to `node.key`, if any
    pub fn get(&self, node: &str, key: &str) -> Option<&Value> {
        self.values.get(node).and_then(|p| p.get(key))
    }
}

/// Expand every matrix of a grid, concatenating results in order
pub fn expand_grid(spec: &GridSpec) -> Result<Vec<Configuration>, GridflowError> {
    let mut configs = Vec::new();
    for matrix in spec.matrix.parts() {
        configs.extend(expand_matrix(matrix, &spec.base_dir)?);
    }
    debug!(count = configs.len(), "expanded grid");
    Ok(configs)
}

/// Expand a single matrix mapping
pub fn expand_matrix(
    matrix: &Map<String, Value>,
    base_dir: &Path,
) -> Result<Vec<Configuration>, GridflowError> {
    let mut dimensions: BTreeMap<(String, String), Vec<Value>> = BTreeMap::new();
    let mut overlays: BTreeMap<String, ParamMap> = BTreeMap::new();

    for (dimension, value) in matrix {
        let (node, key) = dimension
            .split_once('.')
            .filter(|(n, k)| !n.is_empty() && !k.is_empty())
            .ok_or_else(|| GridflowError::GridExpansion {
                dimension: dimension.clone(),
                reason: "expected a dotted <node>.<param> key".into(),
            })?;

        if OVERLAY_KEYS.contains(&key) {
            let Value::Object(options) = value else {
                return Err(GridflowError::GridExpansion {
                    dimension: dimension.clone(),
                    reason: "execution options must be a mapping".into(),
                });
            };
            overlays
                .entry(node.to_string())
                .or_default()
                .extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
            continue;
        }

        if key.starts_with("__") {
            return Err(GridflowError::GridExpansion {
                dimension: dimension.clone(),
                reason: format!("'{}' is a reserved key", key),
            });
        }

        let values = dimension_values(dimension, value, base_dir)?;
        if values.is_empty() {
            return Err(GridflowError::GridExpansion {
                dimension: dimension.clone(),
                reason: "value list is empty".into(),
            });
        }
        dimensions.insert((node.to_string(), key.to_string()), values);
    }

    // Odometer over the sorted dimensions, last dimension fastest
    let dims: Vec<(&(String, String), &Vec<Value>)> = dimensions.iter().collect();
    let total: usize = dims.iter().map(|(_, v)| v.len()).product();
    let mut configs = Vec::with_capacity(total);
    let mut cursor = vec![0usize; dims.len()];

    for _ in 0..total {
        let mut config = Configuration {
            values: BTreeMap::new(),
            execution_options: overlays.clone(),
        };
        for (i, ((node, key), values)) in dims.iter().enumerate() {
            config
                .values
                .entry(node.clone())
                .or_default()
                .insert(key.clone(), values[cursor[i]].clone());
        }
        configs.push(config);

        for i in (0..dims.len()).rev() {
            cursor[i] += 1;
            if cursor[i] < dims[i].1.len() {
                break;
            }
            cursor[i] = 0;
        }
    }

    Ok(configs)
}

/// Values of one dimension; includes are spliced, other mappings are opaque
fn dimension_values(
    dimension: &str,
    value: &Value,
    base_dir: &Path,
) -> Result<Vec<Value>, GridflowError> {
    match value {
        Value::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match include_target(item) {
                    Some(target) => values.extend(load_include(dimension, target, base_dir)?),
                    None => values.push(item.clone()),
                }
            }
            Ok(values)
        }
        other => match include_target(other) {
            Some(target) => load_include(dimension, target, base_dir),
            None => Ok(vec![other.clone()]),
        },
    }
}

fn include_target(value: &Value) -> Option<&Value> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(INCLUDE_KEY),
        _ => None,
    }
}

fn load_include(
    dimension: &str,
    target: &Value,
    base_dir: &Path,
) -> Result<Vec<Value>, GridflowError> {
    let fail = |reason: String| GridflowError::GridExpansion {
        dimension: dimension.to_string(),
        reason,
    };

    let Value::String(rel) = target else {
        return Err(fail(format!("{} must name a file, got {}", INCLUDE_KEY, target)));
    };
    let path = base_dir.join(rel);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| fail(format!("cannot read include '{}': {}", path.display(), e)))?;

    // YAML is a superset of JSON, so one parser covers both
    let loaded: Value = serde_yaml::from_str(&content)
        .map_err(|e| fail(format!("cannot parse include '{}': {}", path.display(), e)))?;

    match loaded {
        Value::Array(items) => {
            debug!(dimension, include = %path.display(), count = items.len(), "loaded include");
            Ok(items)
        }
        _ => Err(fail(format!("include '{}' is not a sequence", path.display()))),
    }
}
