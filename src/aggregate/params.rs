// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Effective parameter analysis
//!
//! Splits parameter columns into varied and constant ones, normalizes path
//! values and assigns each distinct parameter setting a `ParamHashID`.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::AggregateRow;
use crate::errors::GridflowError;
use crate::identity::{hash_value, short_hash};
use crate::schedule::argument_text;

/// Length of the hash suffix in normalized path values
const PATH_HASH_LENGTH: usize = 8;

/// Column selector: an exact column name or a glob pattern
#[derive(Debug, Clone)]
pub struct ColumnMatcher {
    exact: BTreeSet<String>,
    patterns: Vec<Pattern>,
}

impl ColumnMatcher {
    pub fn new(selectors: &[String]) -> Result<Self, GridflowError> {
        let mut exact = BTreeSet::new();
        let mut patterns = Vec::new();
        for selector in selectors {
            if selector.contains(['*', '?', '[']) {
                patterns.push(Pattern::new(selector)?);
            } else {
                exact.insert(selector.clone());
            }
        }
        Ok(Self { exact, patterns })
    }

    pub fn matches(&self, column: &str) -> bool {
        self.exact.contains(column) || self.patterns.iter().any(|p| p.matches(column))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }
}

/// Result of [`build_effective_params`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EffectiveParams {
    /// Varied column -> value -> number of rows
    pub varied: BTreeMap<String, BTreeMap<String, usize>>,
    /// Columns with one value across all rows
    pub constant: BTreeMap<String, Value>,
    /// Normalized effective parameters, one map per input row
    pub rows: Vec<BTreeMap<String, Value>>,
    /// ParamHashID per input row
    pub hashids: Vec<String>,
    /// ParamHashID -> effective parameters
    pub hashid_lookup: BTreeMap<String, BTreeMap<String, Value>>,
    /// Normalized path value -> original value
    pub path_lookup: BTreeMap<String, String>,
}

/// Compute effective parameters for a set of rows
///
/// `ignore` columns are dropped before anything else. Path columns are the
/// rows' own input-path columns plus those matched by `path_columns`.
pub fn build_effective_params(
    rows: &[AggregateRow],
    ignore: &ColumnMatcher,
    path_columns: &ColumnMatcher,
) -> EffectiveParams {
    let mut result = EffectiveParams::default();

    for row in rows {
        let mut effective = BTreeMap::new();
        for (column, value) in &row.params {
            if ignore.matches(column) {
                continue;
            }
            let is_path = row.path_columns.contains(column) || path_columns.matches(column);
            let value = match value {
                Value::String(original) if is_path => {
                    let normalized = normalize_path(original);
                    result
                        .path_lookup
                        .insert(normalized.clone(), original.clone());
                    Value::String(normalized)
                }
                other => other.clone(),
            };
            effective.insert(column.clone(), value);
        }

        let specified: Vec<&String> = row
            .specified
            .iter()
            .filter(|c| effective.contains_key(*c))
            .collect();
        let hashid = param_hashid(&effective, &specified);

        result
            .hashid_lookup
            .entry(hashid.clone())
            .or_insert_with(|| effective.clone());
        result.hashids.push(hashid);
        result.rows.push(effective);
    }

    let columns: BTreeSet<&String> = result.rows.iter().flat_map(|r| r.keys()).collect();
    for column in columns {
        let values: Vec<Option<&Value>> = result.rows.iter().map(|r| r.get(column)).collect();
        let first = values[0];
        if first.is_some() && values.iter().all(|v| *v == first) {
            if let Some(value) = first {
                result.constant.insert(column.clone(), value.clone());
            }
            continue;
        }

        let basis = result.varied.entry(column.clone()).or_default();
        for value in values {
            let text = value.map(argument_text).unwrap_or_else(|| "<missing>".into());
            *basis.entry(text).or_default() += 1;
        }
    }

    result
}

/// Identity of an effective parameter setting and its specified mask
pub fn param_hashid(params: &BTreeMap<String, Value>, specified: &[&String]) -> String {
    hash_value(&json!({
        "params": params,
        "specified": specified,
    }))
}

/// Replace a path by `<file name>@<short hash of the full path>`
pub fn normalize_path(original: &str) -> String {
    let name = Path::new(original)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(original);
    format!("{}@{}", name, short_hash(original, PATH_HASH_LENGTH))
}
