// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Macro averaging over regions
//!
//! Rows that share a parameter setting but were evaluated on different
//! regions (datasets, splits, sites) are grouped, and each group gets a key
//! identifying the set of regions it covers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::AggregateRow;
use crate::identity::hash_value;
use crate::schedule::argument_text;

/// Order-independent identity of a set of regions
pub fn macro_region_key<S: AsRef<str>>(regions: &[S]) -> String {
    let set: BTreeSet<&str> = regions.iter().map(|r| r.as_ref()).collect();
    hash_value(&Value::Array(
        set.into_iter().map(|r| Value::String(r.to_string())).collect(),
    ))
}

/// Rows of one parameter setting averaged over their regions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroGroup {
    pub param_hashid: String,
    pub region_key: String,
    pub regions: Vec<String>,
    pub rows: usize,
    /// Mean of every numeric metric present in the group
    pub metrics: BTreeMap<String, f64>,
}

/// Group rows by ParamHashID and average their numeric metrics
///
/// Rows without a value in `region_column` take no part in grouping.
pub fn macro_groups(rows: &[AggregateRow], hashids: &[String], region_column: &str) -> Vec<MacroGroup> {
    let mut by_hashid: BTreeMap<&str, Vec<&AggregateRow>> = BTreeMap::new();
    for (row, hashid) in rows.iter().zip(hashids) {
        if row.column(region_column).is_some() {
            by_hashid.entry(hashid.as_str()).or_default().push(row);
        }
    }

    by_hashid
        .into_iter()
        .map(|(hashid, members)| {
            let regions: BTreeSet<String> = members
                .iter()
                .filter_map(|r| r.column(region_column))
                .map(argument_text)
                .collect();
            let regions: Vec<String> = regions.into_iter().collect();

            let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
            for row in &members {
                for (name, value) in &row.metrics {
                    if let Some(x) = value.as_f64() {
                        let entry = sums.entry(name.as_str()).or_default();
                        entry.0 += x;
                        entry.1 += 1;
                    }
                }
            }

            MacroGroup {
                param_hashid: hashid.to_string(),
                region_key: macro_region_key(&regions),
                rows: members.len(),
                metrics: sums
                    .into_iter()
                    .map(|(name, (sum, n))| (name.to_string(), sum / n as f64))
                    .collect(),
                regions,
            }
        })
        .collect()
}
