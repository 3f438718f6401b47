// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Execution option merging
//!
//! Precedence, lowest first: options declared on the node, the grid's global
//! `__slurm_options__`, the grid's `<node>.__slurm_options__`. Keys are
//! replaced wholesale; keys present in only one tier are kept.

use crate::pipeline::ParamMap;

/// Merge the three tiers of execution options for one node
pub fn merge_execution_options(
    node_defaults: &ParamMap,
    global: &ParamMap,
    per_node: &ParamMap,
) -> ParamMap {
    let mut merged = node_defaults.clone();
    for tier in [global, per_node] {
        merged.extend(tier.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: serde_json::Value) -> ParamMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_precedence() {
        let merged = merge_execution_options(
            &map(json!({"time": "1:00:00", "mem": "4G"})),
            &map(json!({"time": "2:00:00", "partition": "gpu"})),
            &map(json!({"time": "3:00:00"})),
        );
        assert_eq!(
            merged,
            map(json!({"time": "3:00:00", "mem": "4G", "partition": "gpu"}))
        );
    }

    #[test]
    fn test_global_beats_node_default() {
        let merged = merge_execution_options(
            &map(json!({"gres": "gpu:1"})),
            &map(json!({"gres": "gpu:2"})),
            &ParamMap::new(),
        );
        assert_eq!(merged["gres"], json!("gpu:2"));
    }
}
