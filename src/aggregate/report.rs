// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Aggregation reports

use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use super::params::EffectiveParams;
use super::regions::MacroGroup;
use super::AggregateRow;
use crate::errors::GridflowError;
use crate::schedule::argument_text;

/// One row in the ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedRow {
    pub rank: usize,
    pub param_hashid: String,
    pub process_id: String,
    pub dpath: PathBuf,
    pub value: f64,
}

/// Report for one evaluation node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: String,
    pub rows: usize,
    pub varied: BTreeMap<String, BTreeMap<String, usize>>,
    pub constant: BTreeMap<String, Value>,
    pub hashid_lookup: BTreeMap<String, BTreeMap<String, Value>>,
    pub path_lookup: BTreeMap<String, String>,
    /// Resolved name of the ranking metric
    pub sort_metric: Option<String>,
    pub top: Vec<RankedRow>,
    pub macro_groups: Vec<MacroGroup>,
}

impl NodeReport {
    pub fn new(node: &str, rows: &[AggregateRow], effective: EffectiveParams) -> Self {
        Self {
            node: node.to_string(),
            rows: rows.len(),
            varied: effective.varied,
            constant: effective.constant,
            hashid_lookup: effective.hashid_lookup,
            path_lookup: effective.path_lookup,
            ..Default::default()
        }
    }
}

/// Full aggregation output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateReport {
    pub nodes: Vec<NodeReport>,
    /// Rows that could not be built
    pub warnings: Vec<String>,
}

impl AggregateReport {
    pub fn to_json(&self) -> Result<String, GridflowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> Result<String, GridflowError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Human-readable rendering
    pub fn to_text(&self) -> String {
        let mut out = String::new();

        for node in &self.nodes {
            let title = format!("Node: {} ({} rows)", node.node, node.rows);
            let _ = writeln!(out, "{}", title.bold());
            let _ = writeln!(out, "{}", "═".repeat(title.len().max(40)));

            if !node.varied.is_empty() {
                let _ = writeln!(out, "\n{}:", "Varied parameters".bold());
                for (column, basis) in &node.varied {
                    let values: Vec<String> =
                        basis.iter().map(|(v, n)| format!("{}={}", v, n)).collect();
                    let _ = writeln!(out, "  • {}: {}", column, values.join(", "));
                }
            }

            if !node.constant.is_empty() {
                let _ = writeln!(out, "\n{}:", "Constant parameters".bold());
                for (column, value) in &node.constant {
                    let _ = writeln!(out, "  • {} = {}", column, argument_text(value));
                }
            }

            if let Some(metric) = &node.sort_metric {
                let _ = writeln!(out, "\n{} {}:", "Top rows by".bold(), metric.cyan());
                for ranked in &node.top {
                    let _ = writeln!(
                        out,
                        "  {}. {:.6}  {}  {}",
                        ranked.rank,
                        ranked.value,
                        ranked.param_hashid,
                        ranked.dpath.display().to_string().dimmed()
                    );
                }
            }

            if !node.macro_groups.is_empty() {
                let _ = writeln!(out, "\n{}:", "Macro groups".bold());
                for group in &node.macro_groups {
                    let _ = writeln!(
                        out,
                        "  • {} over [{}] ({} rows, key {})",
                        group.param_hashid,
                        group.regions.join(", "),
                        group.rows,
                        group.region_key
                    );
                    for (metric, mean) in &group.metrics {
                        let _ = writeln!(out, "      {} = {:.6}", metric, mean);
                    }
                }
            }

            if !node.path_lookup.is_empty() {
                let _ = writeln!(out, "\n{}:", "Paths".bold());
                for (short, original) in &node.path_lookup {
                    let _ = writeln!(out, "  • {} -> {}", short, original);
                }
            }
            out.push('\n');
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "{}:", "Warnings".bold());
            for warning in &self.warnings {
                let _ = writeln!(out, "  {} {}", "⚠".yellow(), warning);
            }
        }

        out
    }
}

/// Resolve a metric name against the columns of a node's rows
///
/// Full column names are used as-is; short names are looked up under
/// `metrics.<node>.`.
pub fn resolve_metric_name(node: &str, metric: &str, rows: &[AggregateRow]) -> String {
    if rows.iter().any(|r| r.metrics.contains_key(metric)) {
        metric.to_string()
    } else {
        format!("metrics.{}.{}", node, metric)
    }
}

/// Rank rows by a numeric metric, best first
///
/// Rows lacking the metric, or holding a non-numeric or NaN value, are left
/// out. Ties keep input order.
pub fn rank_rows(
    rows: &[AggregateRow],
    hashids: &[String],
    metric: &str,
    maximize: bool,
    top_k: usize,
) -> Vec<RankedRow> {
    let mut scored: Vec<(f64, &AggregateRow, &String)> = rows
        .iter()
        .zip(hashids)
        .filter_map(|(row, hashid)| {
            let value = row.metrics.get(metric)?.as_f64()?;
            (!value.is_nan()).then_some((value, row, hashid))
        })
        .collect();

    scored.sort_by(|a, b| {
        let ordering = a.0.total_cmp(&b.0);
        if maximize {
            ordering.reverse()
        } else {
            ordering
        }
    });

    scored
        .into_iter()
        .take(top_k)
        .enumerate()
        .map(|(i, (value, row, hashid))| RankedRow {
            rank: i + 1,
            param_hashid: hashid.clone(),
            process_id: row.process_id.clone(),
            dpath: row.dpath.clone(),
            value,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> (Vec<AggregateRow>, Vec<String>) {
        let rows = [("a", 0.5), ("b", 0.9), ("c", 0.1)]
            .iter()
            .map(|(id, acc)| {
                let mut row = AggregateRow::new("eval", format!("/runs/{}", id), *id);
                row.metrics.insert("metrics.eval.acc".into(), json!(acc));
                row
            })
            .collect();
        (rows, vec!["ha".into(), "hb".into(), "hc".into()])
    }

    #[test]
    fn test_rank_maximize_and_minimize() {
        let (rows, hashids) = rows();

        let best = rank_rows(&rows, &hashids, "metrics.eval.acc", true, 2);
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].process_id, "b");
        assert_eq!(best[0].rank, 1);
        assert_eq!(best[1].process_id, "a");

        let lowest = rank_rows(&rows, &hashids, "metrics.eval.acc", false, 10);
        assert_eq!(lowest.len(), 3);
        assert_eq!(lowest[0].param_hashid, "hc");
    }

    #[test]
    fn test_resolve_metric_name() {
        let (rows, _) = rows();
        assert_eq!(resolve_metric_name("eval", "acc", &rows), "metrics.eval.acc");
        assert_eq!(
            resolve_metric_name("eval", "metrics.eval.acc", &rows),
            "metrics.eval.acc"
        );
    }

    #[test]
    fn test_report_renders_every_format() {
        colored::control::set_override(false);
        let (rows, hashids) = rows();
        let mut node = NodeReport::new("eval", &rows, EffectiveParams::default());
        node.sort_metric = Some("metrics.eval.acc".into());
        node.top = rank_rows(&rows, &hashids, "metrics.eval.acc", true, 1);

        let report = AggregateReport {
            nodes: vec![node],
            warnings: vec!["dropped /runs/x: missing output".into()],
        };

        let text = report.to_text();
        assert!(text.contains("Node: eval (3 rows)"));
        assert!(text.contains("1. 0.900000  hb"));
        assert!(text.contains("dropped /runs/x"));

        let parsed: Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(parsed["nodes"][0]["top"][0]["process_id"], "b");
        assert!(report.to_yaml().unwrap().contains("node: eval"));
    }
}
