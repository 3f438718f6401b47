// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Pipeline definition structures
//!
//! Defines the schema for pipeline YAML files:
//!
//! ```yaml
//! name: demo
//! nodes:
//!   - name: predict
//!     executable: python predict.py
//!     in_paths: [src_fpath]
//!     out_paths: {dst_fpath: pred.json}
//!     algo_params: {threshold: 0.5}
//!   - name: evaluate
//!     executable: python evaluate.py
//!     in_paths: [pred_fpath]
//!     out_paths: {out_fpath: metrics.json}
//! connections:
//!   - {from: predict.dst_fpath, to: evaluate.pred_fpath}
//! ```
//!
//! A node with several `out_paths` names the one that marks completion with
//! `primary_out_key`. With a single output that key may be omitted and the
//! only output is primary.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::GridflowError;
use crate::pipeline::{Node, NodeSpec, Pipeline};

/// Pipeline definition as written on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Definition version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Pipeline name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Nodes in declaration order
    pub nodes: Vec<NodeSpec>,

    /// Output-to-input connections
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
}

/// One `from: node.out_key` / `to: node.in_key` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub from: String,
    pub to: String,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    /// Load a definition from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, GridflowError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| GridflowError::read_failed(path, e))?;

        Self::from_yaml(&content)
    }

    /// Parse a definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, GridflowError> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Serialize the definition to YAML
    pub fn to_yaml(&self) -> Result<String, GridflowError> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Get a node spec by name
    pub fn get_node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Build a pipeline template: nodes validated, connections wired
    ///
    /// The graph is checked for cycles but root inputs may still be unbound;
    /// those are supplied per configuration.
    pub fn instantiate(&self) -> Result<Pipeline, GridflowError> {
        if self.nodes.is_empty() {
            return Err(GridflowError::InvalidPipeline {
                reason: format!("pipeline '{}' has no nodes", self.name),
                help: Some("Declare at least one entry under `nodes:`".into()),
            });
        }

        let nodes = self
            .nodes
            .iter()
            .cloned()
            .map(Node::new)
            .collect::<Result<Vec<_>, _>>()?;

        let mut pipeline = Pipeline::with_nodes(&self.name, nodes)?;
        for conn in &self.connections {
            pipeline.connect_keys(&conn.from, &conn.to)?;
        }
        pipeline.build_graph()?;

        Ok(pipeline)
    }
}
