// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Node and port model
//!
//! A [`Node`] wraps one external executable. Its arguments fall into four
//! disjoint groups: input paths, output paths, algorithm parameters (hashed
//! into the node identity) and performance parameters (not hashed).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::errors::GridflowError;

/// Parameter name to value mapping, ordered by key
pub type ParamMap = BTreeMap<String, Value>;

/// Direction of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Reference to one port of one node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: String,
    pub key: String,
    pub direction: PortDirection,
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.key)
    }
}

/// How a node's result directory is turned into metric columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSpec {
    /// File to read, relative to the node directory (defaults to the primary output)
    #[serde(default)]
    pub file: Option<String>,

    /// JSON pointer to the metrics object inside the file
    #[serde(default)]
    pub metrics_pointer: Option<String>,
}

/// Input path declarations: either bare keys or keys with literal defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InPaths {
    Keys(Vec<String>),
    Defaults(BTreeMap<String, Option<Value>>),
}

impl Default for InPaths {
    fn default() -> Self {
        Self::Keys(Vec::new())
    }
}

impl InPaths {
    fn into_map(self) -> BTreeMap<String, Option<Value>> {
        match self {
            Self::Keys(keys) => keys.into_iter().map(|k| (k, None)).collect(),
            Self::Defaults(map) => map,
        }
    }
}

/// Declarative node description, as written in a pipeline file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node name (unique within a pipeline, no dots)
    pub name: String,

    /// Command prefix; arguments are appended as `--key=value`
    pub executable: String,

    #[serde(default)]
    pub in_paths: InPaths,

    /// Output key to default path, relative to the node directory
    #[serde(default)]
    pub out_paths: BTreeMap<String, String>,

    /// Output whose existence marks the job as complete
    #[serde(default)]
    pub primary_out_key: Option<String>,

    #[serde(default)]
    pub algo_params: ParamMap,

    #[serde(default)]
    pub perf_params: ParamMap,

    /// Backend directives (e.g. slurm `time`, `gres`); merged, never hashed
    #[serde(default, alias = "slurm_options")]
    pub execution_options: ParamMap,

    /// Directory template overriding the default layout
    #[serde(default)]
    pub node_dpath: Option<String>,

    #[serde(default)]
    pub result: Option<ResultSpec>,
}

impl NodeSpec {
    /// Start a spec with only a name and executable
    pub fn new(name: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            in_paths: InPaths::default(),
            out_paths: BTreeMap::new(),
            primary_out_key: None,
            algo_params: ParamMap::new(),
            perf_params: ParamMap::new(),
            execution_options: ParamMap::new(),
            node_dpath: None,
            result: None,
        }
    }
}

/// Which argument group a declared parameter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    InPath,
    OutPath,
    PrimaryOut,
    Algo,
    Perf,
}

impl ParamKind {
    fn is_output(self) -> bool {
        matches!(self, Self::OutPath | Self::PrimaryOut)
    }
}

/// One tagged parameter declaration, see [`Node::from_decls`]
#[derive(Debug, Clone)]
pub struct ParamDecl {
    pub key: String,
    pub kind: ParamKind,
    pub default: Option<Value>,
}

impl ParamDecl {
    pub fn in_path(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ParamKind::InPath,
            default: None,
        }
    }

    pub fn out_path(key: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ParamKind::OutPath,
            default: Some(Value::String(default.into())),
        }
    }

    pub fn primary_out(key: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ParamKind::PrimaryOut,
            default: Some(Value::String(default.into())),
        }
    }

    pub fn algo(key: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            kind: ParamKind::Algo,
            default: Some(default.into()),
        }
    }

    pub fn perf(key: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            kind: ParamKind::Perf,
            default: Some(default.into()),
        }
    }

    /// Attach a default (used for literal input-path defaults)
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Values assigned to one node by a single grid configuration
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Explicit values, keyed by parameter
    pub values: ParamMap,
    /// Per-node execution option overlay from the grid
    pub execution_options: ParamMap,
}

/// A validated pipeline stage
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    executable: String,
    in_paths: BTreeMap<String, Option<Value>>,
    out_paths: BTreeMap<String, String>,
    primary_out_key: String,
    algo_params: ParamMap,
    perf_params: ParamMap,
    execution_options: ParamMap,
    node_dpath: String,
    result: Option<ResultSpec>,
    config: NodeConfig,
}

impl Node {
    /// Validate a spec and build the node
    pub fn new(spec: NodeSpec) -> Result<Self, GridflowError> {
        let name = spec.name;
        let invalid = |reason: String| GridflowError::InvalidNode {
            node: name.clone(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("name is empty".into()));
        }
        if name.contains('.') || name.contains('/') {
            return Err(invalid("name must not contain '.' or '/'".into()));
        }
        if spec.executable.trim().is_empty() {
            return Err(invalid("executable is empty".into()));
        }

        let in_paths = spec.in_paths.into_map();
        let groups: [(&str, Vec<&String>); 4] = [
            ("in_paths", in_paths.keys().collect()),
            ("out_paths", spec.out_paths.keys().collect()),
            ("algo_params", spec.algo_params.keys().collect()),
            ("perf_params", spec.perf_params.keys().collect()),
        ];

        let mut seen: BTreeMap<&String, &str> = BTreeMap::new();
        for (group, keys) in &groups {
            for &key in keys {
                if key.starts_with("__") {
                    return Err(invalid(format!("key '{}' uses the reserved '__' prefix", key)));
                }
                if let Some(other) = seen.insert(key, *group) {
                    return Err(invalid(format!(
                        "key '{}' appears in both {} and {}",
                        key, other, group
                    )));
                }
            }
        }

        let primary_out_key = match spec.primary_out_key {
            Some(key) if spec.out_paths.contains_key(&key) => key,
            Some(key) => {
                return Err(invalid(format!(
                    "primary_out_key '{}' is not one of its out_paths",
                    key
                )))
            }
            None if spec.out_paths.len() == 1 => {
                spec.out_paths.keys().next().cloned().unwrap_or_default()
            }
            None => return Err(invalid("primary_out_key is required".into())),
        };

        let node_dpath = spec
            .node_dpath
            .unwrap_or_else(|| default_node_dpath(&name));

        Ok(Self {
            executable: spec.executable,
            in_paths,
            out_paths: spec.out_paths,
            primary_out_key,
            algo_params: spec.algo_params,
            perf_params: spec.perf_params,
            execution_options: spec.execution_options,
            node_dpath,
            result: spec.result,
            config: NodeConfig::default(),
            name,
        })
    }

    /// Build a node from tagged parameter declarations
    pub fn from_decls(
        name: impl Into<String>,
        executable: impl Into<String>,
        decls: impl IntoIterator<Item = ParamDecl>,
    ) -> Result<Self, GridflowError> {
        let mut spec = NodeSpec::new(name, executable);
        let mut kinds: BTreeMap<String, ParamKind> = BTreeMap::new();
        let mut in_paths = BTreeMap::new();
        let mut primary = None;

        for decl in decls {
            if let Some(previous) = kinds.insert(decl.key.clone(), decl.kind) {
                let reason = if previous == decl.kind {
                    format!("'{}' is declared twice", decl.key)
                } else {
                    format!("'{}' has conflicting kinds {:?} and {:?}", decl.key, previous, decl.kind)
                };
                return Err(GridflowError::InvalidNode {
                    node: spec.name,
                    reason,
                });
            }

            if decl.kind.is_output() {
                let default = match decl.default {
                    Some(Value::String(s)) => s,
                    None => decl.key.clone(),
                    Some(other) => {
                        return Err(GridflowError::InvalidNode {
                            node: spec.name,
                            reason: format!("output '{}' default must be a path, got {}", decl.key, other),
                        })
                    }
                };
                if decl.kind == ParamKind::PrimaryOut {
                    if let Some(first) = primary.replace(decl.key.clone()) {
                        return Err(GridflowError::InvalidNode {
                            node: spec.name,
                            reason: format!("both '{}' and '{}' are marked primary", first, decl.key),
                        });
                    }
                }
                spec.out_paths.insert(decl.key, default);
                continue;
            }

            match decl.kind {
                ParamKind::InPath => {
                    in_paths.insert(decl.key, decl.default);
                }
                ParamKind::Algo => {
                    spec.algo_params.insert(decl.key, decl.default.unwrap_or(Value::Null));
                }
                ParamKind::Perf => {
                    spec.perf_params.insert(decl.key, decl.default.unwrap_or(Value::Null));
                }
                ParamKind::OutPath | ParamKind::PrimaryOut => {}
            }
        }

        spec.in_paths = InPaths::Defaults(in_paths);
        spec.primary_out_key = primary;
        Self::new(spec)
    }

    /// Attach backend directives declared by the node itself
    pub fn with_execution_options(mut self, options: ParamMap) -> Self {
        self.execution_options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn primary_out_key(&self) -> &str {
        &self.primary_out_key
    }

    pub fn node_dpath_template(&self) -> &str {
        &self.node_dpath
    }

    pub fn result_spec(&self) -> Option<&ResultSpec> {
        self.result.as_ref()
    }

    /// Execution options declared on the node (lowest precedence tier)
    pub fn default_execution_options(&self) -> &ParamMap {
        &self.execution_options
    }

    pub fn in_path_keys(&self) -> impl Iterator<Item = &String> {
        self.in_paths.keys()
    }

    pub fn out_path_keys(&self) -> impl Iterator<Item = &String> {
        self.out_paths.keys()
    }

    pub fn has_input(&self, key: &str) -> bool {
        self.in_paths.contains_key(key)
    }

    pub fn has_output(&self, key: &str) -> bool {
        self.out_paths.contains_key(key)
    }

    /// Look up an input port
    pub fn input(&self, key: &str) -> Result<PortRef, GridflowError> {
        self.port(key, PortDirection::Input)
    }

    /// Look up an output port
    pub fn output(&self, key: &str) -> Result<PortRef, GridflowError> {
        self.port(key, PortDirection::Output)
    }

    fn port(&self, key: &str, direction: PortDirection) -> Result<PortRef, GridflowError> {
        let exists = match direction {
            PortDirection::Input => self.has_input(key),
            PortDirection::Output => self.has_output(key),
        };
        if !exists {
            return Err(GridflowError::UnknownPort {
                node: self.name.clone(),
                port: key.to_string(),
                direction: direction.to_string(),
            });
        }
        Ok(PortRef {
            node: self.name.clone(),
            key: key.to_string(),
            direction,
        })
    }

    /// Which group a key belongs to, if any
    pub fn key_kind(&self, key: &str) -> Option<ParamKind> {
        if self.in_paths.contains_key(key) {
            Some(ParamKind::InPath)
        } else if key == self.primary_out_key {
            Some(ParamKind::PrimaryOut)
        } else if self.out_paths.contains_key(key) {
            Some(ParamKind::OutPath)
        } else if self.algo_params.contains_key(key) {
            Some(ParamKind::Algo)
        } else if self.perf_params.contains_key(key) {
            Some(ParamKind::Perf)
        } else {
            None
        }
    }

    /// Apply one configuration's values, replacing any previous ones
    pub fn configure(&mut self, values: ParamMap, execution_options: ParamMap) -> Result<(), GridflowError> {
        if let Some(unknown) = values.keys().find(|k| self.key_kind(k).is_none()) {
            return Err(GridflowError::GridExpansion {
                dimension: format!("{}.{}", self.name, unknown),
                reason: format!("node '{}' has no parameter '{}'", self.name, unknown),
            });
        }
        self.config = NodeConfig {
            values,
            execution_options,
        };
        Ok(())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Whether a key was set explicitly by the current configuration
    pub fn is_specified(&self, key: &str) -> bool {
        self.config.values.contains_key(key)
    }

    /// Configured or default literal value of an input path
    pub fn in_path_value(&self, key: &str) -> Option<&Value> {
        self.config
            .values
            .get(key)
            .or_else(|| self.in_paths.get(key).and_then(Option::as_ref))
            .filter(|v| !v.is_null())
    }

    /// Configured or default relative path of an output
    pub fn out_path_value(&self, key: &str) -> Option<String> {
        match self.config.values.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => self.out_paths.get(key).cloned(),
        }
    }

    /// Algorithm parameters with configured overrides applied
    pub fn resolved_algo_params(&self) -> ParamMap {
        self.resolve_group(&self.algo_params)
    }

    /// Performance parameters with configured overrides applied
    pub fn resolved_perf_params(&self) -> ParamMap {
        self.resolve_group(&self.perf_params)
    }

    fn resolve_group(&self, defaults: &ParamMap) -> ParamMap {
        defaults
            .iter()
            .map(|(key, default)| {
                let value = self.config.values.get(key).unwrap_or(default);
                (key.clone(), value.clone())
            })
            .collect()
    }

    /// Keys explicitly set by the current configuration
    pub fn specified_keys(&self) -> BTreeSet<String> {
        self.config.values.keys().cloned().collect()
    }
}

fn default_node_dpath(name: &str) -> String {
    format!("{{root_dpath}}/{{node}}/{{node}}_id_{{{}_id}}", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn predict_spec() -> NodeSpec {
        let mut spec = NodeSpec::new("predict", "python predict.py");
        spec.in_paths = InPaths::Keys(vec!["src_fpath".into()]);
        spec.out_paths.insert("dst_fpath".into(), "pred.json".into());
        spec.out_paths.insert("dst_dpath".into(), ".".into());
        spec.primary_out_key = Some("dst_fpath".into());
        spec.algo_params.insert("keyword".into(), json!("great"));
        spec.perf_params.insert("workers".into(), json!(0));
        spec
    }

    #[test]
    fn test_valid_node() {
        let node = Node::new(predict_spec()).unwrap();
        assert_eq!(node.primary_out_key(), "dst_fpath");
        assert_eq!(
            node.node_dpath_template(),
            "{root_dpath}/{node}/{node}_id_{predict_id}"
        );
        assert_eq!(node.key_kind("workers"), Some(ParamKind::Perf));
        assert_eq!(node.key_kind("dst_dpath"), Some(ParamKind::OutPath));
    }

    #[test]
    fn test_primary_must_be_an_output() {
        let mut spec = predict_spec();
        spec.primary_out_key = Some("nope".into());
        assert!(matches!(Node::new(spec), Err(GridflowError::InvalidNode { .. })));
    }

    #[test]
    fn test_primary_required_with_several_outputs() {
        let mut spec = predict_spec();
        spec.primary_out_key = None;
        assert!(Node::new(spec).is_err());
    }

    #[test]
    fn test_single_output_is_primary() {
        let mut spec = NodeSpec::new("eval", "python eval.py");
        spec.out_paths.insert("out_fpath".into(), "metrics.json".into());
        let node = Node::new(spec).unwrap();
        assert_eq!(node.primary_out_key(), "out_fpath");
    }

    #[test]
    fn test_groups_must_be_disjoint() {
        let mut spec = predict_spec();
        spec.perf_params.insert("keyword".into(), json!(1));
        let err = Node::new(spec).unwrap_err();
        assert!(err.to_string().contains("keyword"));
    }

    #[test]
    fn test_from_decls_derives_groups() {
        let node = Node::from_decls(
            "demo",
            "demo-cli",
            vec![
                ParamDecl::in_path("src").with_default("ignored.txt"),
                ParamDecl::primary_out("dst", "explicit.txt"),
                ParamDecl::out_path("extra", ""),
                ParamDecl::algo("foo", 1),
                ParamDecl::perf("workers", 2),
            ],
        )
        .unwrap();

        assert_eq!(node.primary_out_key(), "dst");
        assert_eq!(node.in_path_value("src"), Some(&json!("ignored.txt")));
        assert_eq!(node.resolved_algo_params()["foo"], json!(1));
        assert_eq!(node.resolved_perf_params()["workers"], json!(2));
    }

    #[test]
    fn test_declared_execution_options() {
        let mut options = ParamMap::new();
        options.insert("gres".into(), json!("gpu:1"));
        let node = Node::from_decls("fit", "fit-cli", vec![ParamDecl::primary_out("model", "model.pt")])
            .unwrap()
            .with_execution_options(options);
        assert_eq!(node.default_execution_options()["gres"], json!("gpu:1"));
    }

    #[test]
    fn test_from_decls_conflicting_kinds() {
        let err = Node::from_decls(
            "bad",
            "bad-cli",
            vec![ParamDecl::in_path("foo"), ParamDecl::out_path("foo", "x")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("conflicting kinds"));
    }

    #[test]
    fn test_ports() {
        let node = Node::new(predict_spec()).unwrap();
        assert_eq!(node.output("dst_fpath").unwrap().to_string(), "predict.dst_fpath");
        assert!(matches!(
            node.input("dst_fpath"),
            Err(GridflowError::UnknownPort { .. })
        ));
    }

    #[test]
    fn test_configure_overrides_and_tracks_specified() {
        let mut node = Node::new(predict_spec()).unwrap();
        let mut values = ParamMap::new();
        values.insert("keyword".into(), json!("good"));
        node.configure(values, ParamMap::new()).unwrap();

        assert_eq!(node.resolved_algo_params()["keyword"], json!("good"));
        assert!(node.is_specified("keyword"));
        assert!(!node.is_specified("workers"));
    }

    #[test]
    fn test_configure_rejects_unknown_key() {
        let mut node = Node::new(predict_spec()).unwrap();
        let mut values = ParamMap::new();
        values.insert("keywrod".into(), json!("good"));
        let err = node.configure(values, ParamMap::new()).unwrap_err();
        assert!(matches!(err, GridflowError::GridExpansion { ref dimension, .. } if dimension == "predict.keywrod"));
    }
}
