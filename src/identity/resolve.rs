// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Per-node identity resolution
//!
//! Walks a configured pipeline in topological order and derives, for every
//! node, its `algo_id`, the `depends` map over its ancestors, its
//! `process_id` and the directory the job lives in. Connected inputs take
//! the upstream node's resolved output path.

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::errors::GridflowError;
use crate::identity::hash::{hash_params, hash_value};
use crate::pipeline::{Node, ParamMap, Pipeline};

/// Identities and paths of one node under one configuration
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub name: String,
    pub executable: String,
    /// Algo params plus root input values; the hashed identity payload
    pub final_algo_config: ParamMap,
    pub algo_id: String,
    /// Ancestor (and self) name to `algo_id`
    pub depends: BTreeMap<String, String>,
    pub process_id: String,
    pub dpath: PathBuf,
    pub algo_params: ParamMap,
    pub perf_params: ParamMap,
    /// Unconnected inputs with their literal values
    pub root_inputs: ParamMap,
    /// Every input resolved to a concrete value
    pub in_paths: ParamMap,
    pub out_paths: BTreeMap<String, PathBuf>,
    pub primary_out: PathBuf,
    /// Keys the configuration set explicitly
    pub specified: BTreeSet<String>,
    pub predecessors: Vec<String>,
    pub successors: Vec<String>,
}

impl ResolvedNode {
    /// Name used for backend jobs and link entries
    pub fn job_name(&self) -> String {
        format!("{}_{}", self.name, self.process_id)
    }

    /// The `depends` map as a JSON object
    pub fn depends_value(&self) -> Value {
        Value::Object(
            self.depends
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

/// All resolved nodes of one configuration, in topological order
#[derive(Debug, Clone)]
pub struct ResolvedPipeline {
    nodes: Vec<ResolvedNode>,
    index: HashMap<String, usize>,
}

impl ResolvedPipeline {
    pub fn nodes(&self) -> &[ResolvedNode] {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }
}

/// Resolve identities and paths for every node of a configured pipeline
pub fn resolve_pipeline(
    pipeline: &Pipeline,
    root_dpath: &Path,
) -> Result<ResolvedPipeline, GridflowError> {
    let order = pipeline.topological_order()?;
    let mut resolved = ResolvedPipeline {
        nodes: Vec::with_capacity(order.len()),
        index: HashMap::new(),
    };

    for idx in order {
        let node = &pipeline.nodes()[idx];
        let entry = resolve_node(pipeline, node, root_dpath, &resolved)?;
        resolved.index.insert(entry.name.clone(), resolved.nodes.len());
        resolved.nodes.push(entry);
    }

    Ok(resolved)
}

fn resolve_node(
    pipeline: &Pipeline,
    node: &Node,
    root_dpath: &Path,
    done: &ResolvedPipeline,
) -> Result<ResolvedNode, GridflowError> {
    let name = node.name();

    let mut root_inputs = ParamMap::new();
    let mut in_paths = ParamMap::new();
    for key in node.in_path_keys() {
        match pipeline.source_of(name, key) {
            Some(source) => {
                let upstream = done.get(&source.node).ok_or_else(|| GridflowError::UnknownNode {
                    node: source.node.clone(),
                })?;
                let path = upstream.out_paths.get(&source.key).ok_or_else(|| {
                    GridflowError::UnknownPort {
                        node: source.node.clone(),
                        port: source.key.clone(),
                        direction: "output".into(),
                    }
                })?;
                in_paths.insert(key.clone(), Value::String(path.to_string_lossy().into_owned()));
            }
            None => {
                let value = node.in_path_value(key).cloned().ok_or_else(|| {
                    GridflowError::UnboundInput {
                        node: name.to_string(),
                        port: key.clone(),
                    }
                })?;
                root_inputs.insert(key.clone(), value.clone());
                in_paths.insert(key.clone(), value);
            }
        }
    }

    let algo_params = node.resolved_algo_params();
    let mut final_algo_config = algo_params.clone();
    final_algo_config.extend(root_inputs.clone());
    let algo_id = hash_params(&final_algo_config);

    let ancestors = pipeline.ancestors(name)?;
    let mut depends = BTreeMap::new();
    for ancestor in &ancestors {
        let upstream = done.get(ancestor.name()).ok_or_else(|| GridflowError::UnknownNode {
            node: ancestor.name().to_string(),
        })?;
        depends.insert(upstream.name.clone(), upstream.algo_id.clone());
    }
    depends.insert(name.to_string(), algo_id.clone());

    let depends_value = Value::Object(
        depends
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );
    let process_id = hash_value(&depends_value);

    // Ids reachable from the directory template: the node and its ancestors
    let mut ids: HashMap<&str, (&str, &str)> = HashMap::new();
    for ancestor in &ancestors {
        if let Some(upstream) = done.get(ancestor.name()) {
            ids.insert(
                ancestor.name(),
                (upstream.process_id.as_str(), upstream.algo_id.as_str()),
            );
        }
    }
    ids.insert(name, (process_id.as_str(), algo_id.as_str()));

    let dpath = PathBuf::from(render_template(
        name,
        node.node_dpath_template(),
        root_dpath,
        &ids,
    )?);

    let mut out_paths = BTreeMap::new();
    for key in node.out_path_keys() {
        let rel = node.out_path_value(key).unwrap_or_default();
        out_paths.insert(key.clone(), join_output(&dpath, &rel));
    }
    let primary_out = out_paths
        .get(node.primary_out_key())
        .cloned()
        .unwrap_or_else(|| dpath.clone());

    let names = |nodes: Vec<&Node>| -> Vec<String> { nodes.iter().map(|n| n.name().to_string()).collect() };

    Ok(ResolvedNode {
        name: name.to_string(),
        executable: node.executable().to_string(),
        final_algo_config,
        algo_id,
        depends,
        process_id,
        dpath,
        algo_params,
        perf_params: node.resolved_perf_params(),
        root_inputs,
        in_paths,
        out_paths,
        primary_out,
        specified: node.specified_keys(),
        predecessors: names(pipeline.predecessors(name)?),
        successors: names(pipeline.successors(name)?),
    })
}

fn join_output(dpath: &Path, rel: &str) -> PathBuf {
    match rel {
        "" | "." => dpath.to_path_buf(),
        rel => dpath.join(rel),
    }
}

/// Substitute `{root_dpath}`, `{node}`, `{<n>_id}` and `{<n>_algo_id}`
pub fn render_template(
    node: &str,
    template: &str,
    root_dpath: &Path,
    ids: &HashMap<&str, (&str, &str)>,
) -> Result<String, GridflowError> {
    let placeholder = Regex::new(r"\{([^{}]*)\}").map_err(|e| GridflowError::TemplateError {
        node: node.to_string(),
        template: template.to_string(),
        reason: e.to_string(),
    })?;

    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder.captures_iter(template) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        let key = inner.as_str();
        let value = match key {
            "root_dpath" => root_dpath.to_string_lossy().into_owned(),
            "node" => node.to_string(),
            _ => lookup_id(key, ids).ok_or_else(|| GridflowError::TemplateError {
                node: node.to_string(),
                template: template.to_string(),
                reason: format!("unknown placeholder '{{{}}}'", key),
            })?,
        };
        out.push_str(&value);
    }
    out.push_str(&template[last..]);

    if out.contains('{') || out.contains('}') {
        return Err(GridflowError::TemplateError {
            node: node.to_string(),
            template: template.to_string(),
            reason: "unbalanced braces".into(),
        });
    }

    Ok(out)
}

fn lookup_id(key: &str, ids: &HashMap<&str, (&str, &str)>) -> Option<String> {
    if let Some((_, algo_id)) = key.strip_suffix("_algo_id").and_then(|n| ids.get(n)) {
        return Some(algo_id.to_string());
    }
    key.strip_suffix("_id")
        .and_then(|n| ids.get(n))
        .map(|(process_id, _)| process_id.to_string())
}

/// Compare a stored job's identity payload with a freshly resolved one
///
/// Values are compared by canonical hash, so `1` and `1.0` agree.
pub fn verify_identity(
    resolved: &ResolvedNode,
    stored_algo_config: &ParamMap,
    stored_depends: &BTreeMap<String, String>,
) -> Result<(), GridflowError> {
    if hash_params(stored_algo_config) == resolved.algo_id && *stored_depends == resolved.depends {
        return Ok(());
    }
    Err(GridflowError::IdentityCollision {
        node: resolved.name.clone(),
        process_id: resolved.process_id.clone(),
        dpath: resolved.dpath.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{InPaths, NodeSpec};
    use serde_json::json;

    fn pipeline() -> Pipeline {
        let mut a = NodeSpec::new("prep", "prep-cli");
        a.in_paths = InPaths::Keys(vec!["src".into()]);
        a.out_paths.insert("dst".into(), "data.json".into());
        a.algo_params.insert("scale".into(), json!(1));
        a.perf_params.insert("workers".into(), json!(2));

        let mut b = NodeSpec::new("fit", "fit-cli");
        b.in_paths = InPaths::Keys(vec!["data".into()]);
        b.out_paths.insert("model".into(), "model.bin".into());
        b.algo_params.insert("lr".into(), json!(0.1));

        let mut p = Pipeline::with_nodes(
            "demo",
            vec![Node::new(a).unwrap(), Node::new(b).unwrap()],
        )
        .unwrap();
        p.connect_keys("prep.dst", "fit.data").unwrap();
        p
    }

    fn configure(p: &mut Pipeline, entries: &[(&str, &str, Value)]) {
        let mut values: BTreeMap<String, ParamMap> = BTreeMap::new();
        for (node, key, value) in entries {
            values
                .entry(node.to_string())
                .or_default()
                .insert(key.to_string(), value.clone());
        }
        p.configure(&values, &BTreeMap::new()).unwrap();
        p.build().unwrap();
    }

    fn resolve(entries: &[(&str, &str, Value)]) -> ResolvedPipeline {
        let mut p = pipeline();
        configure(&mut p, entries);
        resolve_pipeline(&p, Path::new("/runs")).unwrap()
    }

    #[test]
    fn test_root_inputs_are_identity_relevant() {
        let a = resolve(&[("prep", "src", json!("a.csv"))]);
        let b = resolve(&[("prep", "src", json!("b.csv"))]);
        let prep = a.get("prep").unwrap();
        assert_eq!(prep.final_algo_config["src"], json!("a.csv"));
        assert_ne!(prep.algo_id, b.get("prep").unwrap().algo_id);
        // The change propagates downstream through depends
        assert_eq!(a.get("fit").unwrap().algo_id, b.get("fit").unwrap().algo_id);
        assert_ne!(a.get("fit").unwrap().process_id, b.get("fit").unwrap().process_id);
    }

    #[test]
    fn test_perf_params_and_outputs_are_not_hashed() {
        let base = resolve(&[("prep", "src", json!("a.csv"))]);
        let tweaked = resolve(&[
            ("prep", "src", json!("a.csv")),
            ("prep", "workers", json!(16)),
            ("prep", "dst", json!("other.json")),
        ]);
        assert_eq!(
            base.get("prep").unwrap().process_id,
            tweaked.get("prep").unwrap().process_id
        );
        assert!(tweaked.get("prep").unwrap().primary_out.ends_with("other.json"));
    }

    #[test]
    fn test_equivalent_numbers_share_identity() {
        let a = resolve(&[("prep", "src", json!("a.csv")), ("fit", "lr", json!(1))]);
        let b = resolve(&[("prep", "src", json!("a.csv")), ("fit", "lr", json!(1.0))]);
        assert_eq!(a.get("fit").unwrap().dpath, b.get("fit").unwrap().dpath);
    }

    #[test]
    fn test_default_layout_and_connected_inputs() {
        let r = resolve(&[("prep", "src", json!("a.csv"))]);
        let prep = r.get("prep").unwrap();
        let fit = r.get("fit").unwrap();

        assert_eq!(
            prep.dpath,
            PathBuf::from(format!("/runs/prep/prep_id_{}", prep.process_id))
        );
        assert_eq!(
            fit.in_paths["data"],
            json!(prep.primary_out.to_string_lossy())
        );
        assert!(fit.root_inputs.is_empty());
        assert_eq!(fit.depends.len(), 2);
        assert_eq!(fit.depends["prep"], prep.algo_id);
        assert_eq!(fit.predecessors, vec!["prep"]);
        assert_eq!(prep.successors, vec!["fit"]);
    }

    #[test]
    fn test_template_placeholders() {
        let mut ids = HashMap::new();
        ids.insert("prep", ("pid", "aid"));
        ids.insert("my_node", ("pid2", "aid2"));
        let out = render_template(
            "my_node",
            "{root_dpath}/{node}/{prep_algo_id}/{my_node_id}",
            Path::new("r"),
            &ids,
        )
        .unwrap();
        assert_eq!(out, "r/my_node/aid/pid2");

        let err = render_template("my_node", "{root_dpath}/{bogus}", Path::new("r"), &ids).unwrap_err();
        assert!(matches!(err, GridflowError::TemplateError { .. }));
    }

    #[test]
    fn test_verify_identity() {
        let r = resolve(&[("prep", "src", json!("a.csv"))]);
        let prep = r.get("prep").unwrap();
        verify_identity(prep, &prep.final_algo_config, &prep.depends).unwrap();

        let mut other = prep.final_algo_config.clone();
        other.insert("scale".into(), json!(7));
        assert!(matches!(
            verify_identity(prep, &other, &prep.depends),
            Err(GridflowError::IdentityCollision { .. })
        ));
    }
}
