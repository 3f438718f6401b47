// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Pipeline validation
//!
//! Validates a pipeline definition before any grid is expanded against it.
//! Unlike [`PipelineDefinition::instantiate`], which stops at the first
//! problem, the validator collects everything it can find.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::errors::GridflowError;
use crate::pipeline::{Node, PipelineDefinition};

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline definition
    pub fn validate(def: &PipelineDefinition) -> ValidationResult {
        let mut result = ValidationResult::new();

        if def.nodes.is_empty() {
            result.add_error("Pipeline has no nodes defined");
            return result;
        }

        // Duplicate names
        let mut seen_names = HashSet::new();
        for spec in &def.nodes {
            if !seen_names.insert(spec.name.as_str()) {
                result.add_error(&format!("Duplicate node name: '{}'", spec.name));
            }
        }

        // Per-node structure
        let mut nodes: HashMap<&str, Node> = HashMap::new();
        for spec in &def.nodes {
            match Node::new(spec.clone()) {
                Ok(node) => {
                    nodes.insert(spec.name.as_str(), node);
                }
                Err(e) => result.add_error(&e.to_string()),
            }
        }

        // Connections
        let mut bound: HashMap<&str, &str> = HashMap::new();
        for conn in &def.connections {
            Self::validate_endpoint(&conn.from, true, &nodes, &mut result);
            Self::validate_endpoint(&conn.to, false, &nodes, &mut result);

            if let Some(previous) = bound.insert(conn.to.as_str(), conn.from.as_str()) {
                result.add_error(&format!(
                    "Input '{}' is connected to both '{}' and '{}'",
                    conn.to, previous, conn.from
                ));
            }
        }

        // Inputs that must come from the grid
        for spec in &def.nodes {
            let Some(node) = nodes.get(spec.name.as_str()) else {
                continue;
            };
            for key in node.in_path_keys() {
                let dotted = format!("{}.{}", node.name(), key);
                if !bound.contains_key(dotted.as_str()) && node.in_path_value(key).is_none() {
                    result.add_warning(&format!(
                        "Input '{}' is unconnected and has no default; the grid must supply it",
                        dotted
                    ));
                }
            }
        }

        // Cycles can only be checked once everything above is sound
        if result.is_valid() {
            match def.instantiate() {
                Ok(_) => {}
                Err(GridflowError::CyclicGraph { cycle }) => {
                    result.add_error(&format!("Cyclic dependency: {}", cycle.join(" -> ")));
                }
                Err(e) => result.add_error(&format!("Graph validation error: {}", e)),
            }
        }

        result
    }

    fn validate_endpoint(
        dotted: &str,
        is_source: bool,
        nodes: &HashMap<&str, Node>,
        result: &mut ValidationResult,
    ) {
        let Some((node_name, key)) = dotted.split_once('.') else {
            result.add_error(&format!("Connection endpoint '{}' is not <node>.<key>", dotted));
            return;
        };

        let Some(node) = nodes.get(node_name) else {
            result.add_error(&format!("Connection references unknown node '{}'", node_name));
            return;
        };

        let port = if is_source {
            node.output(key)
        } else {
            node.input(key)
        };
        if let Err(e) = port {
            result.add_error(&e.to_string());
        }
    }

    /// Check that each node's program can be found (runtime validation)
    ///
    /// The first word of the executable is looked up on `PATH`, then relative
    /// to `base_path`.
    pub fn validate_executables(def: &PipelineDefinition, base_path: &Path) -> Vec<String> {
        let mut missing = Vec::new();

        for spec in &def.nodes {
            let Some(program) = spec.executable.split_whitespace().next() else {
                continue;
            };
            if which::which(program).is_ok() || base_path.join(program).exists() {
                continue;
            }
            missing.push(format!(
                "Node '{}': program '{}' not found",
                spec.name, program
            ));
        }

        missing
    }
}

/// Result of pipeline validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    pub fn add_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ConnectionSpec, InPaths, NodeSpec};

    fn spec(name: &str, inputs: &[&str]) -> NodeSpec {
        let mut spec = NodeSpec::new(name, "bash");
        spec.in_paths = InPaths::Keys(inputs.iter().map(|s| s.to_string()).collect());
        spec.out_paths.insert("out".into(), "out.txt".into());
        spec
    }

    fn def(nodes: Vec<NodeSpec>, connections: &[(&str, &str)]) -> PipelineDefinition {
        PipelineDefinition {
            version: "1".into(),
            name: "test".into(),
            description: None,
            nodes,
            connections: connections
                .iter()
                .map(|(from, to)| ConnectionSpec {
                    from: from.to_string(),
                    to: to.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_validate_empty_pipeline() {
        let result = PipelineValidator::validate(&def(vec![], &[]));
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("no nodes"));
    }

    #[test]
    fn test_validate_duplicate_names() {
        let result = PipelineValidator::validate(&def(vec![spec("a", &[]), spec("a", &[])], &[]));
        assert!(result.errors.iter().any(|e| e.contains("Duplicate")));
    }

    #[test]
    fn test_unconnected_root_input_is_a_warning() {
        let result = PipelineValidator::validate(&def(
            vec![spec("a", &["src"]), spec("b", &["x"])],
            &[("a.out", "b.x")],
        ));
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("a.src"));
    }

    #[test]
    fn test_unknown_port_and_double_binding() {
        let result = PipelineValidator::validate(&def(
            vec![spec("a", &[]), spec("b", &[]), spec("c", &["x"])],
            &[("a.out", "c.x"), ("b.out", "c.x"), ("a.nope", "c.x")],
        ));
        assert!(result.errors.iter().any(|e| e.contains("no output port 'nope'")));
        assert!(result.errors.iter().any(|e| e.contains("connected to both")));
    }

    #[test]
    fn test_cycle_reported() {
        let result = PipelineValidator::validate(&def(
            vec![spec("a", &["x"]), spec("b", &["x"])],
            &[("a.out", "b.x"), ("b.out", "a.x")],
        ));
        assert!(result.errors.iter().any(|e| e.contains("Cyclic dependency: a -> b -> a")));
    }

    #[test]
    fn test_missing_executable() {
        let mut missing = spec("a", &[]);
        missing.executable = "definitely-not-a-real-program-xyz --flag".into();
        let dir = tempfile::tempdir().unwrap();
        let problems = PipelineValidator::validate_executables(&def(vec![missing], &[]), dir.path());
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("definitely-not-a-real-program-xyz"));
    }
}
