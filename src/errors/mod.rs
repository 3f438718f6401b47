// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Error types
//!
//! Structural errors (graph, grid) abort a whole operation. Per-job errors
//! (`Submission`, `IdentityCollision`) are isolated to one configuration's
//! downstream closure by the scheduler, and `ResultLoad` only drops a single
//! aggregation row.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for gridflow operations
pub type GridflowResult<T> = Result<T, GridflowError>;

/// Main error type for gridflow
#[derive(Error, Debug, Diagnostic)]
pub enum GridflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Graph Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Cyclic pipeline graph: {}", .cycle.join(" -> "))]
    #[diagnostic(
        code(gridflow::cyclic_graph),
        help("Remove one of the connections between the listed nodes")
    )]
    CyclicGraph { cycle: Vec<String> },

    #[error("Input '{port}' of node '{node}' is not connected and has no value")]
    #[diagnostic(
        code(gridflow::unbound_input),
        help("Connect it to an upstream output or give '{node}.{port}' a value in the grid matrix")
    )]
    UnboundInput { node: String, port: String },

    #[error("Input '{node}.{port}' is already connected to '{source_port}'")]
    #[diagnostic(
        code(gridflow::port_already_bound),
        help("An input port accepts exactly one source")
    )]
    PortAlreadyBound {
        node: String,
        port: String,
        source_port: String,
    },

    #[error("Cannot connect '{from}' to '{to}': {reason}")]
    #[diagnostic(
        code(gridflow::port_type),
        help("Connections always go from an output port to an input port")
    )]
    PortTypeError {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Node '{node}' has no {direction} port '{port}'")]
    #[diagnostic(code(gridflow::unknown_port))]
    UnknownPort {
        node: String,
        port: String,
        direction: String,
    },

    #[error("Node '{node}' not found in pipeline")]
    #[diagnostic(code(gridflow::unknown_node))]
    UnknownNode { node: String },

    #[error("Node '{node}' is invalid: {reason}")]
    #[diagnostic(code(gridflow::invalid_node))]
    InvalidNode { node: String, reason: String },

    #[error("Invalid pipeline definition: {reason}")]
    #[diagnostic(code(gridflow::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Bad directory template '{template}' for node '{node}': {reason}")]
    #[diagnostic(
        code(gridflow::template),
        help("Available placeholders: {{root_dpath}}, {{node}}, {{<node>_id}}, {{<node>_algo_id}} for the node and its ancestors")
    )]
    TemplateError {
        node: String,
        template: String,
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Grid Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Cannot expand grid dimension '{dimension}': {reason}")]
    #[diagnostic(code(gridflow::grid_expansion))]
    GridExpansion { dimension: String, reason: String },

    #[error("Grid file not found: {path}")]
    #[diagnostic(code(gridflow::grid_not_found))]
    GridNotFound { path: PathBuf },

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Identity collision at {dpath}: stored configuration differs from '{node}' {process_id}")]
    #[diagnostic(
        code(gridflow::identity_collision),
        help("Two different configurations hashed to the same directory; inspect the stored job_config.json")
    )]
    IdentityCollision {
        node: String,
        process_id: String,
        dpath: PathBuf,
    },

    #[error("Backend '{backend}' rejected job for node '{node}': {reason}")]
    #[diagnostic(code(gridflow::submission))]
    Submission {
        backend: String,
        node: String,
        reason: String,
    },

    #[error("Backend '{backend}' is not available")]
    #[diagnostic(code(gridflow::backend_unavailable))]
    BackendUnavailable {
        backend: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Aggregation Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to load result from {dpath}: {reason}")]
    #[diagnostic(code(gridflow::result_load))]
    ResultLoad { dpath: PathBuf, reason: String },

    #[error("Cache error: {message}")]
    #[diagnostic(code(gridflow::cache_error))]
    CacheError { message: String },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(gridflow::config))]
    Config { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(gridflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(gridflow::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(gridflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(gridflow::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(gridflow::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(gridflow::toml_error))]
    Toml { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(gridflow::glob_error))]
    GlobPattern { message: String },
}

impl From<std::io::Error> for GridflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for GridflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for GridflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for GridflowError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl From<glob::PatternError> for GridflowError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

impl GridflowError {
    /// Whether this error invalidates the whole plan rather than one job
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::CyclicGraph { .. }
                | Self::UnboundInput { .. }
                | Self::PortAlreadyBound { .. }
                | Self::PortTypeError { .. }
                | Self::UnknownPort { .. }
                | Self::UnknownNode { .. }
                | Self::InvalidNode { .. }
                | Self::InvalidPipeline { .. }
                | Self::TemplateError { .. }
                | Self::GridExpansion { .. }
        )
    }

    /// Create a backend-unavailable error with an install hint
    pub fn backend_unavailable(backend: &str, program: &str) -> Self {
        Self::BackendUnavailable {
            backend: backend.to_string(),
            help: Some(format!(
                "'{}' was not found in PATH; use --dry-run or the serial backend",
                program
            )),
        }
    }

    /// Wrap a read failure with its path
    pub fn read_failed(path: &std::path::Path, e: impl std::fmt::Display) -> Self {
        Self::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        }
    }

    /// Wrap a write failure with its path
    pub fn write_failed(path: &std::path::Path, e: impl std::fmt::Display) -> Self {
        Self::FileWriteError {
            path: path.to_path_buf(),
            error: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_members() {
        let err = GridflowError::CyclicGraph {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic pipeline graph: a -> b -> a");
        assert!(err.is_structural());
    }

    #[test]
    fn test_submission_is_not_structural() {
        let err = GridflowError::Submission {
            backend: "serial".into(),
            node: "predict".into(),
            reason: "exit code 1".into(),
        };
        assert!(!err.is_structural());
    }
}
