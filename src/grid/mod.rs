// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Parameter grid specification
//!
//! A grid file names a pipeline and a `matrix` of dotted `node.param`
//! dimensions:
//!
//! ```yaml
//! pipeline: pipeline.yaml
//! root_dpath: results
//! matrix:
//!   predict.src_fpath: [a.json, b.json]
//!   predict.threshold: [0.1, 0.5]
//!   predict.__slurm_options__: {gres: "gpu:1"}
//! __slurm_options__:
//!   time: "02:00:00"
//! ```

mod expand;

pub use expand::{expand_grid, expand_matrix, Configuration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::errors::GridflowError;
use crate::pipeline::ParamMap;

/// One matrix or a list of matrices expanded one after another
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Matrix {
    One(Map<String, Value>),
    Many(Vec<Map<String, Value>>),
}

impl Default for Matrix {
    fn default() -> Self {
        Self::One(Map::new())
    }
}

impl Matrix {
    pub fn parts(&self) -> Vec<&Map<String, Value>> {
        match self {
            Self::One(m) => vec![m],
            Self::Many(ms) => ms.iter().collect(),
        }
    }
}

/// Grid file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSpec {
    /// Pipeline definition path, relative to the grid file
    pub pipeline: PathBuf,

    #[serde(default)]
    pub matrix: Matrix,

    #[serde(default)]
    pub root_dpath: Option<PathBuf>,

    /// Global execution overlay applied to every node
    #[serde(
        default,
        rename = "__slurm_options__",
        alias = "__execution_options__"
    )]
    pub execution_options: ParamMap,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl GridSpec {
    /// Load a grid from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, GridflowError> {
        if !path.exists() {
            return Err(GridflowError::GridNotFound {
                path: path.to_path_buf(),
            });
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| GridflowError::read_failed(path, e))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_yaml(&content, base_dir)
    }

    /// Parse a grid from YAML, resolving relative paths against `base_dir`
    pub fn from_yaml(yaml: &str, base_dir: impl Into<PathBuf>) -> Result<Self, GridflowError> {
        let mut spec: Self = serde_yaml::from_str(yaml)?;
        spec.base_dir = base_dir.into();
        Ok(spec)
    }

    /// Location of the pipeline definition
    pub fn pipeline_path(&self) -> PathBuf {
        self.base_dir.join(&self.pipeline)
    }

    /// Location of the result tree, if the grid names one
    pub fn root_dpath(&self) -> Option<PathBuf> {
        self.root_dpath.as_ref().map(|p| self.base_dir.join(p))
    }
}
