// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Tool configuration
//!
//! Settings come from `gridflow.toml` files layered on top of built-in
//! defaults. Later layers override earlier ones key by key; tables merge.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::backends::BackendKind;
use crate::cache::DEFAULT_CACHE_DIR;
use crate::errors::GridflowError;
use crate::pipeline::ParamMap;

/// Name of the project configuration file
pub const CONFIG_FNAME: &str = "gridflow.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridflowConfig {
    /// Root directory for job directories
    pub root_dpath: PathBuf,
    pub backend: BackendKind,
    pub skip_existing: bool,
    /// Compare stored job records against the current configuration
    pub verify_identity: bool,
    pub tmux: TmuxConfig,
    /// Site-wide slurm options, lowest precedence
    pub slurm: ParamMap,
    pub aggregate: AggregateConfig,
}

impl Default for GridflowConfig {
    fn default() -> Self {
        Self {
            root_dpath: PathBuf::from("results"),
            backend: BackendKind::Serial,
            skip_existing: true,
            verify_identity: false,
            tmux: TmuxConfig::default(),
            slurm: ParamMap::new(),
            aggregate: AggregateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmuxConfig {
    /// Number of parallel queues
    pub size: usize,
    pub session: String,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            size: 4,
            session: "gridflow".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub ignore_columns: Vec<String>,
    pub path_columns: Vec<String>,
    pub top_k: usize,
    /// Use the row cache
    pub cache: bool,
    pub cache_dir: PathBuf,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            ignore_columns: Vec::new(),
            path_columns: Vec::new(),
            top_k: 10,
            cache: true,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

impl GridflowConfig {
    /// Per-user configuration file, if the platform has a config directory
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "gridflow").map(|dirs| dirs.config_dir().join(CONFIG_FNAME))
    }

    /// Load user, project and explicit configuration, in that order
    ///
    /// The user and project files are optional; an explicit file must exist.
    pub fn load(base_dir: &Path, explicit: Option<&Path>) -> Result<Self, GridflowError> {
        let mut layers: Vec<PathBuf> = Self::user_config_path().into_iter().collect();
        layers.push(base_dir.join(CONFIG_FNAME));

        if let Some(path) = explicit {
            if !path.exists() {
                return Err(GridflowError::Config {
                    message: format!("Config file not found: {}", path.display()),
                });
            }
            layers.push(path.to_path_buf());
        }

        Self::load_layers(&layers)
    }

    /// Merge the existing files among `layers` over the defaults
    pub fn load_layers(layers: &[PathBuf]) -> Result<Self, GridflowError> {
        let mut merged = toml::Table::new();
        for path in layers.iter().filter(|p| p.is_file()) {
            debug!("Loading config layer {}", path.display());
            let content = std::fs::read_to_string(path)
                .map_err(|e| GridflowError::read_failed(path, e))?;
            let table: toml::Table = content.parse().map_err(|e: toml::de::Error| {
                GridflowError::Config {
                    message: format!("{}: {}", path.display(), e),
                }
            })?;
            merge_tables(&mut merged, table);
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| GridflowError::Config {
                message: e.to_string(),
            })
    }

    pub fn from_toml(content: &str) -> Result<Self, GridflowError> {
        Ok(toml::from_str(content)?)
    }
}

/// Deep-merge `overlay` into `base`
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = GridflowConfig::from_toml("").unwrap();
        assert_eq!(config, GridflowConfig::default());
        assert!(config.skip_existing);
        assert_eq!(config.tmux.size, 4);
        assert_eq!(config.aggregate.top_k, 10);
    }

    #[test]
    fn test_parse_full_config() {
        let config = GridflowConfig::from_toml(
            r#"
root_dpath = "/scratch/runs"
backend = "slurm"
skip_existing = false

[tmux]
size = 8

[slurm]
account = "lab"
exclusive = true

[aggregate]
ignore_columns = ["params.*.workers"]
cache = false
"#,
        )
        .unwrap();

        assert_eq!(config.root_dpath, PathBuf::from("/scratch/runs"));
        assert_eq!(config.backend, BackendKind::Slurm);
        assert!(!config.skip_existing);
        assert_eq!(config.tmux.size, 8);
        assert_eq!(config.tmux.session, "gridflow");
        assert_eq!(config.slurm["account"], json!("lab"));
        assert_eq!(config.slurm["exclusive"], json!(true));
        assert_eq!(config.aggregate.ignore_columns, vec!["params.*.workers"]);
        assert!(!config.aggregate.cache);
    }

    #[test]
    fn test_layers_merge_tables() {
        let dir = TempDir::new().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("project.toml");
        std::fs::write(&user, "backend = \"tmux\"\n[tmux]\nsize = 2\nsession = \"mine\"\n").unwrap();
        std::fs::write(&project, "[tmux]\nsize = 6\n").unwrap();

        let config = GridflowConfig::load_layers(&[
            user,
            dir.path().join("missing.toml"),
            project,
        ])
        .unwrap();

        assert_eq!(config.backend, BackendKind::Tmux);
        assert_eq!(config.tmux.size, 6);
        assert_eq!(config.tmux.session, "mine");
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = TempDir::new().unwrap();
        let result = GridflowConfig::load(dir.path(), Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(GridflowError::Config { .. })));
    }

    #[test]
    fn test_invalid_backend_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FNAME);
        std::fs::write(&path, "backend = \"pbs\"\n").unwrap();
        assert!(matches!(
            GridflowConfig::load_layers(&[path]),
            Err(GridflowError::Config { .. })
        ));
    }
}
