// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Job records and run-directory files
//!
//! `job_config.json` is written once, atomically, when a job directory is
//! first materialized and is never rewritten afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::GridflowError;
use crate::identity::{ResolvedNode, ResolvedPipeline};
use crate::pipeline::ParamMap;

/// File name of the job record inside a job directory
pub const JOB_RECORD_FNAME: &str = "job_config.json";

/// File name of the standalone invocation script
pub const INVOKE_FNAME: &str = "invoke.sh";

/// Parameters of one node as they applied to a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    #[serde(default)]
    pub algo_params: ParamMap,
    #[serde(default)]
    pub perf_params: ParamMap,
    /// Literal values of unconnected inputs
    #[serde(default)]
    pub in_paths: ParamMap,
    /// Keys set explicitly by the grid
    #[serde(default)]
    pub specified: BTreeSet<String>,
}

/// Persisted description of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub node: String,
    pub process_id: String,
    pub algo_id: String,
    pub depends: BTreeMap<String, String>,
    /// Hashed identity payload
    pub algo_config: ParamMap,
    /// The node and all its ancestors
    pub lineage: BTreeMap<String, LineageEntry>,
    pub out_paths: BTreeMap<String, PathBuf>,
    pub primary_out: PathBuf,
    pub command: String,
    #[serde(default)]
    pub execution_options: ParamMap,
    pub created: SystemTime,
}

impl JobRecord {
    /// Build the record for `node` from its resolved configuration
    pub fn new(
        resolved: &ResolvedPipeline,
        node: &ResolvedNode,
        command: &str,
        execution_options: &ParamMap,
    ) -> Self {
        let lineage = node
            .depends
            .keys()
            .filter_map(|name| resolved.get(name))
            .map(|n| {
                (
                    n.name.clone(),
                    LineageEntry {
                        algo_params: n.algo_params.clone(),
                        perf_params: n.perf_params.clone(),
                        in_paths: n.root_inputs.clone(),
                        specified: n.specified.clone(),
                    },
                )
            })
            .collect();

        Self {
            node: node.name.clone(),
            process_id: node.process_id.clone(),
            algo_id: node.algo_id.clone(),
            depends: node.depends.clone(),
            algo_config: node.final_algo_config.clone(),
            lineage,
            out_paths: node.out_paths.clone(),
            primary_out: node.primary_out.clone(),
            command: command.to_string(),
            execution_options: execution_options.clone(),
            created: SystemTime::now(),
        }
    }

    /// Path of the record inside a job directory
    pub fn path_in(dpath: &Path) -> PathBuf {
        dpath.join(JOB_RECORD_FNAME)
    }

    /// Load a record from a job directory or a record file path
    pub fn load(path: &Path) -> Result<Self, GridflowError> {
        let file = if path.is_dir() {
            Self::path_in(path)
        } else {
            path.to_path_buf()
        };
        let content =
            std::fs::read_to_string(&file).map_err(|e| GridflowError::read_failed(&file, e))?;
        serde_json::from_str(&content).map_err(|e| GridflowError::ResultLoad {
            dpath: file.clone(),
            reason: format!("malformed job record: {}", e),
        })
    }

    /// Write the record unless one already exists; returns whether it wrote
    pub fn write_once(&self, dpath: &Path) -> Result<bool, GridflowError> {
        let path = Self::path_in(dpath);
        if path.exists() {
            return Ok(false);
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_write_bytes(&path, &bytes)?;
        Ok(true)
    }
}

/// Write a file through a temporary sibling and a rename
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), GridflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GridflowError::write_failed(parent, e))?;
    }

    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, std::process::id(), stamp));

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        GridflowError::write_failed(path, e)
    })
}

/// Write `invoke.sh` so a job can be re-run by hand
pub fn write_invoke_script(dpath: &Path, command: &str) -> Result<PathBuf, GridflowError> {
    let path = dpath.join(INVOKE_FNAME);
    let content = format!("#!/usr/bin/env bash\n{}\n", command);
    atomic_write_bytes(&path, content.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| GridflowError::write_failed(&path, e))?;
    }

    Ok(path)
}

/// Create `.pred/<node>/<id>` and `.succ/<node>/<id>` entries for a job
///
/// Each predecessor also gains a `.succ` entry pointing back at this job, so
/// a reused upstream directory lists every downstream run that consumed it.
/// Entries are symlinks to the neighbouring job directories where the
/// platform supports them, otherwise small files holding the target path.
pub fn write_links(resolved: &ResolvedPipeline, node: &ResolvedNode) -> Result<(), GridflowError> {
    for name in &node.predecessors {
        let Some(pred) = resolved.get(name) else {
            continue;
        };
        make_link(&pred.dpath, &link_path(&node.dpath, ".pred", pred))?;
        make_link(&node.dpath, &link_path(&pred.dpath, ".succ", node))?;
    }

    for name in &node.successors {
        let Some(succ) = resolved.get(name) else {
            continue;
        };
        make_link(&succ.dpath, &link_path(&node.dpath, ".succ", succ))?;
    }
    Ok(())
}

fn link_path(dpath: &Path, kind: &str, other: &ResolvedNode) -> PathBuf {
    dpath.join(kind).join(&other.name).join(&other.process_id)
}

fn make_link(target: &Path, link: &Path) -> Result<(), GridflowError> {
    if link.symlink_metadata().is_ok() {
        return Ok(());
    }
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GridflowError::write_failed(parent, e))?;
    }

    #[cfg(unix)]
    {
        let target = std::path::absolute(target).unwrap_or_else(|_| target.to_path_buf());
        std::os::unix::fs::symlink(&target, link).map_err(|e| GridflowError::write_failed(link, e))
    }

    #[cfg(not(unix))]
    {
        atomic_write_bytes(link, target.to_string_lossy().as_bytes())
    }
}
