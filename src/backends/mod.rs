// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Execution backends
//!
//! A backend receives jobs in dependency order and returns a token per job.
//! Later jobs name the tokens of the jobs they depend on. The serial backend
//! runs each job as it arrives; tmux and slurm accumulate a job graph and
//! write a driver script on [`Backend::finish`].

mod serial;
mod slurm;
mod tmux;

pub use serial::SerialBackend;
pub use slurm::SlurmBackend;
pub use tmux::TmuxBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::GridflowConfig;
use crate::errors::GridflowError;
use crate::pipeline::ParamMap;

/// Handle a backend returns for a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionToken(pub String);

impl fmt::Display for SubmissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a backend needs to run one job
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Unique job name (`<node>_<process_id>`)
    pub name: String,
    pub node: String,
    /// Fully rendered shell command
    pub command: String,
    /// Tokens of jobs that must finish first
    pub depends_on: Vec<SubmissionToken>,
    /// Merged execution options
    pub execution_options: ParamMap,
    /// Job directory (working directory of the command)
    pub dpath: PathBuf,
    /// File whose existence marks the job done
    pub primary_out: PathBuf,
}

/// What a backend did when the pass ended
#[derive(Debug, Clone, Default)]
pub struct FinishReport {
    /// Driver script written for deferred backends
    pub script: Option<PathBuf>,
    pub jobs: usize,
    /// Whether the driver script was executed
    pub launched: bool,
}

/// Trait for execution backends
#[async_trait]
pub trait Backend: Send {
    /// Backend name, as used in configuration
    fn name(&self) -> &str;

    /// Submit a job whose dependencies were all submitted earlier
    async fn submit(&mut self, job: &JobRequest) -> Result<SubmissionToken, GridflowError>;

    /// Flush accumulated work; `run` executes the driver script if there is one
    async fn finish(&mut self, run: bool) -> Result<FinishReport, GridflowError>;

    /// Check if the backend's external tool is available
    async fn check_available(&self) -> Result<bool, GridflowError>;
}

/// Backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Serial,
    Tmux,
    Slurm,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Tmux => write!(f, "tmux"),
            Self::Slurm => write!(f, "slurm"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "tmux" => Ok(Self::Tmux),
            "slurm" => Ok(Self::Slurm),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Create the configured backend; driver scripts go under `script_dpath`
pub fn create_backend(
    kind: BackendKind,
    config: &GridflowConfig,
    script_dpath: &Path,
) -> Box<dyn Backend> {
    match kind {
        BackendKind::Serial => Box::new(SerialBackend::new()),
        BackendKind::Tmux => Box::new(TmuxBackend::new(
            &config.tmux.session,
            config.tmux.size,
            script_dpath,
        )),
        BackendKind::Slurm => Box::new(SlurmBackend::new(config.slurm.clone(), script_dpath)),
    }
}

/// Whether a program is on `PATH`
pub(crate) fn program_available(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("SLURM".parse::<BackendKind>().unwrap(), BackendKind::Slurm);
        assert!("pbs".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Tmux.to_string(), "tmux");
    }

    #[test]
    fn test_create_backend_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let config = GridflowConfig::default();
        for kind in [BackendKind::Serial, BackendKind::Tmux, BackendKind::Slurm] {
            let backend = create_backend(kind, &config, dir.path());
            assert_eq!(backend.name(), kind.to_string());
        }
    }
}
