// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! slurm backend
//!
//! Renders one `sbatch --parsable` line per job into `submit.sh`. Each line
//! captures the job id in a shell variable that later lines reference in
//! `--dependency=afterok:`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

use super::{program_available, Backend, FinishReport, JobRequest, SubmissionToken};
use crate::errors::GridflowError;
use crate::pipeline::ParamMap;
use crate::schedule::{argument_text, atomic_write_bytes, shell_quote};

/// slurm backend
pub struct SlurmBackend {
    /// Site defaults placed beneath every job's own options
    defaults: ParamMap,
    script_dpath: PathBuf,
    lines: Vec<String>,
}

impl SlurmBackend {
    pub fn new(defaults: ParamMap, script_dpath: &Path) -> Self {
        Self {
            defaults,
            script_dpath: std::path::absolute(script_dpath)
                .unwrap_or_else(|_| script_dpath.to_path_buf()),
            lines: Vec::new(),
        }
    }

    fn render(&self, var: &str, job: &JobRequest) -> String {
        let mut options: BTreeMap<String, Value> = BTreeMap::new();
        for (key, value) in self.defaults.iter().chain(job.execution_options.iter()) {
            options.insert(key.replace('_', "-"), value.clone());
        }

        let mut args = vec!["sbatch".to_string(), "--parsable".to_string()];
        let builtins = [
            ("job-name", job.name.clone()),
            (
                "output",
                job.dpath.join("slurm-%j.out").to_string_lossy().into_owned(),
            ),
            ("chdir", job.dpath.to_string_lossy().into_owned()),
        ];
        // Options of the same name replace the built-in value
        for (flag, value) in builtins {
            if !options.contains_key(flag) {
                args.push(format!("--{}={}", flag, shell_quote(&value)));
            }
        }

        if !job.depends_on.is_empty() {
            let ids: Vec<String> = job.depends_on.iter().map(|t| format!("${{{}}}", t)).collect();
            args.push(format!("--dependency=afterok:{}", ids.join(":")));
        }

        for (flag, value) in &options {
            match value {
                Value::Null | Value::Bool(false) => {}
                Value::Bool(true) => args.push(format!("--{}", flag)),
                other => args.push(format!("--{}={}", flag, shell_quote(&argument_text(other)))),
            }
        }

        args.push(format!("--wrap={}", shell_quote(&job.command)));
        format!("{}=$({})", var, args.join(" "))
    }
}

#[async_trait]
impl Backend for SlurmBackend {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn submit(&mut self, job: &JobRequest) -> Result<SubmissionToken, GridflowError> {
        let var = format!("JOB_{:04}", self.lines.len());
        let line = self.render(&var, job);
        self.lines.push(format!("# {}\n{}", job.name, line));
        Ok(SubmissionToken(var))
    }

    async fn finish(&mut self, run: bool) -> Result<FinishReport, GridflowError> {
        if self.lines.is_empty() {
            return Ok(FinishReport::default());
        }

        let script = self.script_dpath.join("submit.sh");
        let mut content = String::from("#!/usr/bin/env bash\nset -e\n\n");
        content.push_str(&self.lines.join("\n\n"));
        content.push('\n');
        atomic_write_bytes(&script, content.as_bytes())?;
        info!(script = %script.display(), jobs = self.lines.len(), "wrote slurm submission script");

        let mut launched = false;
        if run {
            if !self.check_available().await? {
                return Err(GridflowError::backend_unavailable("slurm", "sbatch"));
            }
            let status = Command::new("bash").arg(&script).status().await?;
            if !status.success() {
                return Err(GridflowError::Submission {
                    backend: "slurm".to_string(),
                    node: script.display().to_string(),
                    reason: format!("submit script exited with {}", status),
                });
            }
            launched = true;
        }

        Ok(FinishReport {
            script: Some(script),
            jobs: self.lines.len(),
            launched,
        })
    }

    async fn check_available(&self) -> Result<bool, GridflowError> {
        Ok(program_available("sbatch"))
    }
}
