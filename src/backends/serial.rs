// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Serial backend
//!
//! Runs each job to completion in its own directory as soon as it is
//! submitted, so dependencies are always satisfied by the time a job starts.

use async_trait::async_trait;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info};

use super::{program_available, Backend, FinishReport, JobRequest, SubmissionToken};
use crate::errors::GridflowError;

/// Serial backend
pub struct SerialBackend {
    shell: String,
    jobs: usize,
}

impl SerialBackend {
    /// Create a new serial backend
    pub fn new() -> Self {
        Self {
            shell: "bash".to_string(),
            jobs: 0,
        }
    }
}

impl Default for SerialBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for SerialBackend {
    fn name(&self) -> &str {
        "serial"
    }

    async fn submit(&mut self, job: &JobRequest) -> Result<SubmissionToken, GridflowError> {
        let fail = |reason: String| GridflowError::Submission {
            backend: "serial".to_string(),
            node: job.node.clone(),
            reason,
        };

        tokio::fs::create_dir_all(&job.dpath)
            .await
            .map_err(|e| GridflowError::write_failed(&job.dpath, e))?;

        info!(job = %job.name, "running");
        let start = Instant::now();

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&job.command)
            .current_dir(&job.dpath)
            .output()
            .await
            .map_err(|e| fail(format!("could not start {}: {}", self.shell, e)))?;

        debug!(
            job = %job.name,
            seconds = start.elapsed().as_secs_f64(),
            "finished"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.lines().last().unwrap_or("").trim().to_string();
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(fail(if tail.is_empty() {
                format!("exit code {}", code)
            } else {
                format!("exit code {}: {}", code, tail)
            }));
        }

        self.jobs += 1;
        Ok(SubmissionToken(job.name.clone()))
    }

    async fn finish(&mut self, _run: bool) -> Result<FinishReport, GridflowError> {
        Ok(FinishReport {
            script: None,
            jobs: self.jobs,
            launched: self.jobs > 0,
        })
    }

    async fn check_available(&self) -> Result<bool, GridflowError> {
        Ok(program_available(&self.shell))
    }
}
