// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! tmux backend
//!
//! Spreads jobs over a fixed number of queues. A job joins the queue of its
//! first dependency, otherwise the shortest queue. Dependencies living in a
//! different queue are awaited through `.done` marker files. Each queue
//! becomes one window of a single tmux session.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use super::{program_available, Backend, FinishReport, JobRequest, SubmissionToken};
use crate::errors::GridflowError;
use crate::schedule::{atomic_write_bytes, shell_quote};

#[derive(Debug, Clone)]
struct QueuedJob {
    name: String,
    command: String,
    dpath: PathBuf,
    waits_on: Vec<PathBuf>,
    marker: PathBuf,
}

/// tmux backend
pub struct TmuxBackend {
    session: String,
    script_dpath: PathBuf,
    queues: Vec<Vec<QueuedJob>>,
    queue_of: HashMap<SubmissionToken, usize>,
}

impl TmuxBackend {
    pub fn new(session: &str, size: usize, script_dpath: &Path) -> Self {
        Self {
            session: session.to_string(),
            script_dpath: std::path::absolute(script_dpath)
                .unwrap_or_else(|_| script_dpath.to_path_buf()),
            queues: vec![Vec::new(); size.max(1)],
            queue_of: HashMap::new(),
        }
    }

    fn marker_path(&self, token: &SubmissionToken) -> PathBuf {
        self.script_dpath.join("markers").join(format!("{}.done", token))
    }

    fn queue_script(&self, jobs: &[QueuedJob]) -> String {
        let mut out = String::from("#!/usr/bin/env bash\nset -e\n");
        for job in jobs {
            out.push_str(&format!("\n# {}\n", job.name));
            for marker in &job.waits_on {
                out.push_str(&format!(
                    "while [ ! -f {} ]; do sleep 1; done\n",
                    shell_quote(&marker.to_string_lossy())
                ));
            }
            out.push_str(&format!(
                "(cd {} && {})\n",
                shell_quote(&job.dpath.to_string_lossy()),
                job.command
            ));
            out.push_str(&format!(
                "touch {}\n",
                shell_quote(&job.marker.to_string_lossy())
            ));
        }
        out
    }

    fn driver_script(&self, scripts: &[PathBuf]) -> String {
        let mut out = String::from("#!/usr/bin/env bash\nset -e\n");
        let session = shell_quote(&self.session);
        for (i, script) in scripts.iter().enumerate() {
            let run = shell_quote(&format!("bash {}", shell_quote(&script.to_string_lossy())));
            if i == 0 {
                out.push_str(&format!(
                    "tmux new-session -d -s {} -n queue_{} {}\n",
                    session, i, run
                ));
            } else {
                out.push_str(&format!(
                    "tmux new-window -t {} -n queue_{} {}\n",
                    session, i, run
                ));
            }
        }
        out
    }
}

#[async_trait]
impl Backend for TmuxBackend {
    fn name(&self) -> &str {
        "tmux"
    }

    async fn submit(&mut self, job: &JobRequest) -> Result<SubmissionToken, GridflowError> {
        let token = SubmissionToken(job.name.clone());

        let queue = job
            .depends_on
            .first()
            .and_then(|dep| self.queue_of.get(dep).copied())
            .unwrap_or_else(|| {
                (0..self.queues.len())
                    .min_by_key(|&i| self.queues[i].len())
                    .unwrap_or(0)
            });

        let waits_on = job
            .depends_on
            .iter()
            .filter(|dep| self.queue_of.get(*dep) != Some(&queue))
            .map(|dep| self.marker_path(dep))
            .collect();

        let marker = self.marker_path(&token);

        debug!(job = %job.name, queue, "queued");
        self.queues[queue].push(QueuedJob {
            name: job.name.clone(),
            command: job.command.clone(),
            dpath: job.dpath.clone(),
            waits_on,
            marker,
        });
        self.queue_of.insert(token.clone(), queue);
        Ok(token)
    }

    async fn finish(&mut self, run: bool) -> Result<FinishReport, GridflowError> {
        let jobs: usize = self.queues.iter().map(Vec::len).sum();
        if jobs == 0 {
            return Ok(FinishReport::default());
        }

        let markers = self.script_dpath.join("markers");
        std::fs::create_dir_all(&markers).map_err(|e| GridflowError::write_failed(&markers, e))?;

        // Markers left by an earlier pass would release waiters before the rerun finishes
        for job in self.queues.iter().flatten() {
            if job.marker.exists() {
                std::fs::remove_file(&job.marker)
                    .map_err(|e| GridflowError::write_failed(&job.marker, e))?;
                debug!(marker = %job.marker.display(), "removed stale marker");
            }
        }

        let mut scripts = Vec::new();
        for (i, queue) in self.queues.iter().enumerate().filter(|(_, q)| !q.is_empty()) {
            let path = self.script_dpath.join(format!("queue_{}.sh", i));
            atomic_write_bytes(&path, self.queue_script(queue).as_bytes())?;
            scripts.push(path);
        }

        let driver = self.script_dpath.join("run_queues.sh");
        atomic_write_bytes(&driver, self.driver_script(&scripts).as_bytes())?;
        info!(script = %driver.display(), queues = scripts.len(), jobs, "wrote tmux driver");

        let mut launched = false;
        if run {
            if !self.check_available().await? {
                return Err(GridflowError::backend_unavailable("tmux", "tmux"));
            }
            let status = Command::new("bash").arg(&driver).status().await?;
            if !status.success() {
                return Err(GridflowError::Submission {
                    backend: "tmux".to_string(),
                    node: self.session.clone(),
                    reason: format!("driver script exited with {}", status),
                });
            }
            launched = true;
        }

        Ok(FinishReport {
            script: Some(driver),
            jobs,
            launched,
        })
    }

    async fn check_available(&self) -> Result<bool, GridflowError> {
        Ok(program_available("tmux"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ParamMap;

    fn job(name: &str, deps: &[&SubmissionToken]) -> JobRequest {
        JobRequest {
            name: name.into(),
            node: name.into(),
            command: format!("run-{}", name),
            depends_on: deps.iter().map(|t| (*t).clone()).collect(),
            execution_options: ParamMap::new(),
            dpath: PathBuf::from(format!("/runs/{}", name)),
            primary_out: PathBuf::from(format!("/runs/{}/out", name)),
        }
    }

    #[tokio::test]
    async fn test_queue_assignment_and_markers() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = TmuxBackend::new("grid", 2, dir.path());

        let a = backend.submit(&job("a", &[])).await.unwrap();
        let b = backend.submit(&job("b", &[])).await.unwrap();
        let c = backend.submit(&job("c", &[&a, &b])).await.unwrap();

        // c follows a into queue 0 and waits on b from queue 1
        assert_eq!(backend.queue_of[&a], 0);
        assert_eq!(backend.queue_of[&b], 1);
        assert_eq!(backend.queue_of[&c], 0);
        assert_eq!(backend.queues[0][1].waits_on, vec![backend.marker_path(&b)]);

        let report = backend.finish(false).await.unwrap();
        assert_eq!(report.jobs, 3);
        assert!(!report.launched);

        let driver = std::fs::read_to_string(report.script.unwrap()).unwrap();
        assert!(driver.contains("tmux new-session -d -s grid -n queue_0"));
        assert!(driver.contains("tmux new-window -t grid -n queue_1"));

        let queue0 = std::fs::read_to_string(dir.path().join("queue_0.sh")).unwrap();
        assert!(queue0.contains("(cd /runs/a && run-a)"));
        assert!(queue0.contains("b.done"));
    }

    #[tokio::test]
    async fn test_rerun_clears_stale_markers() {
        let dir = tempfile::tempdir().unwrap();
        let markers = dir.path().join("markers");
        std::fs::create_dir_all(&markers).unwrap();
        std::fs::write(markers.join("a.done"), "").unwrap();
        std::fs::write(markers.join("other.done"), "").unwrap();

        let mut backend = TmuxBackend::new("grid", 2, dir.path());
        let x = backend.submit(&job("x", &[])).await.unwrap();
        let a = backend.submit(&job("a", &[])).await.unwrap();
        backend.submit(&job("c", &[&x, &a])).await.unwrap();
        assert_eq!(backend.queues[0][1].waits_on, vec![markers.join("a.done")]);

        backend.finish(false).await.unwrap();
        assert!(!markers.join("a.done").exists());
        assert!(markers.join("other.done").exists());
    }

    #[test]
    fn test_relative_script_dir_is_anchored() {
        let backend = TmuxBackend::new("grid", 1, Path::new("results/_scripts"));
        assert!(backend.script_dpath.is_absolute());
        assert!(backend.marker_path(&SubmissionToken("a".into())).is_absolute());
    }

    #[tokio::test]
    async fn test_finish_without_jobs_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = TmuxBackend::new("grid", 4, dir.path());
        let report = backend.finish(true).await.unwrap();
        assert!(report.script.is_none());
        assert!(!dir.path().join("run_queues.sh").exists());
    }
}
