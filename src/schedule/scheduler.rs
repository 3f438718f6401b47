// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Scheduler
//!
//! Walks every configuration in grid order and every node in topological
//! order, deciding per job whether it is blocked, already handled this pass,
//! satisfied on disk, or must be submitted.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backends::{Backend, FinishReport, JobRequest, SubmissionToken};
use crate::errors::GridflowError;
use crate::grid::Configuration;
use crate::identity::{resolve_pipeline, verify_identity, ResolvedNode, ResolvedPipeline};
use crate::pipeline::{ParamMap, Pipeline};
use crate::schedule::{
    merge_execution_options, render_command, write_invoke_script, write_links, JobRecord,
};

/// Scheduling options
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Root of the result tree
    pub root_dpath: PathBuf,
    /// Treat jobs whose primary output exists as done
    pub skip_existing: bool,
    /// Decide everything but write nothing and submit nothing
    pub dry_run: bool,
    /// Compare stored records of reused directories with fresh identities
    pub verify_identity: bool,
    /// Execute driver scripts of deferred backends
    pub run: bool,
    /// Grid-level execution overlay
    pub global_execution_options: ParamMap,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            root_dpath: PathBuf::from("results"),
            skip_existing: true,
            dry_run: false,
            verify_identity: false,
            run: false,
            global_execution_options: ParamMap::new(),
        }
    }
}

/// Outcome of one job decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Would be submitted (dry run)
    Planned,
    Submitted,
    /// Primary output already exists
    Satisfied,
    /// Same process id handled earlier in this pass
    Reused,
    Failed,
    /// An upstream job failed or was blocked
    Blocked,
}

impl JobStatus {
    fn is_broken(self) -> bool {
        matches!(self, Self::Failed | Self::Blocked)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Submitted => "submitted",
            Self::Satisfied => "satisfied",
            Self::Reused => "reused",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// One decided job
#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    /// Index of the configuration in grid order
    pub config_index: usize,
    pub node: String,
    pub process_id: String,
    pub algo_id: String,
    pub dpath: PathBuf,
    pub command: String,
    pub execution_options: ParamMap,
    pub depends_on: Vec<SubmissionToken>,
    pub token: Option<SubmissionToken>,
    pub status: JobStatus,
    pub error: Option<String>,
}

/// Every decision of one scheduling pass
#[derive(Debug, Default, Serialize)]
pub struct SchedulePlan {
    pub configurations: usize,
    pub jobs: Vec<PlannedJob>,
    #[serde(skip)]
    pub finish: Option<FinishReport>,
}

impl SchedulePlan {
    /// Number of jobs with a given status
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    /// Job counts per status
    pub fn summary(&self) -> BTreeMap<JobStatus, usize> {
        let mut counts = BTreeMap::new();
        for job in &self.jobs {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn failures(&self) -> impl Iterator<Item = &PlannedJob> {
        self.jobs.iter().filter(|j| j.status == JobStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.jobs.iter().all(|j| !j.status.is_broken())
    }
}

/// Plans and dispatches jobs for a pipeline template
pub struct Scheduler {
    template: Pipeline,
    options: ScheduleOptions,
}

impl Scheduler {
    /// Create a scheduler; a relative root is anchored at the current directory
    pub fn new(template: Pipeline, mut options: ScheduleOptions) -> Self {
        // Jobs run inside their own directories, so every path they see is absolute
        if let Ok(root) = std::path::absolute(&options.root_dpath) {
            options.root_dpath = root;
        }
        Self { template, options }
    }

    pub fn options(&self) -> &ScheduleOptions {
        &self.options
    }

    /// Configure, build and resolve the template for one configuration
    pub fn resolve(&self, config: &Configuration) -> Result<(Pipeline, ResolvedPipeline), GridflowError> {
        let mut pipeline = self.template.clone();
        pipeline.configure(&config.values, &config.execution_options)?;
        pipeline.build()?;
        let resolved = resolve_pipeline(&pipeline, &self.options.root_dpath)?;
        Ok((pipeline, resolved))
    }

    /// Run one scheduling pass over all configurations
    ///
    /// Structural errors abort the pass. Per-job errors mark the job failed
    /// and block its descendants within the same configuration.
    pub async fn schedule(
        &self,
        configs: &[Configuration],
        backend: &mut dyn Backend,
    ) -> Result<SchedulePlan, GridflowError> {
        let mut plan = SchedulePlan {
            configurations: configs.len(),
            ..Default::default()
        };
        let mut handled: HashMap<String, (JobStatus, Option<SubmissionToken>)> = HashMap::new();

        for (config_index, config) in configs.iter().enumerate() {
            let (pipeline, resolved) = self.resolve(config)?;
            let mut tokens: HashMap<&str, Option<SubmissionToken>> = HashMap::new();
            let mut broken: HashSet<&str> = HashSet::new();

            for rnode in resolved.nodes() {
                let node = pipeline.node(&rnode.name)?;
                let execution_options = merge_execution_options(
                    node.default_execution_options(),
                    &self.options.global_execution_options,
                    &node.config().execution_options,
                );
                let depends_on: Vec<SubmissionToken> = rnode
                    .predecessors
                    .iter()
                    .filter_map(|p| tokens.get(p.as_str()).cloned().flatten())
                    .collect();

                let mut job = PlannedJob {
                    config_index,
                    node: rnode.name.clone(),
                    process_id: rnode.process_id.clone(),
                    algo_id: rnode.algo_id.clone(),
                    dpath: rnode.dpath.clone(),
                    command: render_command(rnode),
                    execution_options,
                    depends_on,
                    token: None,
                    status: JobStatus::Planned,
                    error: None,
                };

                self.decide(&mut job, rnode, &resolved, &broken, &handled, backend)
                    .await;

                if job.status.is_broken() {
                    broken.insert(rnode.name.as_str());
                }
                tokens.insert(rnode.name.as_str(), job.token.clone());
                handled
                    .entry(job.process_id.clone())
                    .or_insert_with(|| (job.status, job.token.clone()));
                plan.jobs.push(job);
            }
        }

        if !self.options.dry_run {
            plan.finish = Some(backend.finish(self.options.run).await?);
        }

        info!(
            configurations = plan.configurations,
            jobs = plan.jobs.len(),
            submitted = plan.count(JobStatus::Submitted),
            satisfied = plan.count(JobStatus::Satisfied),
            failed = plan.count(JobStatus::Failed),
            "scheduling pass complete"
        );

        Ok(plan)
    }

    async fn decide(
        &self,
        job: &mut PlannedJob,
        rnode: &ResolvedNode,
        resolved: &ResolvedPipeline,
        broken: &HashSet<&str>,
        handled: &HashMap<String, (JobStatus, Option<SubmissionToken>)>,
        backend: &mut dyn Backend,
    ) {
        if let Some(upstream) = rnode.predecessors.iter().find(|p| broken.contains(p.as_str())) {
            debug!(node = %rnode.name, upstream = %upstream, "blocked");
            job.status = JobStatus::Blocked;
            job.error = Some(format!("upstream node '{}' did not run", upstream));
            return;
        }

        if let Some((status, token)) = handled.get(&rnode.process_id) {
            if status.is_broken() {
                job.status = JobStatus::Failed;
                job.error = Some("failed earlier in this pass".into());
            } else {
                job.status = JobStatus::Reused;
                job.token = token.clone();
            }
            return;
        }

        if self.options.skip_existing && rnode.primary_out.exists() {
            if let Err(e) = self.check_stored_identity(rnode) {
                warn!(node = %rnode.name, error = %e, "identity check failed");
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                return;
            }
            debug!(node = %rnode.name, dpath = %rnode.dpath.display(), "satisfied");
            job.status = JobStatus::Satisfied;
            return;
        }

        if self.options.dry_run {
            job.status = JobStatus::Planned;
            job.token = Some(SubmissionToken(format!("dry-run:{}", rnode.job_name())));
            return;
        }

        match self.submit(job, rnode, resolved, backend).await {
            Ok(token) => {
                info!(node = %rnode.name, token = %token, "submitted");
                job.status = JobStatus::Submitted;
                job.token = Some(token);
            }
            Err(e) => {
                warn!(node = %rnode.name, error = %e, "job failed");
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
            }
        }
    }

    /// Compare an existing record against the fresh identity, when enabled
    fn check_stored_identity(&self, rnode: &ResolvedNode) -> Result<(), GridflowError> {
        let record_path = JobRecord::path_in(&rnode.dpath);
        if !self.options.verify_identity || !record_path.exists() {
            return Ok(());
        }
        let stored = JobRecord::load(&record_path)?;
        verify_identity(rnode, &stored.algo_config, &stored.depends)
    }

    /// Materialize the job directory and hand the job to the backend
    async fn submit(
        &self,
        job: &PlannedJob,
        rnode: &ResolvedNode,
        resolved: &ResolvedPipeline,
        backend: &mut dyn Backend,
    ) -> Result<SubmissionToken, GridflowError> {
        self.check_stored_identity(rnode)?;
        ensure_dir(&rnode.dpath)?;

        let record = JobRecord::new(resolved, rnode, &job.command, &job.execution_options);
        if record.write_once(&rnode.dpath)? {
            debug!(dpath = %rnode.dpath.display(), "wrote job record");
        }
        write_invoke_script(&rnode.dpath, &job.command)?;
        write_links(resolved, rnode)?;

        backend
            .submit(&JobRequest {
                name: rnode.job_name(),
                node: rnode.name.clone(),
                command: job.command.clone(),
                depends_on: job.depends_on.clone(),
                execution_options: job.execution_options.clone(),
                dpath: rnode.dpath.clone(),
                primary_out: rnode.primary_out.clone(),
            })
            .await
    }
}

fn ensure_dir(path: &Path) -> Result<(), GridflowError> {
    std::fs::create_dir_all(path).map_err(|e| GridflowError::write_failed(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::expand_matrix;
    use crate::pipeline::PipelineDefinition;
    use async_trait::async_trait;
    use serde_json::json;

    const PIPELINE: &str = r#"
name: two-stage
nodes:
  - name: a
    executable: stage-a
    in_paths: {src: input.txt}
    out_paths: {dst: a.out}
    algo_params: {x: 0}
    execution_options: {time: "1:00:00", mem: 4G}
  - name: b
    executable: stage-b
    in_paths: [src]
    out_paths: {dst: b.out}
    algo_params: {y: 0}
connections:
  - {from: a.dst, to: b.src}
"#;

    /// Records requests and touches the primary output, like a job that ran
    #[derive(Default)]
    struct RecordingBackend {
        requests: Vec<JobRequest>,
        fail_when: Option<String>,
        finished: bool,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn submit(&mut self, job: &JobRequest) -> Result<SubmissionToken, GridflowError> {
            if let Some(pattern) = &self.fail_when {
                if job.command.contains(pattern.as_str()) {
                    return Err(GridflowError::Submission {
                        backend: "recording".into(),
                        node: job.node.clone(),
                        reason: "refused".into(),
                    });
                }
            }
            std::fs::create_dir_all(job.primary_out.parent().unwrap()).unwrap();
            std::fs::write(&job.primary_out, "done").unwrap();
            self.requests.push(job.clone());
            Ok(SubmissionToken(format!("t{}", self.requests.len())))
        }

        async fn finish(&mut self, _run: bool) -> Result<FinishReport, GridflowError> {
            self.finished = true;
            Ok(FinishReport::default())
        }

        async fn check_available(&self) -> Result<bool, GridflowError> {
            Ok(true)
        }
    }

    fn scheduler(root: &Path, tweak: impl FnOnce(&mut ScheduleOptions)) -> Scheduler {
        let template = PipelineDefinition::from_yaml(PIPELINE)
            .unwrap()
            .instantiate()
            .unwrap();
        let mut options = ScheduleOptions {
            root_dpath: root.to_path_buf(),
            ..Default::default()
        };
        tweak(&mut options);
        Scheduler::new(template, options)
    }

    fn grid(matrix: serde_json::Value) -> Vec<Configuration> {
        let serde_json::Value::Object(map) = matrix else {
            panic!("matrix must be a mapping");
        };
        expand_matrix(&map, Path::new(".")).unwrap()
    }

    #[tokio::test]
    async fn test_cardinality_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), |o| o.dry_run = true);
        let configs = grid(json!({"a.x": [1, 2], "b.y": [1, 2]}));
        assert_eq!(configs.len(), 4);

        let mut backend = RecordingBackend::default();
        let plan = sched.schedule(&configs, &mut backend).await.unwrap();

        let ids = |node: &str| -> HashSet<String> {
            plan.jobs
                .iter()
                .filter(|j| j.node == node)
                .map(|j| j.process_id.clone())
                .collect()
        };
        let dirs: HashSet<&PathBuf> = plan.jobs.iter().filter(|j| j.node == "a").map(|j| &j.dpath).collect();
        assert_eq!(ids("b").len(), 4);
        assert_eq!(ids("a").len(), 2);
        assert_eq!(dirs.len(), 2);
        assert_eq!(plan.count(JobStatus::Reused), 2);
        assert_eq!(plan.count(JobStatus::Planned), 6);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("results");
        let sched = scheduler(&root, |o| o.dry_run = true);

        let mut backend = RecordingBackend::default();
        let plan = sched.schedule(&grid(json!({"a.x": [1]})), &mut backend).await.unwrap();

        assert_eq!(plan.jobs.len(), 2);
        assert!(backend.requests.is_empty());
        assert!(!backend.finished);
        assert!(!root.exists());
        // b still names a's synthetic token
        assert_eq!(plan.jobs[1].depends_on, vec![plan.jobs[0].token.clone().unwrap()]);
    }

    #[tokio::test]
    async fn test_second_pass_submits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), |_| {});
        let configs = grid(json!({"a.x": [1, 2]}));

        let mut first = RecordingBackend::default();
        let plan = sched.schedule(&configs, &mut first).await.unwrap();
        assert_eq!(plan.count(JobStatus::Submitted), 4);
        assert!(first.finished);

        let a_dpath = &plan.jobs[0].dpath;
        assert!(a_dpath.join("job_config.json").exists());
        assert!(a_dpath.join("invoke.sh").exists());
        assert!(plan.jobs[1].dpath.join(".pred/a").exists());

        let mut second = RecordingBackend::default();
        let plan = sched.schedule(&configs, &mut second).await.unwrap();
        assert!(second.requests.is_empty());
        assert_eq!(plan.count(JobStatus::Satisfied), 4);
    }

    #[tokio::test]
    async fn test_shared_upstream_lists_every_successor() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), |_| {});
        let configs = grid(json!({"a.x": [1], "b.y": [1, 2]}));

        let mut backend = RecordingBackend::default();
        let plan = sched.schedule(&configs, &mut backend).await.unwrap();
        assert_eq!(plan.count(JobStatus::Reused), 1);

        let b_ids: HashSet<String> = plan
            .jobs
            .iter()
            .filter(|j| j.node == "b")
            .map(|j| j.process_id.clone())
            .collect();
        assert_eq!(b_ids.len(), 2);

        let succ: HashSet<String> = std::fs::read_dir(plan.jobs[0].dpath.join(".succ/b"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(succ, b_ids);
    }

    #[tokio::test]
    async fn test_dependency_tokens_and_options() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), |o| {
            o.global_execution_options = serde_json::from_value(json!({"time": "2:00:00", "partition": "cpu"})).unwrap();
        });
        let configs = grid(json!({"a.x": [1], "a.__slurm_options__": {"time": "3:00:00"}}));

        let mut backend = RecordingBackend::default();
        sched.schedule(&configs, &mut backend).await.unwrap();

        let a = &backend.requests[0];
        let b = &backend.requests[1];
        assert_eq!(a.execution_options["time"], json!("3:00:00"));
        assert_eq!(a.execution_options["mem"], json!("4G"));
        assert_eq!(a.execution_options["partition"], json!("cpu"));
        assert_eq!(b.execution_options["time"], json!("2:00:00"));
        assert_eq!(b.depends_on, vec![SubmissionToken("t1".into())]);
        assert!(b.command.contains(&format!("--src={}", a.primary_out.display())));
    }

    #[tokio::test]
    async fn test_failure_blocks_descendants_only() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), |_| {});
        let configs = grid(json!({"a.x": [1, 2]}));

        let mut backend = RecordingBackend {
            fail_when: Some("--x=2".into()),
            ..Default::default()
        };
        let plan = sched.schedule(&configs, &mut backend).await.unwrap();

        let statuses: Vec<(usize, &str, JobStatus)> = plan
            .jobs
            .iter()
            .map(|j| (j.config_index, j.node.as_str(), j.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (0, "a", JobStatus::Submitted),
                (0, "b", JobStatus::Submitted),
                (1, "a", JobStatus::Failed),
                (1, "b", JobStatus::Blocked),
            ]
        );
        assert!(!plan.is_success());
    }

    #[tokio::test]
    async fn test_identity_collision_detected() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path(), |o| o.verify_identity = true);
        let configs = grid(json!({"a.x": [1]}));

        let mut backend = RecordingBackend::default();
        let plan = sched.schedule(&configs, &mut backend).await.unwrap();
        let a_dpath = plan.jobs[0].dpath.clone();

        // Corrupt the stored identity payload
        let mut record = JobRecord::load(&a_dpath).unwrap();
        record.algo_config.insert("x".into(), json!(99));
        std::fs::write(
            JobRecord::path_in(&a_dpath),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();

        let plan = sched.schedule(&configs, &mut backend).await.unwrap();
        assert_eq!(plan.jobs[0].status, JobStatus::Failed);
        assert!(plan.jobs[0].error.as_deref().unwrap().contains("Identity collision"));
        assert_eq!(plan.jobs[1].status, JobStatus::Blocked);
    }

    #[tokio::test]
    async fn test_unbound_input_aborts_pass() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = PIPELINE.replace("in_paths: {src: input.txt}", "in_paths: [src]");
        let template = PipelineDefinition::from_yaml(&yaml).unwrap().instantiate().unwrap();
        let sched = Scheduler::new(
            template,
            ScheduleOptions {
                root_dpath: dir.path().to_path_buf(),
                ..Default::default()
            },
        );

        let mut backend = RecordingBackend::default();
        let err = sched.schedule(&grid(json!({"a.x": [1]})), &mut backend).await.unwrap_err();
        assert!(matches!(err, GridflowError::UnboundInput { .. }));
    }
}
