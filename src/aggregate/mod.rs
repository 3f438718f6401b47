// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Result aggregation
//!
//! Walks run directories for job records of the requested evaluation nodes,
//! rebuilds one row per job from the record's lineage and the node's result
//! file, then groups rows by their effective parameters.

mod loader;
mod params;
mod regions;
mod report;

pub use loader::{flatten_into, JsonResultLoader, MetricMap, ResultLoader};
pub use params::{
    build_effective_params, normalize_path, param_hashid, ColumnMatcher, EffectiveParams,
};
pub use regions::{macro_groups, macro_region_key, MacroGroup};
pub use report::{rank_rows, resolve_metric_name, AggregateReport, NodeReport, RankedRow};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cache::{Cache, RowKey};
use crate::errors::GridflowError;
use crate::pipeline::Pipeline;
use crate::schedule::{JobRecord, JOB_RECORD_FNAME};
use crate::utils::create_progress_bar;

/// One reconstructed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub node: String,
    pub dpath: PathBuf,
    pub process_id: String,
    /// `params.<node>.<key>` columns over the node and its ancestors
    pub params: BTreeMap<String, Value>,
    /// `metrics.<node>.<key>` columns
    pub metrics: BTreeMap<String, Value>,
    /// Parameter columns that were set explicitly
    pub specified: BTreeSet<String>,
    /// Parameter columns holding input paths
    pub path_columns: BTreeSet<String>,
}

impl AggregateRow {
    pub fn new(node: &str, dpath: impl Into<PathBuf>, process_id: impl Into<String>) -> Self {
        Self {
            node: node.to_string(),
            dpath: dpath.into(),
            process_id: process_id.into(),
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            specified: BTreeSet::new(),
            path_columns: BTreeSet::new(),
        }
    }

    /// Build the parameter side of a row from a job record
    pub fn from_record(record: &JobRecord, dpath: &Path) -> Self {
        let mut row = Self::new(&record.node, dpath, record.process_id.clone());

        for (node, entry) in &record.lineage {
            let column = |key: &str| format!("params.{}.{}", node, key);
            for (key, value) in entry.algo_params.iter().chain(&entry.perf_params) {
                row.params.insert(column(key), value.clone());
            }
            for (key, value) in &entry.in_paths {
                row.params.insert(column(key), value.clone());
                row.path_columns.insert(column(key));
            }
            row.specified
                .extend(entry.specified.iter().map(|key| column(key)));
        }
        row
    }

    /// Attach metrics under `metrics.<node>.`
    pub fn with_metrics(mut self, metrics: MetricMap) -> Self {
        let node = self.node.clone();
        self.metrics.extend(
            metrics
                .into_iter()
                .map(|(key, value)| (format!("metrics.{}.{}", node, key), value)),
        );
        self
    }

    /// Look up a parameter or metric column
    pub fn column(&self, name: &str) -> Option<&Value> {
        self.params.get(name).or_else(|| self.metrics.get(name))
    }
}

/// Aggregation settings
#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    pub eval_nodes: Vec<String>,
    /// Exact column names or glob patterns excluded from ParamHashIDs
    pub ignore_columns: Vec<String>,
    /// Extra columns to treat as paths
    pub path_columns: Vec<String>,
    pub sort_metric: Option<String>,
    pub maximize: bool,
    pub top_k: usize,
    /// Column naming the region of a row, enables macro grouping
    pub region_column: Option<String>,
    pub show_progress: bool,
}

/// Builds aggregation reports from run directories
pub struct Aggregator {
    options: AggregateOptions,
    loaders: HashMap<String, Box<dyn ResultLoader>>,
    cache: Option<Box<dyn Cache>>,
}

impl Aggregator {
    /// Create an aggregator; every evaluation node must exist in `pipeline`
    pub fn new(pipeline: Pipeline, options: AggregateOptions) -> Result<Self, GridflowError> {
        let mut loaders: HashMap<String, Box<dyn ResultLoader>> = HashMap::new();
        for name in &options.eval_nodes {
            let node = pipeline.node(name)?;
            loaders.insert(name.clone(), Box::new(JsonResultLoader::for_node(node)));
        }

        Ok(Self {
            options,
            loaders,
            cache: None,
        })
    }

    /// Use a row cache
    pub fn with_cache(mut self, cache: Box<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the loader of one evaluation node
    pub fn with_loader(mut self, node: &str, loader: Box<dyn ResultLoader>) -> Self {
        self.loaders.insert(node.to_string(), loader);
        self
    }

    /// Aggregate every evaluation node under `targets`
    pub async fn aggregate(&self, targets: &[PathBuf]) -> Result<AggregateReport, GridflowError> {
        let records = find_records(targets)?;
        info!("Found {} job records under {} targets", records.len(), targets.len());

        let mut report = AggregateReport::default();
        let mut ignore = self.options.ignore_columns.clone();
        if let Some(region) = &self.options.region_column {
            ignore.push(region.clone());
        }
        let ignore = ColumnMatcher::new(&ignore)?;
        let path_columns = ColumnMatcher::new(&self.options.path_columns)?;

        for node in &self.options.eval_nodes {
            let rows = self.load_rows(node, &records, &mut report.warnings).await?;
            debug!("Built {} rows for node {}", rows.len(), node);

            let effective = build_effective_params(&rows, &ignore, &path_columns);
            let hashids = effective.hashids.clone();
            let mut node_report = NodeReport::new(node, &rows, effective);

            if let Some(metric) = &self.options.sort_metric {
                let metric = resolve_metric_name(node, metric, &rows);
                node_report.top = rank_rows(
                    &rows,
                    &hashids,
                    &metric,
                    self.options.maximize,
                    self.options.top_k,
                );
                node_report.sort_metric = Some(metric);
            }

            if let Some(region) = &self.options.region_column {
                node_report.macro_groups = macro_groups(&rows, &hashids, region);
            }

            report.nodes.push(node_report);
        }

        Ok(report)
    }

    async fn load_rows(
        &self,
        node: &str,
        records: &[PathBuf],
        warnings: &mut Vec<String>,
    ) -> Result<Vec<AggregateRow>, GridflowError> {
        let loader = self
            .loaders
            .get(node)
            .ok_or_else(|| GridflowError::UnknownNode {
                node: node.to_string(),
            })?;

        let progress = self
            .options
            .show_progress
            .then(|| create_progress_bar(records.len() as u64, &format!("Loading {}", node)));

        let mut rows = Vec::new();
        for record_path in records {
            if let Some(pb) = &progress {
                pb.inc(1);
            }
            let dpath = record_path.parent().unwrap_or(Path::new("."));

            let key = match &self.cache {
                Some(_) => RowKey::for_record(record_path, loader.source(dpath).as_deref()).ok(),
                None => None,
            };
            if let (Some(cache), Some(key)) = (&self.cache, &key) {
                match cache.get(key).await {
                    Ok(Some(row)) if row.node == node => {
                        debug!("Cache hit for {}", record_path.display());
                        rows.push(row);
                        continue;
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => warn!("Row cache read failed: {}", e),
                }
            }

            let record = match JobRecord::load(record_path) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Dropping row: {}", e);
                    warnings.push(format!("{}: {}", record_path.display(), e));
                    continue;
                }
            };
            if record.node != node {
                continue;
            }

            let row = match loader.load(dpath) {
                Ok(metrics) => AggregateRow::from_record(&record, dpath).with_metrics(metrics),
                Err(e) => {
                    warn!("Dropping row: {}", e);
                    warnings.push(format!("{}: {}", dpath.display(), e));
                    continue;
                }
            };

            if let (Some(cache), Some(key)) = (&self.cache, &key) {
                if let Err(e) = cache.store(key, &row).await {
                    warn!("Row cache write failed: {}", e);
                }
            }
            rows.push(row);
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        Ok(rows)
    }
}

/// Find job records below each target, skipping hidden link directories
pub fn find_records(targets: &[PathBuf]) -> Result<Vec<PathBuf>, GridflowError> {
    let options = glob::MatchOptions {
        require_literal_leading_dot: true,
        ..Default::default()
    };

    let mut found = BTreeSet::new();
    for target in targets {
        if target.is_file() {
            found.insert(target.clone());
            continue;
        }
        let pattern = format!(
            "{}/**/{}",
            glob::Pattern::escape(&target.to_string_lossy()),
            JOB_RECORD_FNAME
        );
        for entry in glob::glob_with(&pattern, options)? {
            match entry {
                Ok(path) => {
                    found.insert(path);
                }
                Err(e) => warn!("Skipping unreadable path: {}", e),
            }
        }
    }
    Ok(found.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FilesystemCache;
    use crate::pipeline::{Node, NodeSpec};
    use crate::schedule::LineageEntry;
    use serde_json::json;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn pipeline() -> Pipeline {
        let mut prep = NodeSpec::new("prep", "prep.sh");
        prep.in_paths = crate::pipeline::InPaths::Keys(vec!["src".into()]);
        prep.out_paths.insert("out".into(), "prepped.json".into());
        prep.algo_params.insert("scale".into(), json!(1));

        let mut eval = NodeSpec::new("eval", "eval.sh");
        eval.in_paths = crate::pipeline::InPaths::Keys(vec!["data".into()]);
        eval.out_paths.insert("scores".into(), "scores.json".into());
        eval.algo_params.insert("region".into(), json!("north"));

        let mut pipeline = Pipeline::new("demo");
        pipeline.add_node(Node::new(prep).unwrap()).unwrap();
        pipeline.add_node(Node::new(eval).unwrap()).unwrap();
        pipeline.connect_keys("prep.out", "eval.data").unwrap();
        pipeline
    }

    fn write_job(root: &Path, id: &str, scale: i64, region: &str, acc: Option<f64>) -> PathBuf {
        let dpath = root.join("eval").join(id);
        std::fs::create_dir_all(&dpath).unwrap();

        let mut lineage = BTreeMap::new();
        lineage.insert(
            "prep".to_string(),
            LineageEntry {
                algo_params: [("scale".to_string(), json!(scale))].into(),
                in_paths: [("src".to_string(), json!("/data/raw.csv"))].into(),
                specified: ["scale".to_string()].into(),
                ..Default::default()
            },
        );
        lineage.insert(
            "eval".to_string(),
            LineageEntry {
                algo_params: [("region".to_string(), json!(region))].into(),
                ..Default::default()
            },
        );

        let record = JobRecord {
            node: "eval".into(),
            process_id: id.into(),
            algo_id: id.into(),
            depends: BTreeMap::new(),
            algo_config: Default::default(),
            lineage,
            out_paths: BTreeMap::new(),
            primary_out: dpath.join("scores.json"),
            command: "eval.sh".into(),
            execution_options: Default::default(),
            created: SystemTime::now(),
        };
        record.write_once(&dpath).unwrap();
        if let Some(acc) = acc {
            std::fs::write(dpath.join("scores.json"), json!({"acc": acc}).to_string()).unwrap();
        }
        dpath
    }

    fn options() -> AggregateOptions {
        AggregateOptions {
            eval_nodes: vec!["eval".into()],
            sort_metric: Some("acc".into()),
            maximize: true,
            top_k: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_aggregate_rows_and_ranking() {
        let dir = TempDir::new().unwrap();
        write_job(dir.path(), "j1", 1, "north", Some(0.5));
        write_job(dir.path(), "j2", 2, "north", Some(0.8));

        let aggregator = Aggregator::new(pipeline(), options()).unwrap();
        let report = aggregator.aggregate(&[dir.path().to_path_buf()]).await.unwrap();

        let node = &report.nodes[0];
        assert_eq!(node.rows, 2);
        assert_eq!(node.sort_metric.as_deref(), Some("metrics.eval.acc"));
        assert_eq!(node.top[0].process_id, "j2");
        assert!(node.varied.contains_key("params.prep.scale"));
        assert!(node.constant["params.prep.src"]
            .as_str()
            .unwrap()
            .starts_with("raw.csv@"));
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_missing_result_becomes_warning() {
        let dir = TempDir::new().unwrap();
        write_job(dir.path(), "j1", 1, "north", Some(0.5));
        write_job(dir.path(), "j2", 2, "north", None);

        let aggregator = Aggregator::new(pipeline(), options()).unwrap();
        let report = aggregator.aggregate(&[dir.path().to_path_buf()]).await.unwrap();

        assert_eq!(report.nodes[0].rows, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("j2"));
    }

    #[tokio::test]
    async fn test_region_grouping_ignores_region_in_hashid() {
        let dir = TempDir::new().unwrap();
        write_job(dir.path(), "j1", 1, "north", Some(0.4));
        write_job(dir.path(), "j2", 1, "south", Some(0.6));

        let mut options = options();
        options.region_column = Some("params.eval.region".into());
        let aggregator = Aggregator::new(pipeline(), options).unwrap();
        let report = aggregator.aggregate(&[dir.path().to_path_buf()]).await.unwrap();

        let groups = &report.nodes[0].macro_groups;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].regions, vec!["north", "south"]);
        assert!((groups[0].metrics["metrics.eval.acc"] - 0.5).abs() < 1e-9);
    }

    async fn aggregate_cached(target: &Path, cache_dir: &Path) -> AggregateReport {
        let cache = FilesystemCache::new(cache_dir.to_path_buf()).unwrap();
        Aggregator::new(pipeline(), options())
            .unwrap()
            .with_cache(Box::new(cache))
            .aggregate(&[target.to_path_buf()])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rows_come_from_cache() {
        let dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        write_job(dir.path(), "j1", 1, "north", Some(0.5));

        let first = aggregate_cached(dir.path(), cache_dir.path()).await;
        let cache = FilesystemCache::new(cache_dir.path().to_path_buf()).unwrap();
        assert_eq!(cache.stats().await.unwrap().entries, 1);

        let second = aggregate_cached(dir.path(), cache_dir.path()).await;
        assert_eq!(first.nodes[0].top, second.nodes[0].top);
    }

    fn rewrite_record(dpath: &Path, edit: impl FnOnce(&mut JobRecord)) {
        let mut record = JobRecord::load(dpath).unwrap();
        edit(&mut record);
        crate::schedule::atomic_write_bytes(
            &JobRecord::path_in(dpath),
            &serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_recorded_primary_output_is_read() {
        let dir = TempDir::new().unwrap();
        let job = write_job(dir.path(), "j1", 1, "north", None);
        std::fs::write(job.join("custom.json"), json!({"acc": 0.7}).to_string()).unwrap();
        rewrite_record(&job, |r| r.primary_out = job.join("custom.json"));

        let report = Aggregator::new(pipeline(), options())
            .unwrap()
            .aggregate(&[dir.path().to_path_buf()])
            .await
            .unwrap();

        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.nodes[0].rows, 1);
        assert_eq!(report.nodes[0].top[0].value, 0.7);
    }

    #[tokio::test]
    async fn test_cache_follows_result_file() {
        let dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let job = write_job(dir.path(), "j1", 1, "north", Some(0.5));

        let first = aggregate_cached(dir.path(), cache_dir.path()).await;
        assert_eq!(first.nodes[0].top[0].value, 0.5);

        let scores = job.join("scores.json");
        std::fs::write(&scores, json!({"acc": 0.9}).to_string()).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&scores)
            .unwrap()
            .set_modified(SystemTime::now() + std::time::Duration::from_secs(60))
            .unwrap();

        let second = aggregate_cached(dir.path(), cache_dir.path()).await;
        assert_eq!(second.nodes[0].top[0].value, 0.9);
    }

    struct FixedLoader;

    impl ResultLoader for FixedLoader {
        fn load(&self, _node_dpath: &Path) -> Result<MetricMap, GridflowError> {
            Ok([("acc".to_string(), json!(1.0))].into())
        }
    }

    #[tokio::test]
    async fn test_custom_loader() {
        let dir = TempDir::new().unwrap();
        // No result file on disk; the loader supplies metrics
        write_job(dir.path(), "j1", 1, "north", None);

        let report = Aggregator::new(pipeline(), options())
            .unwrap()
            .with_loader("eval", Box::new(FixedLoader))
            .aggregate(&[dir.path().to_path_buf()])
            .await
            .unwrap();

        assert_eq!(report.nodes[0].rows, 1);
        assert_eq!(report.nodes[0].top[0].value, 1.0);
    }

    #[test]
    fn test_unknown_eval_node() {
        let mut options = options();
        options.eval_nodes = vec!["missing".into()];
        assert!(matches!(
            Aggregator::new(pipeline(), options),
            Err(GridflowError::UnknownNode { .. })
        ));
    }

    #[test]
    fn test_find_records_skips_link_dirs() {
        let dir = TempDir::new().unwrap();
        let job = write_job(dir.path(), "j1", 1, "north", Some(0.5));
        let hidden = job.join(".pred").join("prep").join("x");
        std::fs::create_dir_all(&hidden).unwrap();
        std::fs::write(hidden.join(JOB_RECORD_FNAME), "{}").unwrap();

        let found = find_records(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(found, vec![job.join(JOB_RECORD_FNAME)]);
    }
}
