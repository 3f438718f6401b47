// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for gridflow.

pub mod aggregate;
pub mod cache;
pub mod graph;
pub mod schedule;
pub mod validate;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::backends::BackendKind;
use crate::config::GridflowConfig;

/// Parameter grid scheduler
///
/// Expand parameter grids over a pipeline of nodes, run each distinct
/// configuration once, and aggregate the results.
#[derive(Parser, Debug)]
#[clap(
    name = "gridflow",
    version,
    about = "Schedule parameter grids over node pipelines and aggregate their results",
    long_about = None,
    after_help = "Examples:\n\
        gridflow validate pipeline.yaml         Check a pipeline definition\n\
        gridflow schedule grid.yaml --dry-run   Show which jobs would run\n\
        gridflow schedule grid.yaml --run       Run the grid\n\
        gridflow aggregate -p pipeline.yaml -e eval results/\n\n\
        See 'gridflow <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Configuration file layered over gridflow.toml
    #[clap(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Expand a grid and submit the jobs that still need to run
    Schedule(ScheduleArgs),

    /// Collect results of finished jobs into a report
    Aggregate(AggregateArgs),

    /// Show pipeline as a graph
    Graph {
        /// Pipeline file
        pipeline: PathBuf,

        /// Output format (text, dot, mermaid)
        #[clap(short, long, default_value = "text")]
        format: GraphFormat,
    },

    /// Validate a pipeline definition
    Validate {
        /// Pipeline file to validate
        pipeline: PathBuf,
    },

    /// Row cache management
    Cache {
        #[clap(subcommand)]
        action: CacheAction,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct ScheduleArgs {
    /// Grid specification file
    pub grid: PathBuf,

    /// Execution backend (serial, tmux, slurm)
    #[clap(short, long)]
    pub backend: Option<BackendKind>,

    /// Root directory for job directories
    #[clap(long, value_name = "DIR")]
    pub root_dpath: Option<PathBuf>,

    /// Skip jobs whose primary output exists
    #[clap(long, value_name = "BOOL")]
    pub skip_existing: Option<bool>,

    /// Compute decisions without touching the disk or the backend
    #[clap(long)]
    pub dry_run: bool,

    /// Execute driver scripts written by queueing backends
    #[clap(long)]
    pub run: bool,

    /// Compare stored job records with the current configuration
    #[clap(long)]
    pub verify_identity: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct AggregateArgs {
    /// Directories to search for job records
    #[clap(required = true)]
    pub targets: Vec<PathBuf>,

    /// Pipeline file the jobs were scheduled from
    #[clap(short, long)]
    pub pipeline: PathBuf,

    /// Node whose results are aggregated (repeatable)
    #[clap(short, long = "eval-node", required = true)]
    pub eval_nodes: Vec<String>,

    /// Column excluded from parameter grouping; exact name or glob (repeatable)
    #[clap(long = "ignore-column")]
    pub ignore_columns: Vec<String>,

    /// Metric used for ranking
    #[clap(short, long)]
    pub sort_metric: Option<String>,

    /// Rank ascending instead of descending
    #[clap(long)]
    pub minimize: bool,

    /// Number of ranked rows to show
    #[clap(short = 'k', long)]
    pub top_k: Option<usize>,

    /// Column identifying the region of a row; enables macro grouping
    #[clap(long)]
    pub region_column: Option<String>,

    /// Output format (text, json, yaml)
    #[clap(short, long, default_value = "text")]
    pub format: OutputFormat,

    /// Do not read or write the row cache
    #[clap(long)]
    pub no_cache: bool,
}

/// Cache management actions
#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// Show cache statistics
    Stats,

    /// Clear the cache
    Clear {
        /// Skip confirmation
        #[clap(short, long)]
        yes: bool,
    },
}

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

impl std::str::FromStr for GraphFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "dot" => Ok(Self::Dot),
            "mermaid" => Ok(Self::Mermaid),
            _ => Err(format!("Unknown graph format: {}", s)),
        }
    }
}

/// Load layered configuration for the current directory
pub fn load_config(explicit: Option<&Path>) -> miette::Result<GridflowConfig> {
    let cwd = std::env::current_dir()
        .map_err(|e| miette::miette!("Failed to get current directory: {}", e))?;
    Ok(GridflowConfig::load(&cwd, explicit)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_schedule_flags() {
        let cli = Cli::parse_from([
            "gridflow",
            "schedule",
            "grid.yaml",
            "--backend",
            "slurm",
            "--skip-existing",
            "false",
            "--dry-run",
        ]);
        let Commands::Schedule(args) = cli.command else {
            panic!("expected schedule");
        };
        assert_eq!(args.backend, Some(BackendKind::Slurm));
        assert_eq!(args.skip_existing, Some(false));
        assert!(args.dry_run);
        assert!(!args.run);
    }

    #[test]
    fn test_parse_aggregate_flags() {
        let cli = Cli::parse_from([
            "gridflow",
            "aggregate",
            "-p",
            "pipeline.yaml",
            "-e",
            "eval",
            "--ignore-column",
            "params.*.workers",
            "--format",
            "json",
            "results",
        ]);
        let Commands::Aggregate(args) = cli.command else {
            panic!("expected aggregate");
        };
        assert_eq!(args.eval_nodes, vec!["eval"]);
        assert_eq!(args.format, OutputFormat::Json);
        assert_eq!(args.targets, vec![PathBuf::from("results")]);
    }
}
