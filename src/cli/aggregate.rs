// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Aggregate command - build a report over finished jobs

use miette::Result;
use std::io::IsTerminal;

use super::{AggregateArgs, OutputFormat};
use crate::aggregate::{AggregateOptions, Aggregator};
use crate::cache::FilesystemCache;
use crate::config::GridflowConfig;
use crate::pipeline::PipelineDefinition;
use crate::utils::print_warning;

/// Run the aggregate command
pub async fn run(args: AggregateArgs, config: GridflowConfig, _verbose: bool) -> Result<()> {
    let definition = PipelineDefinition::from_file(&args.pipeline)?;
    let pipeline = definition.instantiate()?;

    let mut ignore_columns = config.aggregate.ignore_columns.clone();
    ignore_columns.extend(args.ignore_columns);

    let options = AggregateOptions {
        eval_nodes: args.eval_nodes,
        ignore_columns,
        path_columns: config.aggregate.path_columns.clone(),
        sort_metric: args.sort_metric,
        maximize: !args.minimize,
        top_k: args.top_k.unwrap_or(config.aggregate.top_k),
        region_column: args.region_column,
        show_progress: args.format == OutputFormat::Text && std::io::stderr().is_terminal(),
    };

    let mut aggregator = Aggregator::new(pipeline, options)?;
    if config.aggregate.cache && !args.no_cache {
        match FilesystemCache::new(config.aggregate.cache_dir.clone()) {
            Ok(cache) => aggregator = aggregator.with_cache(Box::new(cache)),
            Err(e) => print_warning(&format!("Row cache disabled: {}", e)),
        }
    }

    let report = aggregator.aggregate(&args.targets).await?;

    let output = match args.format {
        OutputFormat::Text => report.to_text(),
        OutputFormat::Json => report.to_json()?,
        OutputFormat::Yaml => report.to_yaml()?,
    };
    println!("{}", output.trim_end());

    Ok(())
}
