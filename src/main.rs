// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! gridflow - Parameter Grid Scheduler

use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridflow::cli::{load_config, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "gridflow=debug"
    } else {
        "gridflow=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            miette::miette!("Failed to change to directory '{}': {}", dir.display(), e)
        })?;
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Schedule(args) => gridflow::cli::schedule::run(args, config, cli.verbose).await,
        Commands::Aggregate(args) => {
            gridflow::cli::aggregate::run(args, config, cli.verbose).await
        }
        Commands::Graph { pipeline, format } => {
            gridflow::cli::graph::run(pipeline, format, cli.verbose).await
        }
        Commands::Validate { pipeline } => {
            gridflow::cli::validate::run(pipeline, cli.verbose).await
        }
        Commands::Cache { action } => gridflow::cli::cache::run(action, config, cli.verbose).await,
    }
}
