// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Schedule command - expand a grid and dispatch its jobs

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::ScheduleArgs;
use crate::backends::{create_backend, BackendKind};
use crate::config::GridflowConfig;
use crate::grid::{expand_grid, GridSpec};
use crate::pipeline::PipelineDefinition;
use crate::schedule::{JobStatus, ScheduleOptions, Scheduler};
use crate::utils::{create_spinner, print_error, print_header, print_info, print_warning};

/// Directory under the root that holds backend driver scripts
const SCRIPT_DNAME: &str = "_scripts";

/// Run the schedule command
pub async fn run(args: ScheduleArgs, config: GridflowConfig, verbose: bool) -> Result<()> {
    let spec = GridSpec::from_file(&args.grid)?;
    let definition = PipelineDefinition::from_file(&spec.pipeline_path())?;
    let pipeline = definition.instantiate()?;
    let configs = expand_grid(&spec)?;

    let root_dpath: PathBuf = args
        .root_dpath
        .or_else(|| spec.root_dpath())
        .unwrap_or_else(|| config.root_dpath.clone());
    let root_dpath = std::path::absolute(&root_dpath).unwrap_or(root_dpath);
    let kind = args.backend.unwrap_or(config.backend);

    let options = ScheduleOptions {
        root_dpath: root_dpath.clone(),
        skip_existing: args.skip_existing.unwrap_or(config.skip_existing),
        dry_run: args.dry_run,
        verify_identity: args.verify_identity || config.verify_identity,
        run: args.run,
        global_execution_options: spec.execution_options.clone(),
    };

    let mut backend = create_backend(kind, &config, &root_dpath.join(SCRIPT_DNAME));
    if !args.dry_run && kind != BackendKind::Serial && !backend.check_available().await? {
        print_warning(&format!(
            "{} is not available here; driver scripts are written but not run",
            kind
        ));
    }

    print_header(&format!("Scheduling: {}", definition.name));
    println!(
        "  {} configurations × {} nodes, backend {}{}",
        configs.len(),
        pipeline.len(),
        kind.to_string().cyan(),
        if args.dry_run { " (dry run)".dimmed().to_string() } else { String::new() }
    );
    println!();

    let spinner = (kind == BackendKind::Serial && !args.dry_run)
        .then(|| create_spinner("Running jobs..."));
    let scheduler = Scheduler::new(pipeline, options);
    let result = scheduler.schedule(&configs, backend.as_mut()).await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    let plan = match result {
        Ok(plan) => plan,
        Err(e) => {
            if e.is_structural() {
                print_error("Grid or pipeline is invalid; nothing was scheduled");
            }
            return Err(e.into());
        }
    };

    if verbose || args.dry_run {
        for job in &plan.jobs {
            let status = match job.status {
                JobStatus::Planned | JobStatus::Submitted => job.status.to_string().green(),
                JobStatus::Satisfied | JobStatus::Reused => job.status.to_string().dimmed(),
                JobStatus::Failed | JobStatus::Blocked => job.status.to_string().red(),
            };
            println!(
                "  [{}] {:<10} {} {}",
                job.config_index,
                status,
                job.node.bold(),
                job.dpath.display().to_string().dimmed()
            );
            if args.dry_run && verbose {
                for line in job.command.lines() {
                    println!("        {}", line.dimmed());
                }
            }
        }
        println!();
    }

    for (status, count) in plan.summary() {
        println!("  {:<10} {}", status.to_string(), count);
    }

    for job in plan.failures() {
        print_error(&format!(
            "{} ({}): {}",
            job.node,
            job.process_id,
            job.error.as_deref().unwrap_or("unknown error")
        ));
    }

    if let Some(finish) = &plan.finish {
        if let Some(script) = &finish.script {
            let verb = if finish.launched { "Launched" } else { "Wrote" };
            print_info(&format!("{} {}", verb, script.display()));
        }
    }

    println!();
    if plan.is_success() {
        println!(
            "{} {} jobs decided",
            "✓".green().bold(),
            plan.jobs.len()
        );
        Ok(())
    } else {
        let broken = plan.count(JobStatus::Failed) + plan.count(JobStatus::Blocked);
        println!("{} {} jobs failed or blocked", "✗".red().bold(), broken);
        Err(miette::miette!("{} jobs failed or blocked", broken))
    }
}
