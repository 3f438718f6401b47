// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Validate command - check a pipeline definition

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use crate::pipeline::{PipelineDefinition, PipelineValidator};
use crate::utils::print_success;

/// Run the validate command
pub async fn run(pipeline_path: PathBuf, verbose: bool) -> Result<()> {
    println!("{}", "Validating pipeline...".bold());
    println!();

    if !pipeline_path.exists() {
        return Err(miette::miette!(
            "Pipeline file not found: {}",
            pipeline_path.display()
        ));
    }

    let definition = match PipelineDefinition::from_file(&pipeline_path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("  {} Failed to parse pipeline", "✗".red());
            eprintln!();
            return Err(miette::miette!("Parse error: {}", e));
        }
    };

    print_success("Pipeline file is valid YAML");

    let validation = PipelineValidator::validate(&definition);

    let base_dir = pipeline_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    let missing = PipelineValidator::validate_executables(&definition, &base_dir);

    if !validation.errors.is_empty() {
        println!();
        println!("{}:", "Errors".red().bold());
        for error in &validation.errors {
            println!("  {} {}", "✗".red(), error);
        }
    }

    if !missing.is_empty() {
        println!();
        println!("{}:", "Missing executables".yellow().bold());
        for program in &missing {
            println!("  {} {}", "⚠".yellow(), program);
        }
    }

    if !validation.warnings.is_empty() {
        println!();
        println!("{}:", "Warnings".yellow().bold());
        for warning in &validation.warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
    }

    if verbose && validation.is_valid() {
        println!();
        println!("{}:", "Pipeline summary".bold());
        println!("  Name: {}", definition.name);
        println!("  Nodes: {}", definition.nodes.len());
        for node in &definition.nodes {
            let deps: Vec<&str> = definition
                .connections
                .iter()
                .filter(|c| c.to.split('.').next() == Some(node.name.as_str()))
                .filter_map(|c| c.from.split('.').next())
                .collect();
            let deps = if deps.is_empty() {
                String::new()
            } else {
                format!(" [depends: {}]", deps.join(", "))
            };
            println!("    - {} ({}){}", node.name, node.executable, deps.dimmed());
        }
    }

    println!();

    if !validation.is_valid() {
        Err(miette::miette!("Pipeline validation failed"))
    } else if validation.has_warnings() || !missing.is_empty() {
        println!("{}", "Pipeline is valid but has warnings.".yellow().bold());
        Ok(())
    } else {
        println!("{}", "Pipeline is valid!".green().bold());
        Ok(())
    }
}
