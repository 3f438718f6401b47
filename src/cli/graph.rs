// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Graph command - visualize pipeline as a graph

use miette::Result;
use std::path::PathBuf;

use super::GraphFormat;
use crate::pipeline::PipelineDefinition;

/// Run the graph command
pub async fn run(pipeline_path: PathBuf, format: GraphFormat, _verbose: bool) -> Result<()> {
    if !pipeline_path.exists() {
        return Err(miette::miette!(
            "Pipeline file not found: {}",
            pipeline_path.display()
        ));
    }

    let definition = PipelineDefinition::from_file(&pipeline_path)?;
    let pipeline = definition.instantiate()?;

    let output = match format {
        GraphFormat::Text => pipeline.to_text()?,
        GraphFormat::Dot => pipeline.to_dot(),
        GraphFormat::Mermaid => pipeline.to_mermaid(),
    };

    println!("{}", output.trim_end());

    Ok(())
}
