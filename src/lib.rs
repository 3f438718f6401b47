// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! # gridflow - Parameter Grid Scheduler
//!
//! `gridflow` runs parameter grids over pipelines of command-line programs.
//!
//! ## Features
//!
//! - **Typed pipelines** - Nodes with declared input, output and parameter ports
//! - **Content-addressed runs** - Each distinct configuration runs once, in its own directory
//! - **Grid expansion** - Cartesian products, lists of grids and `__include__` files
//! - **Interchangeable backends** - Run serially, in tmux queues, or on slurm
//! - **Aggregation** - Group results by effective parameters and rank them
//!
//! ## Quick Start
//!
//! ```bash
//! # Check a pipeline
//! gridflow validate pipeline.yaml
//!
//! # See what a grid would run
//! gridflow schedule grid.yaml --dry-run
//!
//! # Run it, then compare results
//! gridflow schedule grid.yaml --run
//! gridflow aggregate -p pipeline.yaml -e evaluate results/
//! ```

pub mod aggregate;
pub mod backends;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod grid;
pub mod identity;
pub mod pipeline;
pub mod schedule;
pub mod utils;

// Re-export commonly used types
pub use errors::{GridflowError, GridflowResult};
pub use pipeline::{Node, Pipeline};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
