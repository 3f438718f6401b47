// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Pipeline model
//!
//! Nodes, ports, the connection graph and the on-disk pipeline definition.

mod dag;
mod definition;
mod node;
mod validation;

pub use dag::{Connection, Pipeline};
pub(crate) use dag::split_port;
pub use definition::{ConnectionSpec, PipelineDefinition};
pub use node::{
    InPaths, Node, NodeConfig, NodeSpec, ParamDecl, ParamKind, ParamMap, PortDirection, PortRef,
    ResultSpec,
};
pub use validation::{PipelineValidator, ValidationResult};
