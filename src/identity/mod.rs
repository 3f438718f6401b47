// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Content-addressed identities
//!
//! `algo_id` hashes a node's own configuration; `process_id` hashes the
//! `algo_id`s of the node and all its ancestors. Two runs with the same
//! `process_id` share a directory.

mod hash;
mod resolve;

pub use hash::{canonical_bytes, hash_params, hash_value, short_hash, ContentHasher, ID_LENGTH};
pub use resolve::{
    render_template, resolve_pipeline, verify_identity, ResolvedNode, ResolvedPipeline,
};
