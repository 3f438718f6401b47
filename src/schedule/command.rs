// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Command rendering
//!
//! A node's command is its executable followed by one `--key=value` argument
//! per input path, output path, algo param and perf param, in that group
//! order with keys sorted inside each group.

use serde_json::Value;
use std::path::Path;

use crate::identity::ResolvedNode;

/// Quote a string for POSIX shells, leaving plain words untouched
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r#"'"'"'"#))
    }
}

/// Text form of an argument value: strings verbatim, everything else as JSON
pub fn argument_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn push_arg(out: &mut String, key: &str, value: &str) {
    out.push_str(" \\\n    --");
    out.push_str(key);
    out.push('=');
    out.push_str(&shell_quote(value));
}

/// Render the full command line for a resolved node
pub fn render_command(node: &ResolvedNode) -> String {
    let mut out = node.executable.clone();

    for (key, value) in &node.in_paths {
        push_arg(&mut out, key, &argument_text(value));
    }
    for (key, path) in &node.out_paths {
        push_arg(&mut out, key, &path_text(path));
    }
    for (key, value) in &node.algo_params {
        push_arg(&mut out, key, &argument_text(value));
    }
    for (key, value) in &node.perf_params {
        push_arg(&mut out, key, &argument_text(value));
    }

    out
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
