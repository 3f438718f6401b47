// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Canonical hashing
//!
//! Uses BLAKE3 over a canonical serialization so that identities are stable
//! under key reordering and numeric representation (`1` and `1.0` agree).

use blake3::Hasher;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::Path;

use crate::errors::GridflowError;
use crate::pipeline::ParamMap;

/// Characters kept from the base36 rendering of a digest
pub const ID_LENGTH: usize = 12;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Deterministic byte serialization of a JSON value
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out.into_bytes()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "{}", i);
            } else if let Some(u) = n.as_u64() {
                let _ = write!(out, "{}", u);
            } else {
                write_float(n.as_f64().unwrap_or(0.0), out);
            }
        }
        Value::String(s) => {
            // Display on a JSON string value is its escaped literal
            let _ = write!(out, "{}", Value::from(s.as_str()));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::from(key.as_str()));
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_float(f: f64, out: &mut String) {
    if f == 0.0 {
        out.push('0');
    } else if f.is_finite() && f.fract() == 0.0 {
        let _ = write!(out, "{:.0}", f);
    } else {
        // Display for f64 is the shortest round-trip form
        let _ = write!(out, "{}", f);
    }
}

/// Render the leading 128 bits of a digest as a fixed-width base36 id
fn digest_to_id(digest: &blake3::Hash, len: usize) -> String {
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest.as_bytes()[..16]);
    let mut n = u128::from_be_bytes(head);

    // 36^25 > 2^128, so 25 digits hold any value
    let mut digits = [b'0'; 25];
    for slot in digits.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
    }

    digits[..len.min(digits.len())]
        .iter()
        .map(|&b| b as char)
        .collect()
}

/// Identity of an arbitrary JSON value
pub fn hash_value(value: &Value) -> String {
    digest_to_id(&blake3::hash(&canonical_bytes(value)), ID_LENGTH)
}

/// Identity of a parameter map
pub fn hash_params(params: &ParamMap) -> String {
    let object = params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<serde_json::Map<_, _>>();
    hash_value(&Value::Object(object))
}

/// Short identity of a string (used for path normalization)
pub fn short_hash(s: &str, len: usize) -> String {
    digest_to_id(&blake3::hash(s.as_bytes()), len)
}

/// Incremental hasher for cache keys
pub struct ContentHasher {
    hasher: Hasher,
}

impl ContentHasher {
    /// Create a new content hasher
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    /// Hash arbitrary bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Hash a string followed by a separator, so fields cannot run together
    pub fn update_field(&mut self, field: &str) {
        self.hasher.update(field.as_bytes());
        self.hasher.update(&[0]);
    }

    /// Hash a path together with its modification time, if the file exists
    pub fn update_mtime(&mut self, path: &Path) -> Result<(), GridflowError> {
        self.update_field(&path.to_string_lossy());
        if !path.exists() {
            self.update_field("-");
            return Ok(());
        }

        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| GridflowError::read_failed(path, e))?;
        let nanos = modified
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        self.update_field(&nanos.to_string());
        Ok(())
    }

    /// Finalize as a full hex digest
    pub fn finalize(self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }

    /// Finalize as a short base36 id
    pub fn finalize_id(self) -> String {
        digest_to_id(&self.hasher.finalize(), ID_LENGTH)
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}
