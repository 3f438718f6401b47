// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Row cache for aggregation
//!
//! Parsing job records and result files dominates aggregation time over large
//! run trees. Parsed rows are cached under a key derived from the record path
//! and the modification times of the record and the primary output, so a
//! rewritten result never hits a stale entry.

mod filesystem;

pub use filesystem::{FilesystemCache, DEFAULT_CACHE_DIR};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::SystemTime;

use crate::aggregate::AggregateRow;
use crate::errors::GridflowError;
use crate::identity::ContentHasher;

/// Key of one cached row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey(pub String);

impl RowKey {
    /// Key for the row built from `record_path` and the result file it read
    pub fn for_record(record_path: &Path, result: Option<&Path>) -> Result<Self, GridflowError> {
        let mut hasher = ContentHasher::new();
        hasher.update_field("row");
        hasher.update_mtime(record_path)?;
        if let Some(result) = result {
            hasher.update_mtime(result)?;
        }
        Ok(Self(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trait for cache implementations
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get the cached row for a key
    async fn get(&self, key: &RowKey) -> Result<Option<AggregateRow>, GridflowError>;

    /// Store a row
    async fn store(&self, key: &RowKey, row: &AggregateRow) -> Result<(), GridflowError>;

    /// Invalidate one entry
    async fn invalidate(&self, key: &RowKey) -> Result<(), GridflowError>;

    /// Clear all cached rows
    async fn clear(&self) -> Result<(), GridflowError>;

    /// Get cache statistics
    async fn stats(&self) -> Result<CacheStats, GridflowError>;
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cached rows
    pub entries: usize,
    /// Total size in bytes
    pub size_bytes: u64,
    /// Oldest entry timestamp
    pub oldest_entry: Option<SystemTime>,
    /// Newest entry timestamp
    pub newest_entry: Option<SystemTime>,
}

impl CacheStats {
    /// Format size for display
    pub fn formatted_size(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if self.size_bytes >= GB {
            format!("{:.2} GB", self.size_bytes as f64 / GB as f64)
        } else if self.size_bytes >= MB {
            format!("{:.2} MB", self.size_bytes as f64 / MB as f64)
        } else if self.size_bytes >= KB {
            format!("{:.2} KB", self.size_bytes as f64 / KB as f64)
        } else {
            format!("{} bytes", self.size_bytes)
        }
    }
}

/// Cached row entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    /// When the entry was cached
    pub timestamp: SystemTime,
    /// Node the row belongs to
    pub node: String,
    pub cache_key: RowKey,
    pub row: AggregateRow,
}
