// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Filesystem-based row cache
//!
//! Stores rows as JSON files in a cache directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{Cache, CacheStats, CachedEntry, RowKey};
use crate::aggregate::AggregateRow;
use crate::errors::GridflowError;

/// Default cache location relative to the working directory
pub const DEFAULT_CACHE_DIR: &str = ".gridflow/cache";

fn cache_error(message: impl Into<String>) -> GridflowError {
    GridflowError::CacheError {
        message: message.into(),
    }
}

/// Filesystem-based cache
pub struct FilesystemCache {
    cache_dir: PathBuf,
}

impl FilesystemCache {
    /// Create a new filesystem cache
    pub fn new(cache_dir: PathBuf) -> Result<Self, GridflowError> {
        if !cache_dir.exists() {
            std::fs::create_dir_all(&cache_dir)
                .map_err(|e| cache_error(format!("Failed to create cache directory: {}", e)))?;
        }

        Ok(Self { cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Get path for a cache entry
    fn cache_path(&self, key: &RowKey) -> PathBuf {
        // First 2 chars as directory
        let key = key.as_str();
        let (prefix, rest) = key.split_at(2.min(key.len()));
        self.cache_dir.join(prefix).join(format!("{}.json", rest))
    }

    /// List all cache entries
    fn list_entries(&self) -> Result<Vec<CachedEntry>, GridflowError> {
        let mut entries = Vec::new();

        if !self.cache_dir.exists() {
            return Ok(entries);
        }

        for prefix_dir in std::fs::read_dir(&self.cache_dir)
            .map_err(|e| cache_error(format!("Failed to read cache directory: {}", e)))?
        {
            let prefix_dir = prefix_dir
                .map_err(|e| cache_error(format!("Failed to read cache entry: {}", e)))?
                .path();

            if !prefix_dir.is_dir() {
                continue;
            }

            for entry_file in std::fs::read_dir(&prefix_dir)
                .map_err(|e| cache_error(format!("Failed to read cache subdirectory: {}", e)))?
            {
                let entry_file = entry_file
                    .map_err(|e| cache_error(format!("Failed to read cache file: {}", e)))?
                    .path();

                if entry_file.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }

                if let Ok(content) = std::fs::read_to_string(&entry_file) {
                    if let Ok(entry) = serde_json::from_str::<CachedEntry>(&content) {
                        entries.push(entry);
                    }
                }
            }
        }

        Ok(entries)
    }

    /// Calculate directory size recursively
    fn dir_size(path: &Path) -> Result<u64, GridflowError> {
        let mut size = 0;

        if path.is_file() {
            return Ok(path.metadata().map(|m| m.len()).unwrap_or(0));
        }

        for entry in std::fs::read_dir(path)
            .map_err(|e| cache_error(format!("Failed to read directory: {}", e)))?
        {
            let entry = entry.map_err(|e| cache_error(format!("Failed to read entry: {}", e)))?;

            let path = entry.path();
            if path.is_dir() {
                size += Self::dir_size(&path)?;
            } else {
                size += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }

        Ok(size)
    }
}

#[async_trait]
impl Cache for FilesystemCache {
    async fn get(&self, key: &RowKey) -> Result<Option<AggregateRow>, GridflowError> {
        let path = self.cache_path(key);

        if !path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| cache_error(format!("Failed to read cache entry: {}", e)))?;

        match serde_json::from_str::<CachedEntry>(&content) {
            Ok(entry) => Ok(Some(entry.row)),
            Err(e) => {
                // Unreadable entries are dropped and rebuilt
                tracing::debug!("Discarding corrupt cache entry {}: {}", path.display(), e);
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    async fn store(&self, key: &RowKey, row: &AggregateRow) -> Result<(), GridflowError> {
        let path = self.cache_path(key);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| cache_error(format!("Failed to create cache directory: {}", e)))?;
        }

        let entry = CachedEntry {
            timestamp: SystemTime::now(),
            node: row.node.clone(),
            cache_key: key.clone(),
            row: row.clone(),
        };

        let json = serde_json::to_string_pretty(&entry)
            .map_err(|e| cache_error(format!("Failed to serialize cache entry: {}", e)))?;

        tokio::fs::write(&path, json)
            .await
            .map_err(|e| cache_error(format!("Failed to write cache entry: {}", e)))?;

        Ok(())
    }

    async fn invalidate(&self, key: &RowKey) -> Result<(), GridflowError> {
        let path = self.cache_path(key);

        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| cache_error(format!("Failed to remove cache entry: {}", e)))?;
        }

        Ok(())
    }

    async fn clear(&self) -> Result<(), GridflowError> {
        if self.cache_dir.exists() {
            tokio::fs::remove_dir_all(&self.cache_dir)
                .await
                .map_err(|e| cache_error(format!("Failed to clear cache: {}", e)))?;

            tokio::fs::create_dir_all(&self.cache_dir)
                .await
                .map_err(|e| cache_error(format!("Failed to recreate cache directory: {}", e)))?;
        }

        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, GridflowError> {
        let entries = self.list_entries()?;

        let mut stats = CacheStats {
            entries: entries.len(),
            ..Default::default()
        };

        for entry in &entries {
            match stats.oldest_entry {
                Some(oldest) if entry.timestamp >= oldest => {}
                _ => stats.oldest_entry = Some(entry.timestamp),
            }
            match stats.newest_entry {
                Some(newest) if entry.timestamp <= newest => {}
                _ => stats.newest_entry = Some(entry.timestamp),
            }
        }

        if self.cache_dir.exists() {
            stats.size_bytes = Self::dir_size(&self.cache_dir)?;
        }

        Ok(stats)
    }
}
