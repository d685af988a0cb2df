//! Execution result cache.
//!
//! Results are stored at `{cache_dir}/{key}.json` as `{"diff": "..."}`. Keys
//! come from [`ExecutionCacheKey`], so a changed step or env value misses.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::cache_key::ExecutionCacheKey;
use crate::core::types::ExecutionResult;

/// Storage for task results keyed by their inputs.
#[async_trait]
pub trait ExecutionCache: Send + Sync {
    /// `None` when nothing usable is stored under `key`.
    async fn get(&self, key: &ExecutionCacheKey) -> Result<Option<ExecutionResult>>;
    async fn set(&self, key: &ExecutionCacheKey, result: &ExecutionResult) -> Result<()>;
    /// Remove the entry for `key`; absence is not an error.
    async fn clear(&self, key: &ExecutionCacheKey) -> Result<()>;
}

/// JSON files in a directory, one per key.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn cache_path(&self, key: &ExecutionCacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.key()))
    }
}

#[async_trait]
impl ExecutionCache for DiskCache {
    async fn get(&self, key: &ExecutionCacheKey) -> Result<Option<ExecutionResult>> {
        let path = self.cache_path(key);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read cache {}", path.display())),
        };

        // Undecodable bytes and bad JSON alike count as a corrupt entry.
        match serde_json::from_slice::<ExecutionResult>(&content) {
            Ok(result) => {
                debug!(path = %path.display(), "cache hit");
                Ok(Some(result))
            }
            Err(err) => {
                warn!(path = %path.display(), err = %err, "removing corrupt cache entry");
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("remove corrupt cache {}", path.display()))?;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &ExecutionCacheKey, result: &ExecutionResult) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create cache dir {}", self.dir.display()))?;
        let path = self.cache_path(key);
        let content = serde_json::to_vec(result).context("serialize cache entry")?;

        // Unique temp name per writer; concurrent writers of one key race on
        // the rename only.
        let tmp = tempfile::Builder::new()
            .prefix(".entry-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .with_context(|| format!("create temp file in {}", self.dir.display()))?;
        let tmp_path = tmp.into_temp_path();
        tokio::fs::write(&tmp_path, content)
            .await
            .with_context(|| format!("write cache {}", tmp_path.display()))?;
        tmp_path
            .persist(&path)
            .with_context(|| format!("replace cache {}", path.display()))?;
        debug!(path = %path.display(), "cache entry written");
        Ok(())
    }

    async fn clear(&self, key: &ExecutionCacheKey) -> Result<()> {
        let path = self.cache_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "cache entry cleared");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove cache {}", path.display())),
        }
    }
}

/// Cache used when caching is disabled: every lookup misses, writes vanish.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl ExecutionCache for NoopCache {
    async fn get(&self, _key: &ExecutionCacheKey) -> Result<Option<ExecutionResult>> {
        Ok(None)
    }

    async fn set(&self, _key: &ExecutionCacheKey, _result: &ExecutionResult) -> Result<()> {
        Ok(())
    }

    async fn clear(&self, _key: &ExecutionCacheKey) -> Result<()> {
        Ok(())
    }
}
