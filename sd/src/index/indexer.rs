//! SymbolIndexer - change-detecting code indexing
//!
//! A file is re-indexed only when its content hash differs from the recorded
//! hash (or `force` is set). Non-indexable extensions, oversized files, and
//! excluded directories are skipped. Store writes run off the async path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use memstore::MemoryStore;

use super::extract::extract;

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Indexing filters
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub allowed_extensions: Vec<String>,
    pub max_file_bytes: u64,
    pub excluded_dirs: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let file_config = crate::config::IndexFileConfig::default();
        Self::from(&file_config)
    }
}

impl From<&crate::config::IndexFileConfig> for IndexConfig {
    fn from(config: &crate::config::IndexFileConfig) -> Self {
        Self {
            allowed_extensions: config.extensions.clone(),
            max_file_bytes: config.max_file_kb * 1024,
            excluded_dirs: config.excluded_dirs.clone(),
        }
    }
}

/// Result of one index_file call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// File is filtered out (extension, size, or directory)
    Skipped,
    /// Hash matches the recorded hash; nothing to do
    Unchanged,
    Indexed {
        symbols: usize,
    },
}

/// Aggregate stats for a directory walk
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexStats {
    pub indexed: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// Change-detecting symbol indexer over the work directory
pub struct SymbolIndexer {
    store: MemoryStore,
    config: IndexConfig,
    root: PathBuf,
}

impl SymbolIndexer {
    pub fn new(store: MemoryStore, config: IndexConfig, root: PathBuf) -> Self {
        Self { store, config, root }
    }

    /// Whether a path passes the extension and directory filters
    pub fn is_indexable(&self, path: &Path) -> bool {
        let extension_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.config.allowed_extensions.iter().any(|a| a == e))
            .unwrap_or(false);
        if !extension_ok {
            return false;
        }

        !path.components().any(|c| {
            c.as_os_str()
                .to_str()
                .map(|name| self.config.excluded_dirs.iter().any(|d| d == name))
                .unwrap_or(false)
        })
    }

    /// Path as stored: relative to the indexer root where possible
    fn stored_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root).unwrap_or(path).display().to_string()
    }

    /// Index one file if its content changed
    pub async fn index_file(&self, path: &Path, force: bool) -> Result<IndexOutcome> {
        if !self.is_indexable(path) {
            return Ok(IndexOutcome::Skipped);
        }

        let bytes = tokio::fs::read(path)
            .await
            .context(format!("Failed to read {}", path.display()))?;
        if bytes.len() as u64 > self.config.max_file_bytes {
            debug!(path = %path.display(), size = bytes.len(), "Skipping oversized file");
            return Ok(IndexOutcome::Skipped);
        }

        let hash = sha256_hex(&bytes);
        let stored = self.stored_path(path);

        let store = self.store.clone();
        let stored_clone = stored.clone();
        let existing = tokio::task::spawn_blocking(move || store.file_metadata(&stored_clone))
            .await
            .context("Index lookup task panicked")??;

        if !force && existing.map(|m| m.hash == hash).unwrap_or(false) {
            return Ok(IndexOutcome::Unchanged);
        }

        let content = String::from_utf8_lossy(&bytes);
        let extraction = extract(path, &content);
        let symbol_count = extraction.symbols.len();

        let store = self.store.clone();
        let size = bytes.len() as i64;
        tokio::task::spawn_blocking(move || {
            store.index_file(&stored, &hash, size, extraction.symbols, extraction.refs)
        })
        .await
        .context("Index write task panicked")??;

        debug!(path = %path.display(), symbols = symbol_count, "File indexed");
        Ok(IndexOutcome::Indexed { symbols: symbol_count })
    }

    /// Walk a directory and index everything eligible
    pub async fn index_directory(&self, dir: &Path) -> Result<IndexStats> {
        let mut stats = IndexStats::default();

        let excluded = self.config.excluded_dirs.clone();
        let files: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_entry(move |e| {
                e.file_name()
                    .to_str()
                    .map(|name| !excluded.iter().any(|d| d == name))
                    .unwrap_or(true)
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        for file in files {
            match self.index_file(&file, false).await {
                Ok(IndexOutcome::Indexed { .. }) => stats.indexed += 1,
                Ok(IndexOutcome::Unchanged) => stats.unchanged += 1,
                Ok(IndexOutcome::Skipped) => stats.skipped += 1,
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "Indexing failed");
                    stats.skipped += 1;
                }
            }
        }

        info!(?stats, dir = %dir.display(), "Directory indexed");
        Ok(stats)
    }

    /// Fire-and-forget reindex after a write
    pub fn spawn_reindex(self: Arc<Self>, path: PathBuf) {
        tokio::spawn(async move {
            if let Err(e) = self.index_file(&path, false).await {
                debug!(path = %path.display(), error = %e, "Background reindex failed");
            }
        });
    }
}
