use std::{collections::BTreeMap, fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fetch::CacheTtl;

/// A previously downloaded archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CachedDownload {
    pub store_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Unix seconds from the Last-Modified header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    pub fetched_at: DateTime<Utc>,
}

/// Index of downloaded archives, keyed by URL
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DownloadCache {
    #[serde(default)]
    downloads: BTreeMap<String, CachedDownload>,
}

impl DownloadCache {
    /// Create a new empty cache index
    pub fn new() -> Self {
        Self::default()
    }

    /// Load cache index from file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read download cache from {:?}", path))?;

        let index: DownloadCache = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse download cache from {:?}", path))?;

        Ok(index)
    }

    /// Save cache index to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize download cache")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write download cache to {:?}", path))?;

        Ok(())
    }

    pub fn insert(&mut self, url: String, download: CachedDownload) {
        self.downloads.insert(url, download);
    }

    /// Entry for `url` if it is still fresh under `ttl` at `now`
    pub fn lookup_fresh(&self, url: &str, ttl: CacheTtl, now: DateTime<Utc>) -> Option<&CachedDownload> {
        let download = self.downloads.get(url)?;
        let fresh = match ttl {
            CacheTtl::Eternal => true,
            CacheTtl::Bounded(ttl) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => download.fetched_at + ttl > now,
                Err(_) => true,
            },
        };
        fresh.then_some(download)
    }

    /// Entry for `url` regardless of age
    pub fn get(&self, url: &str) -> Option<&CachedDownload> {
        self.downloads.get(url)
    }

    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }
}
