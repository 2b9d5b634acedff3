use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Result;

use crate::flakeref::Rev;

/// How long a cached download may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    Bounded(Duration),
    /// Content addressed by an immutable revision never goes stale.
    Eternal,
}

/// Parameters of an archive download
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    /// Name given to the resulting store path
    pub name: String,
    /// Unpack the downloaded archive instead of storing the raw file
    pub unpack: bool,
    pub ttl: CacheTtl,
    pub want_last_modified: bool,
    pub access_token: Option<String>,
}

/// Outcome of an archive download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveResult {
    pub store_path: PathBuf,
    pub etag: Option<String>,
    /// Unix seconds
    pub last_modified: Option<i64>,
}

/// A version-controlled tree exported into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedTree {
    pub store_path: PathBuf,
    pub ref_name: Option<String>,
    /// `None` when a local working tree had uncommitted changes
    pub rev: Option<Rev>,
    pub rev_count: Option<u64>,
    /// Unix seconds
    pub last_modified: Option<i64>,
}

/// Network and version-control fetching
pub trait Fetcher: Send + Sync {
    /// Download (and optionally unpack) `url` into the store.
    fn fetch_archive(&self, url: &str, request: &ArchiveRequest) -> Result<ArchiveResult>;

    /// Export a git repository (URL or local working tree) into the store.
    fn export_tree(&self, location: &str, ref_name: Option<&str>, rev: Option<&Rev>) -> Result<ExportedTree>;
}

/// Side channel into the version-control tool of a local working tree
pub trait VersionControl: Send + Sync {
    /// Make `relative_path` visible to the version-control tool.
    fn mark_tracked(&self, repo: &Path, relative_path: &Path) -> Result<()>;

    /// Check out `url` for local development, at `ref_name` if given.
    fn clone_repo(&self, url: &str, ref_name: Option<&str>, dest: Option<&Path>) -> Result<()>;
}
