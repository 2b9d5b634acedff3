use std::path::{Path, PathBuf};

use anyhow::Result;

/// Content-addressed store holding fetched source trees.
///
/// Store paths are opaque content addresses handed out by the store (or by a
/// fetcher writing into it); they only become filesystem locations through
/// `real_path_of`.
pub trait Store: Send + Sync {
    /// Check that a store path exists and was produced by this store.
    fn is_valid_path(&self, path: &Path) -> bool;

    /// Content hash of the tree at a store path, in SRI form (`sha256-...`).
    fn content_hash_of(&self, path: &Path) -> Result<String>;

    /// Location of a store path on the local filesystem.
    fn real_path_of(&self, path: &Path) -> PathBuf;
}
