use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

use super::traits::Store;

/// Filesystem-based store using SHA-256 content addressing.
///
/// Layout: `<base>/<32 hex chars of the tree hash>-<name>`.
pub struct FilesystemStore {
    base_path: PathBuf,
}

impl FilesystemStore {
    /// Create a new filesystem store
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        Ok(FilesystemStore {
            base_path: base_path.as_ref().to_path_buf(),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .with_context(|| format!("Failed to create store directory {:?}", self.base_path))?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Copy a file or directory tree into the store and return its store path.
    /// Adding identical content twice yields the same path without copying.
    pub fn add_tree(&self, name: &str, src: &Path) -> Result<PathBuf> {
        let digest = hex::encode(hash_tree(src)?);
        let dest = self.base_path.join(format!("{}-{}", &digest[..32], name));

        if dest.exists() {
            tracing::debug!("store path {:?} already present", dest);
            return Ok(dest);
        }

        // 1. Copy into a scratch location inside the store
        let temp_path = self.base_path.join(format!(".tmp-{}", digest));
        if temp_path.exists() {
            remove_any(&temp_path)?;
        }
        copy_tree(src, &temp_path)
            .with_context(|| format!("Failed to copy {:?} into the store", src))?;

        // 2. Atomic rename (atomic on POSIX systems)
        fs::rename(&temp_path, &dest)
            .with_context(|| format!("Failed to move {:?} into place", dest))?;

        tracing::debug!("added {:?} to the store as {:?}", src, dest);
        Ok(dest)
    }
}

impl Store for FilesystemStore {
    fn is_valid_path(&self, path: &Path) -> bool {
        let in_store = path.parent() == Some(self.base_path.as_path());
        let well_formed = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split_once('-'))
            .map(|(digest, name)| {
                digest.len() == 32
                    && digest.chars().all(|c| c.is_ascii_hexdigit())
                    && !name.is_empty()
            })
            .unwrap_or(false);
        in_store && well_formed && path.exists()
    }

    fn content_hash_of(&self, path: &Path) -> Result<String> {
        let digest = hash_tree(path)?;
        Ok(format!("sha256-{}", STANDARD.encode(digest)))
    }

    fn real_path_of(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }
}

/// Hash a file or directory tree: entry kinds, relative paths, executable
/// bits, file contents and symlink targets, with directories in sorted order.
fn hash_tree(root: &Path) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    hash_entry(&mut hasher, root, Path::new(""))?;
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

fn hash_entry(hasher: &mut Sha256, path: &Path, rel: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("Failed to stat {:?}", path))?;
    let rel_bytes = rel.to_string_lossy();

    if meta.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        hasher.update(b"symlink\0");
        hasher.update(rel_bytes.as_bytes());
        hasher.update(b"\0");
        hasher.update(target.to_string_lossy().as_bytes());
        hasher.update(b"\0");
    } else if meta.is_dir() {
        hasher.update(b"dir\0");
        hasher.update(rel_bytes.as_bytes());
        hasher.update(b"\0");

        let mut names: Vec<_> = fs::read_dir(path)
            .with_context(|| format!("Failed to list {:?}", path))?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<std::io::Result<_>>()?;
        names.sort();

        for name in names {
            hash_entry(hasher, &path.join(&name), &rel.join(&name))?;
        }
    } else {
        let content = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
        hasher.update(b"file\0");
        hasher.update(rel_bytes.as_bytes());
        hasher.update(if is_executable(&meta) { b"x\0" } else { b"-\0" });
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        copy_symlink(src, dest)?;
    } else if meta.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dest)?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dest: &Path) -> Result<()> {
    anyhow::bail!("cannot copy symbolic link {:?} on this platform", src)
}

fn remove_any(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree(dir: &Path, greeting: &str) -> PathBuf {
        let src = dir.join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("flake.nix"), greeting).unwrap();
        fs::write(src.join("nested/data.txt"), "data").unwrap();
        src
    }

    #[test]
    fn test_add_tree_deduplicates() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FilesystemStore::new(temp_dir.path().join("store"))?;
        store.initialize()?;

        let src = sample_tree(temp_dir.path(), "hello");
        let first = store.add_tree("source", &src)?;
        let second = store.add_tree("source", &src)?;

        assert_eq!(first, second);
        assert!(store.is_valid_path(&first));
        assert_eq!(fs::read_to_string(first.join("nested/data.txt"))?, "data");
        Ok(())
    }

    #[test]
    fn test_content_hash_tracks_content() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FilesystemStore::new(temp_dir.path().join("store"))?;
        store.initialize()?;

        let src = sample_tree(temp_dir.path(), "hello");
        let path = store.add_tree("source", &src)?;
        let hash = store.content_hash_of(&path)?;
        assert!(hash.starts_with("sha256-"));
        assert_eq!(hash, store.content_hash_of(&src)?);

        fs::write(src.join("flake.nix"), "changed")?;
        assert_ne!(hash, store.content_hash_of(&src)?);
        Ok(())
    }

    #[test]
    fn test_paths_outside_store_are_invalid() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FilesystemStore::new(temp_dir.path().join("store"))?;
        store.initialize()?;

        let src = sample_tree(temp_dir.path(), "hello");
        assert!(!store.is_valid_path(&src));
        assert!(!store.is_valid_path(&store.base_path().join("not-a-hash")));
        Ok(())
    }

    #[test]
    fn test_add_single_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FilesystemStore::new(temp_dir.path().join("store"))?;
        store.initialize()?;

        let file = temp_dir.path().join("registry.json");
        fs::write(&file, "{}")?;
        let path = store.add_tree("registry.json", &file)?;
        assert_eq!(fs::read_to_string(path)?, "{}");
        Ok(())
    }
}
