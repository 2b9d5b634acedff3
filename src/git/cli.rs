use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::{
    fetch::{ExportedTree, VersionControl},
    flakeref::Rev,
    storage::FilesystemStore,
};

/// Local ref that remote fetches are written to inside the cache repository
const FETCHED_REF: &str = "refs/flake-resolve/fetched";

/// Client driving the `git` binary
#[derive(Clone)]
pub struct GitCli {
    store: Arc<FilesystemStore>,
    /// Bare mirrors of remote repositories live here
    cache_dir: PathBuf,
}

impl GitCli {
    pub fn new(store: Arc<FilesystemStore>, cache_dir: PathBuf) -> Self {
        Self { store, cache_dir }
    }

    /// Export a repository into the store.
    ///
    /// `location` is either an absolute path to a working tree or a URL. A
    /// working tree with uncommitted changes (and no explicit ref or rev) is
    /// exported as-is, without revision information.
    pub fn export(&self, location: &str, ref_name: Option<&str>, rev: Option<&Rev>) -> Result<ExportedTree> {
        let is_local = location.starts_with('/');

        if is_local && ref_name.is_none() && rev.is_none() && is_dirty(Path::new(location))? {
            tracing::debug!("exporting dirty working tree {}", location);
            return self.export_working_tree(Path::new(location));
        }

        let repo = if is_local {
            PathBuf::from(location)
        } else {
            self.fetch_remote(location, ref_name, rev)?
        };

        let target = match (rev, ref_name) {
            (Some(rev), _) => rev.to_string(),
            (None, Some(ref_name)) if is_local => ref_name.to_string(),
            (None, None) if is_local => "HEAD".to_string(),
            (None, _) => FETCHED_REF.to_string(),
        };
        let rev = Rev::parse(
            run_git(&repo, &["rev-parse", "--verify", &format!("{}^{{commit}}", target)])?.trim(),
        )?;

        let resolved_ref = match ref_name {
            Some(ref_name) => Some(ref_name.to_string()),
            None if is_local => {
                let head = run_git(&repo, &["rev-parse", "--abbrev-ref", "HEAD"])?;
                let head = head.trim();
                (head != "HEAD").then(|| head.to_string())
            }
            None => None,
        };

        let scratch = self.scratch_dir()?;
        let tree = scratch.path().join("tree");
        archive_into(&repo, &rev, &tree)?;
        let store_path = self.store.add_tree("source", &tree)?;

        let rev_count = run_git(&repo, &["rev-list", "--count", rev.as_str()])?
            .trim()
            .parse()
            .context("Failed to parse git rev-list output")?;
        let last_modified = run_git(&repo, &["log", "-1", "--format=%ct", rev.as_str()])?
            .trim()
            .parse()
            .context("Failed to parse git log output")?;

        tracing::debug!("exported {} at {} to {:?}", location, rev, store_path);

        Ok(ExportedTree {
            store_path,
            ref_name: resolved_ref,
            rev: Some(rev),
            rev_count: Some(rev_count),
            last_modified: Some(last_modified),
        })
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("Failed to create cache directory {:?}", self.cache_dir))?;
        tempfile::Builder::new()
            .prefix("export-")
            .tempdir_in(&self.cache_dir)
            .context("Failed to create export directory")
    }

    /// Fetch `ref_name` (or `rev`) of a remote repository into a bare mirror.
    fn fetch_remote(&self, url: &str, ref_name: Option<&str>, rev: Option<&Rev>) -> Result<PathBuf> {
        let repo = self
            .cache_dir
            .join(hex::encode(Sha256::digest(url.as_bytes())));

        if !repo.join("HEAD").exists() {
            fs::create_dir_all(&repo)
                .with_context(|| format!("Failed to create git cache {:?}", repo))?;
            run_git(&repo, &["init", "--bare", "--quiet"])?;
        }

        if let Some(rev) = rev {
            if has_commit(&repo, rev) {
                return Ok(repo);
            }
        }

        let refspec = format!("+{}:{}", ref_name.unwrap_or("HEAD"), FETCHED_REF);
        tracing::debug!("fetching {} from {}", refspec, url);
        run_git(&repo, &["fetch", "--quiet", "--force", url, &refspec])?;

        if let Some(rev) = rev {
            if !has_commit(&repo, rev) {
                run_git(&repo, &["fetch", "--quiet", url, rev.as_str()])
                    .with_context(|| format!("revision {} not found in '{}'", rev, url))?;
            }
        }
        Ok(repo)
    }

    /// Copy the tracked files of a working tree, as they are on disk.
    fn export_working_tree(&self, repo: &Path) -> Result<ExportedTree> {
        let scratch = self.scratch_dir()?;
        let tree = scratch.path().join("tree");
        fs::create_dir_all(&tree)?;

        let listing = run_git(repo, &["ls-files", "-z"])?;
        for rel in listing.split('\0').filter(|f| !f.is_empty()) {
            let src = repo.join(rel);
            let meta = match fs::symlink_metadata(&src) {
                Ok(meta) => meta,
                // deleted but not yet committed
                Err(_) => continue,
            };
            let dest = tree.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            if meta.file_type().is_symlink() {
                copy_symlink(&src, &dest)?;
            } else if meta.is_file() {
                fs::copy(&src, &dest)
                    .with_context(|| format!("Failed to copy {:?}", src))?;
            }
        }

        Ok(ExportedTree {
            store_path: self.store.add_tree("source", &tree)?,
            ref_name: None,
            rev: None,
            rev_count: None,
            last_modified: None,
        })
    }
}

impl VersionControl for GitCli {
    fn mark_tracked(&self, repo: &Path, relative_path: &Path) -> Result<()> {
        let relative = relative_path.to_string_lossy();
        run_git(
            repo,
            &["add", "--force", "--intent-to-add", "--", relative.as_ref()],
        )?;
        Ok(())
    }

    fn clone_repo(&self, url: &str, ref_name: Option<&str>, dest: Option<&Path>) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg(url);
        if let Some(ref_name) = ref_name {
            cmd.arg("--branch").arg(ref_name);
        }
        if let Some(dest) = dest {
            cmd.arg(dest);
        }

        let output = cmd.output().context("Failed to execute git clone")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git clone of '{}' failed: {}", url, stderr.trim());
        }
        Ok(())
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed in {:?}: {}", args.join(" "), dir, stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn has_commit(repo: &Path, rev: &Rev) -> bool {
    run_git(repo, &["cat-file", "-e", &format!("{}^{{commit}}", rev)]).is_ok()
}

/// A working tree is dirty when tracked files differ from HEAD, or when there
/// is no HEAD commit at all.
fn is_dirty(repo: &Path) -> Result<bool> {
    if run_git(repo, &["rev-parse", "--verify", "--quiet", "HEAD"]).is_err() {
        return Ok(true);
    }
    let status = run_git(repo, &["status", "--porcelain", "--untracked-files=no"])?;
    Ok(!status.trim().is_empty())
}

fn archive_into(repo: &Path, rev: &Rev, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;

    let mut archive = Command::new("git")
        .arg("-C")
        .arg(repo)
        .arg("archive")
        .arg("--format=tar")
        .arg(rev.as_str())
        .stdout(Stdio::piped())
        .spawn()
        .context("Failed to spawn git archive")?;

    let archive_out = archive
        .stdout
        .take()
        .context("git archive has no stdout")?;

    let untar = Command::new("tar")
        .arg("-x")
        .arg("-C")
        .arg(dest)
        .stdin(Stdio::from(archive_out))
        .output()
        .context("Failed to execute tar")?;

    let archive_status = archive.wait()?;
    if !archive_status.success() {
        anyhow::bail!("git archive of {} failed in {:?}", rev, repo);
    }
    if !untar.status.success() {
        let stderr = String::from_utf8_lossy(&untar.stderr);
        anyhow::bail!("unpacking git archive failed: {}", stderr.trim());
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dest: &Path) -> Result<()> {
    fs::copy(src, dest)?;
    Ok(())
}
