use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};

use super::{ArchiveRequest, ArchiveResult, ExportedTree, Fetcher};
use crate::{
    flakeref::Rev,
    git::GitCli,
    storage::{CachedDownload, DownloadCache, FilesystemStore, Store},
};

/// Fetcher backed by the `curl`, `tar` and `git` binaries, writing into a
/// `FilesystemStore`.
pub struct CommandFetcher {
    store: Arc<FilesystemStore>,
    cache_dir: PathBuf,
    git: GitCli,
    show_progress: bool,
    /// Serializes read-modify-write cycles of the download index
    index_lock: Mutex<()>,
}

/// Response headers we care about, from the final response of a request
#[derive(Debug, Default, PartialEq, Eq)]
struct ResponseHeaders {
    status: u16,
    etag: Option<String>,
    last_modified: Option<i64>,
}

impl CommandFetcher {
    pub fn new(store: Arc<FilesystemStore>, cache_dir: PathBuf) -> Self {
        let git = GitCli::new(store.clone(), cache_dir.join("git"));
        Self {
            store,
            cache_dir,
            git,
            show_progress: false,
            index_lock: Mutex::new(()),
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn git(&self) -> &GitCli {
        &self.git
    }

    fn index_path(&self) -> PathBuf {
        self.cache_dir.join("downloads.yaml")
    }

    fn spinner(&self, message: String) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message(message);
        spinner.enable_steady_tick(Duration::from_millis(100));
        Some(spinner)
    }

    fn download(&self, url: &str, request: &ArchiveRequest, etag: Option<&str>, dir: &Path) -> Result<(PathBuf, ResponseHeaders)> {
        let header_file = dir.join("headers");
        let body_file = dir.join("body");

        let mut cmd = Command::new("curl");
        cmd.arg("--fail")
            .arg("--silent")
            .arg("--show-error")
            .arg("--location")
            .arg("--dump-header")
            .arg(&header_file)
            .arg("--output")
            .arg(&body_file);
        if let Some(token) = &request.access_token {
            cmd.arg("--header").arg(format!("Authorization: token {}", token));
        }
        if let Some(etag) = etag {
            cmd.arg("--header").arg(format!("If-None-Match: {}", etag));
        }
        cmd.arg(url);

        tracing::debug!("downloading {}", url);
        let output = cmd.output().context("Failed to execute curl")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("unable to download '{}': {}", url, stderr.trim());
        }

        let raw = fs::read_to_string(&header_file)
            .with_context(|| format!("Failed to read response headers of '{}'", url))?;
        Ok((body_file, parse_headers(&raw)))
    }

    fn unpack(&self, archive: &Path, dir: &Path) -> Result<PathBuf> {
        let unpacked = dir.join("unpacked");
        fs::create_dir_all(&unpacked)?;

        let output = Command::new("tar")
            .arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(&unpacked)
            .output()
            .context("Failed to execute tar")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("unable to unpack {:?}: {}", archive, stderr.trim());
        }

        // Archives from GitHub wrap everything in a single top-level directory
        let entries: Vec<_> = fs::read_dir(&unpacked)?.collect::<std::io::Result<_>>()?;
        if entries.len() == 1 && entries[0].file_type()?.is_dir() {
            return Ok(entries[0].path());
        }
        Ok(unpacked)
    }
}

impl Fetcher for CommandFetcher {
    fn fetch_archive(&self, url: &str, request: &ArchiveRequest) -> Result<ArchiveResult> {
        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("download index lock poisoned"))?;

        let index_path = self.index_path();
        let mut index = DownloadCache::load(&index_path)?;
        let now = Utc::now();

        if let Some(cached) = index.lookup_fresh(url, request.ttl, now) {
            if self.store.is_valid_path(&cached.store_path) {
                tracing::debug!("using cached download of {}", url);
                return Ok(ArchiveResult {
                    store_path: cached.store_path.clone(),
                    etag: cached.etag.clone(),
                    last_modified: cached.last_modified,
                });
            }
        }

        let stale = index
            .get(url)
            .filter(|c| self.store.is_valid_path(&c.store_path))
            .cloned();

        fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("Failed to create cache directory {:?}", self.cache_dir))?;
        let scratch = tempfile::Builder::new()
            .prefix("download-")
            .tempdir_in(&self.cache_dir)
            .context("Failed to create download directory")?;

        let spinner = self.spinner(format!("downloading {}", url));
        let downloaded = self.download(
            url,
            request,
            stale.as_ref().and_then(|c| c.etag.as_deref()),
            scratch.path(),
        );
        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
        let (body, headers) = downloaded?;

        let download = match stale {
            Some(stale) if headers.status == 304 => {
                tracing::debug!("{} not modified since last download", url);
                CachedDownload {
                    fetched_at: now,
                    ..stale
                }
            }
            _ => {
                let root = if request.unpack {
                    self.unpack(&body, scratch.path())?
                } else {
                    body
                };
                CachedDownload {
                    store_path: self.store.add_tree(&request.name, &root)?,
                    etag: headers.etag,
                    last_modified: if request.want_last_modified {
                        headers.last_modified
                    } else {
                        None
                    },
                    fetched_at: now,
                }
            }
        };

        index.insert(url.to_string(), download.clone());
        index.save(&index_path)?;

        Ok(ArchiveResult {
            store_path: download.store_path,
            etag: download.etag,
            last_modified: download.last_modified,
        })
    }

    fn export_tree(&self, location: &str, ref_name: Option<&str>, rev: Option<&Rev>) -> Result<ExportedTree> {
        let spinner = self.spinner(format!("fetching {}", location));
        let exported = self.git.export(location, ref_name, rev);
        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
        exported
    }
}

/// Parse a `curl --dump-header` file. With redirects it holds one header
/// block per response; only the last one describes the body.
fn parse_headers(raw: &str) -> ResponseHeaders {
    let mut headers = ResponseHeaders::default();
    for line in raw.lines() {
        let line = line.trim_end();
        if line.starts_with("HTTP/") {
            headers = ResponseHeaders {
                status: line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                ..ResponseHeaders::default()
            };
        } else if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "etag" => headers.etag = Some(value.to_string()),
                "last-modified" => {
                    headers.last_modified = DateTime::parse_from_rfc2822(value)
                        .ok()
                        .map(|t| t.timestamp())
                }
                _ => {}
            }
        }
    }
    headers
}
