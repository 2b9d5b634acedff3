use std::path::PathBuf;

use anyhow::{Context, Result};

use super::{ArchiveRequest, CacheTtl, ExportedTree};
use crate::{
    context::FlakeContext,
    error::FlakeError,
    flakeref::{FlakeRef, RefKind, Rev},
};

/// The result of fetching a direct flake reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    /// The fetched reference, pinned to the revision that was obtained
    pub resolved_ref: FlakeRef,
    pub store_path: PathBuf,
    /// Content hash reported by the store for `store_path`
    pub nar_hash: String,
    pub rev_count: Option<u64>,
    /// Unix seconds
    pub last_modified: Option<i64>,
}

pub fn github_archive_url(owner: &str, repo: &str, flake_ref: &FlakeRef) -> String {
    let selector = match (&flake_ref.rev, &flake_ref.ref_name) {
        (Some(rev), _) => rev.as_str(),
        (None, Some(ref_name)) => ref_name.as_str(),
        (None, None) => "master",
    };
    format!(
        "https://api.github.com/repos/{}/{}/tarball/{}",
        owner, repo, selector
    )
}

/// Fetch the source tree of a direct flake reference.
pub fn fetch_source(ctx: &FlakeContext, flake_ref: &FlakeRef) -> Result<SourceInfo> {
    debug_assert!(flake_ref.is_direct(), "fetching indirect reference {}", flake_ref);

    let info = match &flake_ref.kind {
        RefKind::GitHub { owner, repo } => fetch_github(ctx, flake_ref, owner, repo)?,
        RefKind::Git { uri } => {
            let tree = ctx
                .fetcher()
                .export_tree(uri, flake_ref.ref_name.as_deref(), flake_ref.rev.as_ref())
                .with_context(|| format!("Failed to fetch '{}'", flake_ref))?;
            from_export(ctx, flake_ref, tree)?
        }
        RefKind::Path { path } => {
            if !path.join(".git").exists() {
                return Err(FlakeError::NotAVersionControlledTree(path.clone()).into());
            }
            let tree = ctx
                .fetcher()
                .export_tree(&path.to_string_lossy(), None, None)
                .with_context(|| format!("Failed to fetch '{}'", flake_ref))?;
            from_export(ctx, flake_ref, tree)?
        }
        RefKind::Indirect { .. } => {
            return Err(FlakeError::UnresolvableIndirectReference(flake_ref.clone()).into())
        }
    };

    if !ctx.store().is_valid_path(&info.store_path) {
        anyhow::bail!(
            "fetching '{}' produced {:?}, which is not a valid store path",
            flake_ref,
            info.store_path
        );
    }
    tracing::debug!(
        "got source {:?} for {}",
        info.store_path,
        info.resolved_ref
    );
    Ok(info)
}

fn fetch_github(ctx: &FlakeContext, flake_ref: &FlakeRef, owner: &str, repo: &str) -> Result<SourceInfo> {
    let url = github_archive_url(owner, repo, flake_ref);
    let request = ArchiveRequest {
        name: "source".to_string(),
        unpack: true,
        ttl: if flake_ref.is_immutable() {
            CacheTtl::Eternal
        } else {
            CacheTtl::Bounded(ctx.settings().tarball_ttl())
        },
        want_last_modified: true,
        access_token: ctx.settings().github_access_token.clone(),
    };

    let result = ctx
        .fetcher()
        .fetch_archive(&url, &request)
        .with_context(|| format!("Failed to fetch '{}'", flake_ref))?;

    let rev = rev_from_etag(&url, result.etag.as_deref())?;

    let mut resolved_ref = flake_ref.base_ref().with_rev(rev);
    resolved_ref.subdir = flake_ref.subdir.clone();

    Ok(SourceInfo {
        resolved_ref,
        nar_hash: ctx.store().content_hash_of(&result.store_path)?,
        store_path: result.store_path,
        rev_count: None,
        last_modified: result.last_modified,
    })
}

/// GitHub reports the commit of an archive as a quoted revision in the ETag.
fn rev_from_etag(url: &str, etag: Option<&str>) -> Result<Rev> {
    let etag = etag.ok_or_else(|| FlakeError::FetchIntegrityError {
        url: url.to_string(),
        reason: "no ETag header received".to_string(),
    })?;

    let unquoted = etag
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .filter(|s| Rev::looks_like_rev(s))
        .ok_or_else(|| FlakeError::FetchIntegrityError {
            url: url.to_string(),
            reason: format!("ETag header '{}' is not a Git revision", etag),
        })?;

    Ok(Rev::parse(unquoted)?)
}

fn from_export(ctx: &FlakeContext, flake_ref: &FlakeRef, tree: ExportedTree) -> Result<SourceInfo> {
    let mut resolved_ref = flake_ref.base_ref();
    resolved_ref.ref_name = tree.ref_name;
    resolved_ref.rev = tree.rev;
    resolved_ref.subdir = flake_ref.subdir.clone();

    Ok(SourceInfo {
        resolved_ref,
        nar_hash: ctx.store().content_hash_of(&tree.store_path)?,
        store_path: tree.store_path,
        rev_count: tree.rev_count,
        last_modified: tree.last_modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REV: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_github_url_selector() {
        let base = FlakeRef::github("NixOS", "nixpkgs");
        assert_eq!(
            github_archive_url("NixOS", "nixpkgs", &base),
            "https://api.github.com/repos/NixOS/nixpkgs/tarball/master"
        );
        assert!(github_archive_url("NixOS", "nixpkgs", &base.clone().with_ref("release-19.09"))
            .ends_with("/tarball/release-19.09"));
        let pinned = base.with_ref("main").with_rev(Rev::parse(REV).unwrap());
        assert!(github_archive_url("NixOS", "nixpkgs", &pinned).ends_with(REV));
    }

    #[test]
    fn test_etag_validation() {
        let url = "https://example.org";
        assert_eq!(
            rev_from_etag(url, Some(format!("\"{}\"", REV).as_str()))
                .unwrap()
                .as_str(),
            REV
        );

        for bad in [None, Some(REV), Some("\"abc\""), Some("W/\"0123\"")] {
            let err = rev_from_etag(url, bad).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<FlakeError>(),
                Some(FlakeError::FetchIntegrityError { .. })
            ));
        }
    }
}
