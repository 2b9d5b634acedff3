use std::path::Path;

use anyhow::Result;

use crate::{
    context::FlakeContext,
    error::FlakeError,
    flakeref::{FlakeRef, RefKind},
    resolver,
};

/// Check out the repository behind `flake_ref` for local development.
pub fn clone_flake(ctx: &FlakeContext, flake_ref: &FlakeRef, dest: Option<&Path>) -> Result<()> {
    let resolved = resolver::resolve(flake_ref, &ctx.registries()?)?;

    let url = match &resolved.kind {
        RefKind::GitHub { owner, repo } => format!("git@github.com:{}/{}.git", owner, repo),
        RefKind::Git { uri } => uri.clone(),
        RefKind::Path { .. } | RefKind::Indirect { .. } => {
            return Err(FlakeError::NotClonable(resolved).into())
        }
    };

    tracing::debug!("cloning {} from {}", resolved, url);
    ctx.vcs().clone_repo(&url, resolved.ref_name.as_deref(), dest)
}
