use std::path::Path;

use anyhow::Result;

use super::{
    lock::{LockFile, LockedInput, LockedInputs, LOCK_FILE_NAME},
    metadata::{get_flake, get_non_flake, locate_in_tree, Flake},
    policy::LockPolicy,
    resolved::ResolvedFlake,
};
use crate::{
    context::FlakeContext,
    error::FlakeError,
    flakeref::{FlakeRef, RefKind},
};

/// Compute the lock tree of `flake`, starting from the entries in `old`.
///
/// An input that already has an entry keeps it, without fetching anything.
/// Other inputs are looked up, fetched and, for flakes, reconciled
/// recursively from scratch. Entries for inputs the flake no longer declares
/// are dropped.
pub fn reconcile(
    ctx: &FlakeContext,
    flake: Flake,
    policy: LockPolicy,
    old: &LockedInputs,
    is_top_level: bool,
) -> Result<(Flake, LockedInput)> {
    tracing::debug!(
        "reconciling {} '{}'",
        if is_top_level { "top-level flake" } else { "input" },
        flake.original_ref
    );

    let mut node = LockedInput::new(
        flake.source_info.resolved_ref.clone(),
        flake.source_info.nar_hash.clone(),
    );

    for (name, input) in &flake.inputs {
        if let Some(existing) = old.get(name) {
            node.inputs.insert(name.clone(), existing.clone());
            continue;
        }

        if !policy.may_fetch_unlocked() {
            return Err(FlakeError::CannotUpdateInPureMode(name.clone()).into());
        }

        let reference = ctx.lookup(&input.reference, policy.may_use_registries(false))?;
        let child = if input.is_flake {
            let dependency = get_flake(ctx, &reference)?;
            reconcile(ctx, dependency, policy, &LockedInputs::new(), false)?.1
        } else {
            let source_info = get_non_flake(ctx, &reference)?;
            LockedInput::new(source_info.resolved_ref, source_info.nar_hash)
        };

        tracing::debug!("locked input '{}' to {}", name, child.reference);
        node.inputs.insert(name.clone(), child);
    }

    Ok((flake, node))
}

/// Resolve a top-level flake together with its lock file, persisting the
/// lock file when it changed and `policy` allows it.
pub fn resolve_flake(ctx: &FlakeContext, top_ref: &FlakeRef, policy: LockPolicy) -> Result<ResolvedFlake> {
    let resolved_ref = ctx.lookup(top_ref, policy.may_use_registries(true))?;
    let flake = get_flake(ctx, &resolved_ref)?;

    let old_lock = if policy.start_from_empty() {
        LockFile::default()
    } else {
        match locate_in_tree(ctx, &flake.original_ref, &flake.source_info, LOCK_FILE_NAME)? {
            Some(path) => LockFile::read(&path)?,
            None => LockFile::default(),
        }
    };

    let (flake, root) = reconcile(ctx, flake, policy, &old_lock.inputs, true)?;
    let dirty = root.is_dirty();
    let new_lock = LockFile::from(root);

    if new_lock != old_lock {
        persist(ctx, top_ref, &new_lock, dirty, policy)?;
    }

    Ok(ResolvedFlake::new(flake, new_lock))
}

/// Refresh the lock file of `flake_ref`, optionally discarding the old one.
pub fn update_lock_file(ctx: &FlakeContext, flake_ref: &FlakeRef, recreate: bool) -> Result<ResolvedFlake> {
    let policy = if recreate {
        LockPolicy::Recreate
    } else {
        LockPolicy::Update
    };
    resolve_flake(ctx, flake_ref, policy)
}

fn persist(ctx: &FlakeContext, top_ref: &FlakeRef, lock: &LockFile, dirty: bool, policy: LockPolicy) -> Result<()> {
    if !policy.may_write() {
        if !matches!(policy, LockPolicy::Pure | LockPolicy::TopUsesRegistries) {
            tracing::warn!("using updated lock file of flake '{}' without writing it", top_ref);
        }
        return Ok(());
    }

    let RefKind::Path { path } = &top_ref.kind else {
        tracing::warn!("cannot write lock file of remote flake '{}'", top_ref);
        return Ok(());
    };

    if dirty {
        tracing::warn!(
            "not writing lock file of flake '{}' because it has an unlocked input",
            top_ref
        );
        return Ok(());
    }

    let relative = Path::new(&top_ref.subdir).join(LOCK_FILE_NAME);
    let lock_path = path.join(&relative);
    lock.write(&lock_path)?;
    tracing::info!("updated lock file {:?}", lock_path);

    if let Err(e) = ctx.vcs().mark_tracked(path, &relative) {
        tracing::warn!("could not add {:?} to the version control index: {:#}", lock_path, e);
    }
    Ok(())
}
