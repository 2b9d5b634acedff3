//! Substitution of indirect flake references through the registry chain.

use anyhow::Result;

use crate::{error::FlakeError, flakeref::FlakeRef, registry::Registry};

/// Resolve `flake_ref` through `registries` (in precedence order) until a
/// reference no registry maps any further.
pub fn resolve<R: AsRef<Registry>>(flake_ref: &FlakeRef, registries: &[R]) -> Result<FlakeRef> {
    lookup(flake_ref, registries, vec![flake_ref.clone()])
}

/// Resolve only when needed: direct references pass through untouched.
pub fn maybe_resolve<R: AsRef<Registry>>(
    flake_ref: &FlakeRef,
    registries: &[R],
    allow_lookup: bool,
) -> Result<FlakeRef> {
    if flake_ref.is_direct() {
        Ok(flake_ref.clone())
    } else if allow_lookup {
        resolve(flake_ref, registries)
    } else {
        Err(FlakeError::LookupNotAllowed(flake_ref.clone()).into())
    }
}

fn lookup<R: AsRef<Registry>>(
    flake_ref: &FlakeRef,
    registries: &[R],
    visited: Vec<FlakeRef>,
) -> Result<FlakeRef> {
    for registry in registries {
        let registry = registry.as_ref();

        if let Some(target) = registry.get(flake_ref) {
            return follow(target.clone(), registries, visited);
        }

        if let Some(target) = registry.get(&flake_ref.base_ref()) {
            let mut target = target.clone();
            target.ref_name = flake_ref.ref_name.clone();
            target.rev = flake_ref.rev.clone();
            target.subdir = flake_ref.subdir.clone();
            return follow(target, registries, visited);
        }
    }

    if !flake_ref.is_direct() {
        return Err(FlakeError::UnresolvableIndirectReference(flake_ref.clone()).into());
    }

    Ok(flake_ref.clone())
}

fn follow<R: AsRef<Registry>>(
    next: FlakeRef,
    registries: &[R],
    mut visited: Vec<FlakeRef>,
) -> Result<FlakeRef> {
    if visited.contains(&next) {
        visited.push(next);
        return Err(FlakeError::RegistryCycle { chain: visited }.into());
    }
    tracing::trace!("registry lookup: {}", next);
    visited.push(next.clone());
    lookup(&next, registries, visited)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::flakeref::RefKind;

    fn chain(entries: &[&[(&str, &str)]]) -> Vec<Arc<Registry>> {
        entries
            .iter()
            .map(|pairs| Arc::new(Registry::from_overrides(pairs).unwrap()))
            .collect()
    }

    fn parse(s: &str) -> FlakeRef {
        FlakeRef::parse(s).unwrap()
    }

    #[test]
    fn test_direct_is_terminal_and_idempotent() {
        let registries = chain(&[&[("nixpkgs", "github:NixOS/nixpkgs")]]);
        let direct = parse("github:edolstra/dwarffs");

        let once = resolve(&direct, &registries).unwrap();
        assert_eq!(once, direct);
        assert_eq!(resolve(&once, &registries).unwrap(), once);

        let resolved = resolve(&parse("nixpkgs"), &registries).unwrap();
        assert_eq!(resolve(&resolved, &registries).unwrap(), resolved);
    }

    #[test]
    fn test_transitive_chain() {
        let registries = chain(&[&[("a", "b"), ("b", "c"), ("c", "git+https://x/c")]]);
        assert_eq!(
            resolve(&parse("a"), &registries).unwrap(),
            FlakeRef::git("https://x/c")
        );
    }

    #[test]
    fn test_cycle_detected() {
        let registries = chain(&[&[("a", "b"), ("b", "a")]]);
        let err = resolve(&parse("a"), &registries).unwrap_err();
        match err.downcast_ref::<FlakeError>() {
            Some(FlakeError::RegistryCycle { chain }) => {
                assert_eq!(chain, &vec![parse("a"), parse("b"), parse("a")]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_self_mapping_is_a_cycle() {
        let registries = chain(&[&[("a", "a")]]);
        let err = resolve(&parse("a"), &registries).unwrap_err();
        match err.downcast_ref::<FlakeError>() {
            Some(FlakeError::RegistryCycle { chain }) => {
                assert_eq!(chain, &vec![parse("a"), parse("a")]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_base_ref_overlay() {
        let registries = chain(&[&[("foo", "git+https://x/foo")]]);
        let resolved = resolve(&parse("foo/v2?dir=sub"), &registries).unwrap();

        assert_eq!(resolved.kind, RefKind::Git { uri: "https://x/foo".into() });
        assert_eq!(resolved.ref_name.as_deref(), Some("v2"));
        assert_eq!(resolved.subdir, "sub");
        assert!(resolved.rev.is_none());
    }

    #[test]
    fn test_exact_match_substitutes_fully() {
        let registries = chain(&[&[
            ("foo/v2", "github:a/foo-two"),
            ("foo", "github:a/foo"),
        ]]);
        assert_eq!(
            resolve(&parse("foo/v2"), &registries).unwrap(),
            parse("github:a/foo-two")
        );
    }

    #[test]
    fn test_first_registry_wins() {
        let registries = chain(&[
            &[("nixpkgs", "/srv/nixpkgs")],
            &[("nixpkgs", "github:NixOS/nixpkgs")],
        ]);
        assert_eq!(
            resolve(&parse("nixpkgs"), &registries).unwrap(),
            FlakeRef::path("/srv/nixpkgs")
        );
    }

    #[test]
    fn test_unresolvable_indirect() {
        let registries = chain(&[&[]]);
        let err = resolve(&parse("missing"), &registries).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlakeError>(),
            Some(FlakeError::UnresolvableIndirectReference(_))
        ));
    }

    #[test]
    fn test_maybe_resolve() {
        let registries = chain(&[&[("nixpkgs", "github:NixOS/nixpkgs")]]);

        let direct = parse("github:a/b");
        assert_eq!(maybe_resolve(&direct, &registries, false).unwrap(), direct);

        let err = maybe_resolve(&parse("nixpkgs"), &registries, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlakeError>(),
            Some(FlakeError::LookupNotAllowed(_))
        ));

        assert_eq!(
            maybe_resolve(&parse("nixpkgs"), &registries, true).unwrap(),
            parse("github:NixOS/nixpkgs")
        );
    }
}
