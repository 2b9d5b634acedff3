use std::path::PathBuf;

use crate::flakeref::FlakeRef;

/// Domain failures of flake resolution.
///
/// These travel inside `anyhow::Error`; callers that need to react to a
/// particular failure use `err.downcast_ref::<FlakeError>()`.
#[derive(Debug, thiserror::Error)]
pub enum FlakeError {
    #[error("{what} '{path}' has unsupported version {version}")]
    UnsupportedVersion {
        what: &'static str,
        path: PathBuf,
        version: u64,
    },

    #[error("found cycle in flake registries: {}", format_chain(.chain))]
    RegistryCycle { chain: Vec<FlakeRef> },

    #[error("could not resolve flake reference '{0}'")]
    UnresolvableIndirectReference(FlakeRef),

    #[error("'{0}' is an indirect flake reference, but registry lookups are not allowed")]
    LookupNotAllowed(FlakeRef),

    #[error("fetching '{url}' did not yield a valid revision: {reason}")]
    FetchIntegrityError { url: String, reason: String },

    #[error("flake '{}' does not reference a Git repository", .0.display())]
    NotAVersionControlledTree(PathBuf),

    #[error("'{}' of flake '{flake}' escapes from '{}'", .file.display(), .root.display())]
    PathEscape {
        flake: FlakeRef,
        file: PathBuf,
        root: PathBuf,
    },

    #[error("source tree referenced by '{flake}' does not contain a '{}' file", .file.display())]
    MissingManifest { flake: FlakeRef, file: PathBuf },

    #[error("flake '{flake}' has illegal edition {edition}")]
    LegacyManifest { flake: FlakeRef, edition: i64 },

    #[error("flake '{flake}' requires unsupported edition {edition}; please upgrade")]
    UnsupportedManifestVersion { flake: FlakeRef, edition: i64 },

    #[error("flake input '{input}' has an unsupported attribute '{attr}'")]
    UnknownInputAttribute { input: String, attr: String },

    #[error("flake input '{0}' sets both 'uri' and 'ref'")]
    ConflictingInputReference(String),

    #[error("flake '{flake}' has an unsupported attribute '{attr}'")]
    UnknownManifestAttribute { flake: FlakeRef, attr: String },

    #[error("flake '{flake}' lacks attribute '{attr}'")]
    MissingAttribute { flake: FlakeRef, attr: &'static str },

    #[error("attribute '{attr}' of flake '{flake}' must be {expected}, got {found}")]
    TypeMismatch {
        flake: FlakeRef,
        attr: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("cannot update flake input '{0}' in pure mode")]
    CannotUpdateInPureMode(String),

    #[error("the content hash of '{reference}' ({actual}) doesn't match the hash recorded in the referring lock file ({expected})")]
    ContentDriftError {
        reference: FlakeRef,
        expected: String,
        actual: String,
    },

    #[error("flake input '{0}' has no entry in the lock file")]
    MissingLockEntry(String),

    #[error("invalid flake reference '{input}': {reason}")]
    InvalidFlakeRef { input: String, reason: String },

    #[error("flake reference '{0}' cannot be cloned with git")]
    NotClonable(FlakeRef),
}

fn format_chain(chain: &[FlakeRef]) -> String {
    chain
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" - ")
}

impl FlakeError {
    pub(crate) fn invalid_ref(input: &str, reason: impl Into<String>) -> Self {
        FlakeError::InvalidFlakeRef {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}
