use std::fmt;

use anyhow::Result;
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};

use super::{
    inputs::{build_input_graph, call_with_inputs},
    lock::LockFile,
    metadata::Flake,
};
use crate::{
    context::FlakeContext,
    eval::{Attrs, Value},
};

/// Cache key for the evaluation of a resolved flake
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A flake together with the lock file its inputs were resolved against.
///
/// Its lazy inputs are built on the first `call` and shared by later ones,
/// so each input is fetched at most once per resolution.
#[derive(Debug, Clone)]
pub struct ResolvedFlake {
    pub flake: Flake,
    pub lock_file: LockFile,
    inputs: OnceCell<Attrs>,
}

impl PartialEq for ResolvedFlake {
    fn eq(&self, other: &Self) -> bool {
        self.flake == other.flake && self.lock_file == other.lock_file
    }
}

impl ResolvedFlake {
    pub fn new(flake: Flake, lock_file: LockFile) -> Self {
        ResolvedFlake {
            flake,
            lock_file,
            inputs: OnceCell::new(),
        }
    }

    /// Hash of the flake's store path and its serialized lock file.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.flake.source_info.store_path.to_string_lossy().as_bytes());
        hasher.update(b";");
        hasher.update(self.lock_file.to_string().as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Evaluate the flake's outputs with its locked inputs.
    pub fn call(&self, ctx: &FlakeContext) -> Result<Value> {
        let inputs = self
            .inputs
            .get_or_try_init(|| build_input_graph(&self.flake, &self.lock_file.inputs))?;
        call_with_inputs(ctx, &self.flake, inputs.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, path::PathBuf};

    use super::*;
    use crate::{
        eval::Lambda,
        fetch::SourceInfo,
        flake::{LockedInput, LockedInputs},
        flakeref::FlakeRef,
    };

    fn resolved(store_path: &str, inputs: LockedInputs) -> ResolvedFlake {
        let flake = Flake {
            original_ref: FlakeRef::path("/src/top"),
            source_info: SourceInfo {
                resolved_ref: FlakeRef::path("/src/top"),
                store_path: PathBuf::from(store_path),
                nar_hash: "sha256-top".to_string(),
                rev_count: None,
                last_modified: None,
            },
            edition: 201909,
            description: None,
            inputs: BTreeMap::new(),
            outputs: Lambda::new(None, ()),
        };
        ResolvedFlake::new(flake, LockFile::new(inputs))
    }

    #[test]
    fn test_fingerprint() {
        let empty = resolved("/store/aaaa-source", LockedInputs::new());
        let fingerprint = empty.fingerprint();
        assert_eq!(fingerprint.as_str().len(), 64);
        assert_eq!(fingerprint, resolved("/store/aaaa-source", LockedInputs::new()).fingerprint());
        assert_ne!(fingerprint, resolved("/store/bbbb-source", LockedInputs::new()).fingerprint());

        let mut inputs = LockedInputs::new();
        inputs.insert(
            "dep".to_string(),
            LockedInput::new(FlakeRef::github("a", "b"), "sha256-dep"),
        );
        assert_ne!(fingerprint, resolved("/store/aaaa-source", inputs).fingerprint());
    }
}
