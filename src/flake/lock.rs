use std::{collections::BTreeMap, fmt, fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{error::FlakeError, flakeref::{FlakeRef, RefKind}};

pub const LOCK_FILE_NAME: &str = "flake.lock";
pub const LOCK_FILE_VERSION: u64 = 2;

pub type LockedInputs = BTreeMap<String, LockedInput>;

/// A pinned dependency and, recursively, its own pinned dependencies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedInput {
    #[serde(rename = "ref", alias = "uri")]
    pub reference: FlakeRef,
    #[serde(rename = "narHash")]
    pub nar_hash: String,
    #[serde(default)]
    pub inputs: LockedInputs,
}

impl LockedInput {
    pub fn new(reference: FlakeRef, nar_hash: impl Into<String>) -> Self {
        LockedInput {
            reference,
            nar_hash: nar_hash.into(),
            inputs: LockedInputs::new(),
        }
    }

    /// A local working tree without a revision cannot be reproduced, and
    /// neither can anything that depends on one.
    pub fn is_dirty(&self) -> bool {
        let unpinned_path =
            matches!(self.reference.kind, RefKind::Path { .. }) && self.reference.rev.is_none();
        unpinned_path || self.inputs.values().any(LockedInput::is_dirty)
    }
}

/// The persisted pins of a flake's dependencies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
    pub version: u64,
    #[serde(default)]
    pub inputs: LockedInputs,
}

impl Default for LockFile {
    fn default() -> Self {
        LockFile {
            version: LOCK_FILE_VERSION,
            inputs: LockedInputs::new(),
        }
    }
}

impl From<LockedInput> for LockFile {
    /// The root entry itself is not persisted, only its dependencies.
    fn from(root: LockedInput) -> Self {
        LockFile {
            version: LOCK_FILE_VERSION,
            inputs: root.inputs,
        }
    }
}

impl LockFile {
    pub fn new(inputs: LockedInputs) -> Self {
        LockFile {
            version: LOCK_FILE_VERSION,
            inputs,
        }
    }

    /// Read a lock file. A missing file is an empty lock.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lock file {:?}", path))?;
        let raw: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse lock file {:?}", path))?;

        let version = raw
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .with_context(|| format!("Lock file {:?} has no version", path))?;
        if version != LOCK_FILE_VERSION {
            return Err(FlakeError::UnsupportedVersion {
                what: "lock file",
                path: path.to_path_buf(),
                version,
            }
            .into());
        }

        serde_json::from_value(raw).with_context(|| format!("Failed to parse lock file {:?}", path))
    }

    /// Write the lock file, creating parent directories as needed.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        fs::write(path, format!("{}\n", self))
            .with_context(|| format!("Failed to write lock file {:?}", path))?;

        tracing::debug!("wrote lock file {:?}", path);
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.inputs.values().any(LockedInput::is_dirty)
    }
}

impl fmt::Display for LockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
