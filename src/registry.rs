use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result};
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};

use crate::{
    config::Settings,
    error::FlakeError,
    fetch::{ArchiveRequest, CacheTtl, Fetcher},
    flakeref::FlakeRef,
    storage::Store,
};

pub const REGISTRY_VERSION: u64 = 1;

/// On-disk shape of a registry file
#[derive(Debug, Serialize, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    version: u64,
    #[serde(default)]
    flakes: BTreeMap<String, RegistryEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryEntry {
    uri: String,
}

/// Mapping from (usually indirect) flake references to their targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    entries: BTreeMap<FlakeRef, FlakeRef>,
}

/// Registries in lookup precedence order
pub type Registries = Vec<Arc<Registry>>;

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a registry from file. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read flake registry {:?}", path))?;

        let doc: RegistryDoc = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse flake registry {:?}", path))?;

        if doc.version != REGISTRY_VERSION {
            return Err(FlakeError::UnsupportedVersion {
                what: "flake registry",
                path: path.to_path_buf(),
                version: doc.version,
            }
            .into());
        }

        let mut registry = Registry::default();
        for (from, entry) in doc.flakes {
            let from = FlakeRef::parse(&from)
                .with_context(|| format!("Invalid entry in flake registry {:?}", path))?;
            let to = FlakeRef::parse(&entry.uri)
                .with_context(|| format!("Invalid entry in flake registry {:?}", path))?;
            registry.entries.insert(from, to);
        }
        Ok(registry)
    }

    /// Save registry to file, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let doc = RegistryDoc {
            version: REGISTRY_VERSION,
            flakes: self
                .entries
                .iter()
                .map(|(from, to)| {
                    (
                        from.to_string(),
                        RegistryEntry {
                            uri: to.to_string(),
                        },
                    )
                })
                .collect(),
        };

        let mut content =
            serde_json::to_string_pretty(&doc).context("Failed to serialize flake registry")?;
        content.push('\n');

        fs::write(path, content)
            .with_context(|| format!("Failed to write flake registry to {:?}", path))?;

        Ok(())
    }

    /// Build the registry holding caller-supplied `from -> to` overrides
    pub fn from_overrides<S: AsRef<str>>(overrides: &[(S, S)]) -> Result<Self> {
        let mut registry = Registry::default();
        for (from, to) in overrides {
            registry.add(FlakeRef::parse(from.as_ref())?, FlakeRef::parse(to.as_ref())?);
        }
        Ok(registry)
    }

    pub fn add(&mut self, from: FlakeRef, to: FlakeRef) {
        self.entries.insert(from, to);
    }

    pub fn remove(&mut self, from: &FlakeRef) -> Option<FlakeRef> {
        self.entries.remove(from)
    }

    pub fn get(&self, from: &FlakeRef) -> Option<&FlakeRef> {
        self.entries.get(from)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&FlakeRef, &FlakeRef)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

static PROCESS_GLOBAL_REGISTRY: Lazy<Arc<GlobalRegistry>> =
    Lazy::new(|| Arc::new(GlobalRegistry::new()));

/// The globally downloaded default registry.
///
/// Initialized on first access and kept until the last handle is dropped;
/// the process-wide instance lives until exit. Concurrent first callers block
/// until the single initializer is done and then share its result. A failed
/// initialization is not remembered, so the next caller retries.
#[derive(Debug, Default)]
pub struct GlobalRegistry {
    cell: OnceCell<Arc<Registry>>,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The instance shared by the whole process
    pub fn process() -> Arc<GlobalRegistry> {
        PROCESS_GLOBAL_REGISTRY.clone()
    }

    pub fn get(&self, settings: &Settings, fetcher: &dyn Fetcher, store: &dyn Store) -> Result<Arc<Registry>> {
        self.cell
            .get_or_try_init(|| {
                let location = &settings.flake_registry;
                let path = if location.starts_with('/') {
                    Path::new(location).to_path_buf()
                } else {
                    tracing::debug!("downloading global flake registry from {}", location);
                    let request = ArchiveRequest {
                        name: "flake-registry.json".to_string(),
                        unpack: false,
                        ttl: CacheTtl::Bounded(settings.tarball_ttl()),
                        want_last_modified: false,
                        access_token: None,
                    };
                    let result = fetcher
                        .fetch_archive(location, &request)
                        .with_context(|| format!("Failed to download flake registry {}", location))?;
                    store.real_path_of(&result.store_path)
                };
                Registry::load(&path).map(Arc::new)
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let registry = Registry::load(&dir.path().join("nope.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/dir/registry.json");

        let mut registry = Registry::new();
        registry.add(FlakeRef::indirect("nixpkgs"), FlakeRef::github("NixOS", "nixpkgs"));
        registry.add(FlakeRef::indirect("dwarffs"), FlakeRef::git("https://example.org/dwarffs"));
        registry.add(
            FlakeRef::indirect("feature").with_ref("feature/x"),
            FlakeRef::github("a", "b").with_ref("feature/x"),
        );
        registry.save(&path).unwrap();

        let loaded = Registry::load(&path).unwrap();
        assert_eq!(loaded, registry);

        let content = fs::read_to_string(&path).unwrap();
        let dwarffs = content.find("\"dwarffs\"").unwrap();
        let nixpkgs = content.find("\"nixpkgs\"").unwrap();
        assert!(dwarffs < nixpkgs);
        assert!(content.contains("\"version\": 1"));
    }

    #[test]
    fn test_unsupported_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, r#"{"version": 2, "flakes": {}}"#).unwrap();

        let err = Registry::load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlakeError>(),
            Some(FlakeError::UnsupportedVersion { version: 2, .. })
        ));

        fs::write(&path, r#"{"flakes": {}}"#).unwrap();
        assert!(Registry::load(&path).is_err());
    }

    #[test]
    fn test_overrides() {
        let registry = Registry::from_overrides(&[("nixpkgs", "/srv/nixpkgs")]).unwrap();
        assert_eq!(
            registry.get(&FlakeRef::indirect("nixpkgs")),
            Some(&FlakeRef::path("/srv/nixpkgs"))
        );
        assert!(Registry::from_overrides(&[("nixpkgs", "path:relative")]).is_err());
    }

    #[test]
    fn test_add_remove() {
        let mut registry = Registry::new();
        let from = FlakeRef::indirect("foo");
        registry.add(from.clone(), FlakeRef::github("a", "foo"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.remove(&from), Some(FlakeRef::github("a", "foo")));
        assert!(registry.is_empty());
    }
}
