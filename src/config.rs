use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Configuration for flake resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Root of the local content-addressed store
    #[serde(default = "defaults::store_dir")]
    pub store_dir: PathBuf,
    /// Download cache (archive index and scratch space)
    #[serde(default = "defaults::cache_dir")]
    pub cache_dir: PathBuf,
    /// Global registry: an absolute path or a URL to download
    #[serde(default = "defaults::flake_registry")]
    pub flake_registry: String,
    /// Per-user registry file
    #[serde(default = "defaults::user_registry_path")]
    pub user_registry_path: PathBuf,
    /// How long downloads of mutable references stay fresh, in seconds
    #[serde(default = "defaults::tarball_ttl")]
    pub tarball_ttl: u64,
    /// Token sent along with GitHub archive requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_access_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            store_dir: defaults::store_dir(),
            cache_dir: defaults::cache_dir(),
            flake_registry: defaults::flake_registry(),
            user_registry_path: defaults::user_registry_path(),
            tarball_ttl: defaults::tarball_ttl(),
            github_access_token: None,
        }
    }
}

impl Settings {
    /// Load configuration from the config file (if any) and environment variables
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        tracing::debug!("loading flake-resolve config from {:?}", config_path);
        let mut settings = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Settings::default()
        };

        settings.apply_env()?;
        Ok(settings)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = env::var("FLAKE_STORE_DIR") {
            self.store_dir = expand_tilde(&PathBuf::from(path));
        }

        if let Ok(path) = env::var("FLAKE_CACHE_DIR") {
            self.cache_dir = expand_tilde(&PathBuf::from(path));
        }

        if let Ok(registry) = env::var("FLAKE_REGISTRY") {
            self.flake_registry = registry;
        }

        if let Ok(path) = env::var("FLAKE_USER_REGISTRY") {
            self.user_registry_path = expand_tilde(&PathBuf::from(path));
        }

        if let Ok(ttl) = env::var("FLAKE_TARBALL_TTL") {
            self.tarball_ttl = ttl
                .parse()
                .context("Failed to parse FLAKE_TARBALL_TTL as u64")?;
        }

        if let Ok(token) = env::var("GITHUB_ACCESS_TOKEN") {
            self.github_access_token = Some(token);
        }
        Ok(())
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        settings.store_dir = expand_tilde(&settings.store_dir);
        settings.cache_dir = expand_tilde(&settings.cache_dir);
        settings.user_registry_path = expand_tilde(&settings.user_registry_path);

        Ok(settings)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get default config file path
    pub fn config_file_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".config/flake-resolve/config.yaml"))
            .context("Could not determine home directory for config file")
    }

    pub fn tarball_ttl(&self) -> Duration {
        Duration::from_secs(self.tarball_ttl)
    }
}

mod defaults {
    use std::path::PathBuf;

    fn home() -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    pub(crate) fn store_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| home().join(".local/share"))
            .join("flake-resolve/store")
    }

    pub(crate) fn cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| home().join(".cache"))
            .join("flake-resolve")
    }

    pub(crate) fn flake_registry() -> String {
        "https://raw.githubusercontent.com/NixOS/flake-registry/master/flake-registry.json"
            .to_string()
    }

    pub(crate) fn user_registry_path() -> PathBuf {
        home().join(".config/flake-resolve/registry.json")
    }

    pub(crate) fn tarball_ttl() -> u64 {
        60 * 60
    }
}
