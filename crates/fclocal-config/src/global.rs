//! Global configuration for fclocal
//!
//! Located at `~/.config/fclocal/config.toml`

use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Public registry mirror used when the network is restricted
pub const DEFAULT_MIRROR_REGISTRY: &str = "registry.cn-beijing.aliyuncs.com";

/// Runtime image version shipped with this release
pub const DEFAULT_IMAGE_VERSION: &str = "1.6.0";

/// Global fclocal configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub engine: EngineConfig,
    pub registry: RegistryConfig,
    pub sharing: SharingConfig,
}

/// Container engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Docker socket path or http(s) URL
    pub socket: String,
    /// API request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            timeout_secs: 120,
        }
    }
}

#[cfg(windows)]
fn default_docker_socket() -> String {
    "//./pipe/docker_engine".to_string()
}

#[cfg(not(windows))]
fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

/// How the image registry is chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    /// Probe the network once and pick the mirror when restricted
    #[default]
    Auto,
    /// Always use the mirror registry
    Mirror,
    /// Always use the default (public) registry
    Default,
}

/// Runtime image registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub mode: RegistryMode,
    /// Mirror registry host prepended to image references
    pub mirror: String,
    /// Image namespace, e.g. `aliyunfc`
    pub namespace: String,
    /// Runtime image version tag
    pub image_version: String,
    /// Host probed to detect a restricted network
    pub probe_host: String,
    pub probe_port: u16,
    pub probe_timeout_ms: u64,
    /// Pull images even when they already exist locally
    pub force_pull: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mode: RegistryMode::Auto,
            mirror: DEFAULT_MIRROR_REGISTRY.to_string(),
            namespace: "aliyunfc".to_string(),
            image_version: DEFAULT_IMAGE_VERSION.to_string(),
            probe_host: "google.com".to_string(),
            probe_port: 443,
            probe_timeout_ms: 1000,
            force_pull: false,
        }
    }
}

/// Host path sharing settings (Docker Desktop for Mac)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Override of the Docker Desktop settings file holding the sharing allowlist
    pub docker_settings: Option<PathBuf>,
}

impl SharingConfig {
    /// Docker Desktop settings file, honoring the override
    pub fn docker_settings_path(&self) -> Option<PathBuf> {
        self.docker_settings.clone().or_else(|| {
            dirs::home_dir()
                .map(|h| h.join("Library/Group Containers/group.com.docker/settings.json"))
        })
    }
}

impl GlobalConfig {
    /// Load global configuration from the default path
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load global configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        tracing::debug!(
            "Loaded config from {:?}: registry mode={:?}",
            path,
            config.registry.mode
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "fclocal").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }
}
