//! Host platform and engine backend capabilities
//!
//! Several engine quirks only show up on one host OS or on the legacy
//! VirtualBox-based Docker Toolbox. They are expressed here as capability
//! queries so the lifecycle code never inspects OS strings directly.

use crate::CoreError;
use fclocal_provider::{EngineInfo, MountConfig, ProviderError};
use std::path::{Path, PathBuf};

/// Substring the engine reports for a bind mount it cannot resolve
pub const MOUNT_CONFIG_ERROR: &str = "invalid mount config for type";

/// Substring Docker for Windows reports for an unshared drive
pub const DRIVE_NOT_SHARED_ERROR: &str = "drive is not shared";

/// Docker Desktop for Mac sharing defaults when no settings are found
pub const DEFAULT_SHARED_PATHS: &[&str] = &["/Users", "/Volumes", "/private", "/tmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => HostOs::Linux,
            "macos" => HostOs::MacOs,
            "windows" => HostOs::Windows,
            _ => HostOs::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineBackend {
    Native,
    /// Docker Toolbox: the daemon runs in a VirtualBox VM
    LegacyToolbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPlatform {
    pub os: HostOs,
    pub backend: EngineBackend,
}

impl HostPlatform {
    pub fn native(os: HostOs) -> Self {
        Self {
            os,
            backend: EngineBackend::Native,
        }
    }

    /// Detect the backend from daemon labels (`provider=virtualbox` on Windows)
    pub fn detect(os: HostOs, info: &EngineInfo) -> Self {
        let backend = if os == HostOs::Windows && info.label("provider") == Some("virtualbox") {
            EngineBackend::LegacyToolbox
        } else {
            EngineBackend::Native
        };
        Self { os, backend }
    }

    pub fn is_legacy_toolbox(&self) -> bool {
        self.backend == EngineBackend::LegacyToolbox
    }

    /// Attach streams drop output on Windows; follow logs instead
    pub fn attach_output_reliable(&self) -> bool {
        self.os != HostOs::Windows
    }

    /// Docker Desktop for Mac only mounts allowlisted host paths
    pub fn checks_shared_paths(&self) -> bool {
        self.os == HostOs::MacOs
    }

    /// Map an engine create error to a typed error with remediation text
    pub fn classify_create_error(&self, err: ProviderError) -> CoreError {
        let message = err.to_string();
        if message.contains(MOUNT_CONFIG_ERROR) && self.is_legacy_toolbox() {
            return CoreError::MountConfig(message);
        }
        if message.contains(DRIVE_NOT_SHARED_ERROR) && self.os == HostOs::Windows {
            return CoreError::DriveNotShared(message);
        }
        CoreError::Provider(err)
    }
}

/// `C:\Users\x\code` -> `/c/Users/x/code`, the path form the toolbox VM sees
pub fn toolbox_path(source: &str) -> String {
    let joined: String = source.split(':').collect();
    let slashed = joined.replace('\\', "/");
    let mut chars = slashed.chars();
    match chars.next() {
        Some(first) => format!("/{}{}", first.to_lowercase(), chars.as_str()),
        None => "/".to_string(),
    }
}

/// Rewrite mount sources for the toolbox VM
pub fn toolbox_mounts(mounts: &[MountConfig]) -> Vec<MountConfig> {
    tracing::warn!(
        "We detected that you are using docker toolbox. For a better experience, please upgrade 'docker for windows'."
    );
    mounts
        .iter()
        .map(|m| MountConfig {
            source: toolbox_path(&m.source),
            ..m.clone()
        })
        .collect()
}

/// Host directories the engine is allowed to bind mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedPaths(Vec<PathBuf>);

impl Default for SharedPaths {
    fn default() -> Self {
        Self(DEFAULT_SHARED_PATHS.iter().map(PathBuf::from).collect())
    }
}

impl SharedPaths {
    pub fn new(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self(paths.into_iter().map(Into::into).collect())
    }

    /// Read the allowlist from the Docker Desktop settings file, falling back
    /// to the defaults when the file or the key is missing
    pub fn load(settings_path: Option<&Path>) -> Self {
        let Some(path) = settings_path else {
            return Self::default();
        };
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!("Docker settings {:?} unreadable ({}), using defaults", path, e);
                return Self::default();
            }
        };
        let settings: serde_json::Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Docker settings {:?} not JSON ({}), using defaults", path, e);
                return Self::default();
            }
        };

        ["filesharingDirectories", "defaultFileSharingPaths"]
            .iter()
            .find_map(|key| settings.get(key).and_then(|v| v.as_array()))
            .map(|list| Self::new(list.iter().filter_map(|v| v.as_str())))
            .unwrap_or_default()
    }

    /// Mount sources not under any shared path
    pub fn outside(&self, mounts: &[MountConfig]) -> Vec<String> {
        mounts
            .iter()
            .filter(|m| !self.0.iter().any(|shared| Path::new(&m.source).starts_with(shared)))
            .map(|m| m.source.clone())
            .collect()
    }
}
