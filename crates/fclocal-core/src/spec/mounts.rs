//! Bind mount resolution for code, NAS, temp and install-target directories

use crate::{CoreError, Result};
use fclocal_config::NasConfig;
use fclocal_provider::MountConfig;
use std::path::{Path, PathBuf};

/// Container directory holding function code
pub const CODE_MOUNT_TARGET: &str = "/code";

/// Container directory of an `Auto` NAS config
pub const AUTO_NAS_MOUNT_DIR: &str = "/mnt/auto";

/// Expand `~` and resolve relative paths against the current directory
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = PathBuf::from(shellexpand::tilde(&raw).into_owned());
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

/// Mount function code: a directory lands on `/code`, a file on `/code/<name>`
pub fn code_mount(code_uri: &Path, read_only: bool) -> Result<MountConfig> {
    let source = absolute_path(code_uri)?;
    let metadata = std::fs::metadata(&source)?;

    let target = if metadata.is_dir() {
        CODE_MOUNT_TARGET.to_string()
    } else {
        let name = source.file_name().ok_or_else(|| {
            CoreError::InvalidCommand(format!("code uri {} has no file name", source.display()))
        })?;
        format!("{}/{}", CODE_MOUNT_TARGET, name.to_string_lossy())
    };

    Ok(MountConfig::bind(source.to_string_lossy(), target, read_only))
}

/// Local directory standing in for a remote NAS directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NasMapping {
    pub local_dir: PathBuf,
    pub remote_dir: String,
}

/// Map NAS mount points to directories under `<base>/.fun/nas`
pub fn nas_mappings(base_dir: &Path, nas: Option<&NasConfig>, service: &str) -> Vec<NasMapping> {
    let nas_root = base_dir.join(".fun").join("nas");
    match nas {
        None => Vec::new(),
        Some(NasConfig::Auto(_)) => vec![NasMapping {
            local_dir: nas_root.join("auto-default").join(service),
            remote_dir: AUTO_NAS_MOUNT_DIR.to_string(),
        }],
        Some(NasConfig::Explicit(settings)) => settings
            .mount_points
            .iter()
            .map(|mp| {
                let (host, remote) = mp.server_parts();
                let mut local_dir = nas_root.join(host);
                for part in remote.split('/').filter(|p| !p.is_empty()) {
                    local_dir.push(part);
                }
                NasMapping {
                    local_dir,
                    remote_dir: mp.mount_dir.clone(),
                }
            })
            .collect(),
    }
}

/// Read-write mounts for NAS mappings, creating the local directories
pub fn nas_mounts(mappings: &[NasMapping]) -> Result<Vec<MountConfig>> {
    mappings
        .iter()
        .map(|m| {
            std::fs::create_dir_all(&m.local_dir)?;
            tracing::info!(
                "Mounting local NAS dir {} into container {}",
                m.local_dir.display(),
                m.remote_dir
            );
            Ok(MountConfig::bind(
                m.local_dir.to_string_lossy(),
                m.remote_dir.clone(),
                false,
            ))
        })
        .collect()
}

/// Host temp directory mounted on `/tmp`
pub fn tmp_dir_mount(tmp_dir: Option<&Path>) -> Result<Option<MountConfig>> {
    tmp_dir
        .map(|dir| {
            let source = absolute_path(dir)?;
            Ok(MountConfig::bind(source.to_string_lossy(), "/tmp", false))
        })
        .transpose()
}

/// A host directory receiving installed dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl InstallTarget {
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
        }
    }

    /// Parse `host:container`
    pub fn parse(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((host, container)) if !host.is_empty() && container.starts_with('/') => {
                Ok(Self::new(host, container))
            }
            _ => Err(CoreError::InvalidCommand(format!(
                "install target must be <host dir>:<absolute container dir>, got '{}'",
                s
            ))),
        }
    }
}

/// Read-write mounts for install targets, creating host directories
pub fn install_target_mounts(targets: &[InstallTarget]) -> Result<Vec<MountConfig>> {
    targets
        .iter()
        .map(|t| {
            let source = absolute_path(&t.host_path)?;
            if !source.exists() {
                std::fs::create_dir_all(&source)?;
            }
            Ok(MountConfig::bind(
                source.to_string_lossy(),
                t.container_path.clone(),
                false,
            ))
        })
        .collect()
}
