//! Runtime image resolution
//!
//! Maps a runtime name to an image reference and picks the registry. In
//! `auto` mode the registry choice depends on a one-time reachability probe
//! that is shared by every resolver holding the same [`RegistryProbe`].

use crate::{CoreError, Result};
use async_trait::async_trait;
use fclocal_config::{RegistryConfig, RegistryMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Runtime name to image family
pub const RUNTIME_IMAGES: &[(&str, &str)] = &[
    ("nodejs6", "nodejs6"),
    ("nodejs8", "nodejs8"),
    ("nodejs10", "nodejs10"),
    ("python2.7", "python2.7"),
    ("python3", "python3.6"),
    ("java8", "java8"),
    ("php7.2", "php7.2"),
    ("custom", "custom"),
];

/// Image family for a runtime, `None` when unsupported
pub fn image_family(runtime: &str) -> Option<&'static str> {
    RUNTIME_IMAGES
        .iter()
        .find(|(name, _)| *name == runtime)
        .map(|(_, family)| *family)
}

pub fn supported_runtimes() -> impl Iterator<Item = &'static str> {
    RUNTIME_IMAGES.iter().map(|(name, _)| *name)
}

/// Network reachability check used to pick the registry
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Whether the probe target answered in time
    async fn reachable(&self) -> bool;
}

/// TCP connect with a timeout
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(
            config.probe_host.clone(),
            config.probe_port,
            Duration::from_millis(config.probe_timeout_ms),
        )
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn reachable(&self) -> bool {
        let connect = tokio::net::TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!("Probe {}:{} failed: {}", self.host, self.port, e);
                false
            }
            Err(_) => {
                tracing::debug!("Probe {}:{} timed out", self.host, self.port);
                false
            }
        }
    }
}

/// Memoized "is the network restricted" answer
///
/// Concurrent first callers share a single in-flight probe; the result is
/// never invalidated.
pub struct RegistryProbe {
    probe: Box<dyn ReachabilityProbe>,
    restricted: OnceCell<bool>,
}

impl RegistryProbe {
    pub fn new(probe: impl ReachabilityProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            restricted: OnceCell::new(),
        }
    }

    pub async fn is_restricted(&self) -> bool {
        *self
            .restricted
            .get_or_init(|| async {
                let restricted = !self.probe.reachable().await;
                tracing::debug!("Registry probe: restricted network = {}", restricted);
                restricted
            })
            .await
    }
}

/// Resolves runtime names to image references
#[derive(Clone)]
pub struct ImageResolver {
    config: RegistryConfig,
    probe: Arc<RegistryProbe>,
}

impl ImageResolver {
    pub fn new(config: RegistryConfig, probe: Arc<RegistryProbe>) -> Self {
        Self { config, probe }
    }

    /// Resolver probing the configured host over TCP
    pub fn from_config(config: &RegistryConfig) -> Self {
        let probe = Arc::new(RegistryProbe::new(TcpProbe::from_config(config)));
        Self::new(config.clone(), probe)
    }

    /// `<namespace>/runtime-<family>:[build-]<version>`, prefixed with the
    /// mirror registry when the network is restricted
    pub async fn resolve(&self, runtime: &str, build: bool) -> Result<String> {
        let family =
            image_family(runtime).ok_or_else(|| CoreError::UnsupportedRuntime(runtime.to_string()))?;

        let tag = if build {
            format!("build-{}", self.config.image_version)
        } else {
            self.config.image_version.clone()
        };
        let reference = format!("{}/runtime-{}:{}", self.config.namespace, family, tag);

        let use_mirror = match self.config.mode {
            RegistryMode::Auto => self.probe.is_restricted().await,
            RegistryMode::Mirror => true,
            RegistryMode::Default => false,
        };

        let image = if use_mirror {
            format!("{}/{}", self.config.mirror, reference)
        } else {
            reference
        };
        tracing::debug!("Resolved runtime {} to image {}", runtime, image);
        Ok(image)
    }
}
