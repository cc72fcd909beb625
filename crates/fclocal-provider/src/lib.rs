//! Container engine trait and implementations for fclocal
//!
//! This crate provides an abstraction over the container engine API with the
//! primitives the execution core needs: container create/start/stop/remove,
//! attach and log streaming, exec, image list/pull/build and archive download.

mod archive;
mod docker;
mod error;
mod types;

pub use archive::{pack_context, unpack_archive};
pub use docker::DockerEngine;
pub use error::*;
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Trait for container engines
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check the engine is reachable
    async fn ping(&self) -> Result<()>;

    /// Engine-wide information (OS type, daemon labels)
    async fn info(&self) -> Result<EngineInfo>;

    /// Create a container from a descriptor
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Start a created container
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Stop a running container
    async fn stop(&self, id: &ContainerId) -> Result<()>;

    /// Remove a container
    async fn remove(&self, id: &ContainerId, force: bool) -> Result<()>;

    /// Attach to a container, returning a hijacked duplex stream
    async fn attach(&self, id: &ContainerId, config: &AttachConfig) -> Result<AttachStream>;

    /// Stream container stdout/stderr logs
    async fn logs(&self, id: &ContainerId, follow: bool) -> Result<OutputStream>;

    /// Wait until the container is no longer running
    async fn wait(&self, id: &ContainerId) -> Result<ExitResult>;

    /// Resize the container TTY
    async fn resize(&self, id: &ContainerId, rows: u16, cols: u16) -> Result<()>;

    /// Create an exec instance, returning its id
    async fn exec_create(&self, id: &ContainerId, config: &ExecConfig) -> Result<String>;

    /// Start an exec instance with stdin closed
    async fn exec_start(&self, exec_id: &str) -> Result<OutputStream>;

    /// Inspect an exec instance
    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInspect>;

    /// Whether an image matching the reference exists locally
    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// Pull an image, streaming progress records
    async fn pull(&self, reference: &str) -> Result<PullStream>;

    /// Build an image from a context directory, streaming build records
    async fn build(&self, config: &BuildConfig) -> Result<BuildStream>;

    /// Download a path from a container as a tar archive
    async fn download(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>>;
}

/// Connect to the engine described by the global configuration
pub async fn create_engine(
    config: &fclocal_config::EngineConfig,
) -> Result<Arc<dyn ContainerEngine>> {
    let engine = DockerEngine::new(&config.socket, config.timeout_secs).await?;
    Ok(Arc::new(engine))
}
