//! Install and sandbox containers

use super::{ContainerHandle, ContainerManager, OUTPUT_DRAIN_GRACE};
use crate::spec::{
    absolute_path, code_mount, install_spec, install_target_env, install_target_mounts, sbox_spec,
    EnvVars, InstallTarget, SboxOptions,
};
use crate::stream::{self, stderr_sink, stdout_sink, PumpOutcome, RawModeGuard};
use crate::{CoreError, HostPlatform, Result};
use fclocal_provider::{AttachConfig, ContainerId, ExitResult};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Written after attaching a TTY so the shell prompt renders
const PROMPT_NUDGE: &[u8] = b" \x08";

/// Dependency installation container
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub runtime: String,
    /// Overrides the resolved build image
    pub image: Option<String>,
    pub code_uri: PathBuf,
    pub targets: Vec<InstallTarget>,
}

/// Sandbox session
#[derive(Debug, Clone, Default)]
pub struct SboxRequest {
    pub runtime: String,
    /// Overrides the resolved build image
    pub image: Option<String>,
    pub code_uri: Option<PathBuf>,
    /// Shell command string
    pub cmd: Option<String>,
    pub env: EnvVars,
    pub tty: bool,
    pub interactive: bool,
}

impl ContainerManager {
    async fn build_image_for(&self, runtime: &str, image: Option<String>) -> Result<String> {
        match image {
            Some(image) => Ok(image),
            None => self.resolver.resolve(runtime, true).await,
        }
    }

    /// Start a long-lived install container; commands run through
    /// [`ContainerHandle::exec`]
    pub async fn start_installation_container(&self, request: InstallRequest) -> Result<ContainerHandle> {
        tracing::debug!("Install container for runtime {}", request.runtime);
        if self.platform().await?.is_legacy_toolbox() {
            return Err(CoreError::LegacyBackendUnsupported);
        }

        let image = self.build_image_for(&request.runtime, request.image).await?;

        let mut mounts = vec![code_mount(&request.code_uri, false)?];
        mounts.extend(install_target_mounts(&request.targets)?);

        self.pull_image_if_needed(&image, None).await?;

        let spec = install_spec(&image, mounts, install_target_env(&request.targets));
        self.start_container(&spec, None, None).await
    }

    /// Run a sandbox container bridged to the host terminal until it exits
    pub async fn start_sbox_container(&self, request: SboxRequest) -> Result<ExitResult> {
        tracing::debug!(
            "Sandbox for runtime {} (tty: {}, interactive: {})",
            request.runtime,
            request.tty,
            request.interactive
        );
        let platform = self.platform().await?;
        let image = self.build_image_for(&request.runtime, request.image).await?;

        let mounts = match &request.code_uri {
            Some(code_uri) => vec![code_mount(&absolute_path(code_uri)?, false)?],
            None => Vec::new(),
        };

        self.pull_image_if_needed(&image, None).await?;

        let tty = request.tty;
        let interactive = request.interactive;
        let spec = sbox_spec(SboxOptions {
            runtime: request.runtime,
            image,
            mounts,
            env: request.env,
            cmd: request.cmd,
            tty,
            interactive,
        })?;

        let id = self.create(&spec).await?;
        let input_rx = if interactive {
            Some(stream::stdin_channel())
        } else {
            None
        };
        let result = self
            .sbox_session(&id, platform, tty, input_rx)
            .await;
        self.shutdown.deregister_container(&id);
        result
    }

    /// Attach to a started sandbox and bridge it until exit
    ///
    /// `input_rx` carries host input when the session is interactive.
    pub(crate) async fn sbox_session(
        &self,
        id: &ContainerId,
        platform: HostPlatform,
        tty: bool,
        input_rx: Option<mpsc::Receiver<Vec<u8>>>,
    ) -> Result<ExitResult> {
        let interactive = input_rx.is_some();
        if let Err(e) = self.engine.start(id).await {
            self.discard(id, false).await;
            return Err(e.into());
        }

        let attached = self
            .engine
            .attach(
                id,
                &AttachConfig {
                    stdin: interactive,
                    stdout: true,
                    stderr: true,
                    logs: true,
                },
            )
            .await;
        let attach = match attached {
            Ok(attach) => attach,
            Err(e) => {
                self.discard(id, true).await;
                return Err(e.into());
            }
        };

        let output_task = if tty || (!interactive && platform.attach_output_reliable()) {
            stream::spawn_demux(attach.output, stdout_sink(), stderr_sink())
        } else {
            // Non-TTY attach output is dropped for interactive sessions
            drop(attach.output);
            match self.engine.logs(id, true).await {
                Ok(logs) => stream::spawn_demux(logs, stdout_sink(), stderr_sink()),
                Err(e) => {
                    self.discard(id, true).await;
                    return Err(e.into());
                }
            }
        };

        let cancel = self.shutdown.input_token().child_token();
        let mut input = attach.input;

        let raw_mode = if tty {
            match RawModeGuard::enable() {
                Ok(guard) => Some(guard),
                Err(e) => {
                    tracing::debug!("{}", e);
                    None
                }
            }
        } else {
            None
        };

        let resize_task = if tty {
            if let Err(e) = input.write_all(PROMPT_NUDGE).await {
                tracing::debug!("Prompt nudge failed: {}", e);
            }
            Some(stream::spawn_resize_forwarder(
                Arc::clone(&self.engine),
                id.clone(),
                cancel.clone(),
            ))
        } else {
            None
        };

        let pump_task = match input_rx {
            Some(rx) => {
                let engine = Arc::clone(&self.engine);
                let id = id.clone();
                let cancel = cancel.clone();
                Some(tokio::spawn(async move {
                    match stream::pump_input(rx, input, cancel).await {
                        Ok(PumpOutcome::Detached) => {
                            tracing::debug!("Detach sequence received, stopping {}", id.short());
                            if let Err(e) = engine.stop(&id).await {
                                tracing::warn!("Failed to stop container {}: {}", id.short(), e);
                            }
                        }
                        Ok(outcome) => tracing::debug!("Input pump ended: {:?}", outcome),
                        Err(e) => tracing::debug!("Input pump failed: {}", e),
                    }
                }))
            }
            None => None,
        };

        let exit = self.engine.wait(id).await;

        cancel.cancel();
        if let Some(task) = pump_task {
            task.abort();
        }
        if let Some(task) = resize_task {
            let _ = task.await;
        }
        drop(raw_mode);
        stream::finish_demux(output_task, OUTPUT_DRAIN_GRACE).await;

        Ok(exit?)
    }
}
