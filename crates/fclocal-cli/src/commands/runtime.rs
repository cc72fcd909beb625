//! Runtime container commands: install, sbox

use anyhow::Result;
use fclocal_core::spec::EnvVars;
use fclocal_core::{ContainerManager, ExecOptions, InstallRequest, SboxRequest};

/// Run one command in a fresh install container, then stop it
pub async fn install(
    manager: &ContainerManager,
    request: InstallRequest,
    cwd: String,
    env: EnvVars,
    cmd: Vec<String>,
    verbose: bool,
) -> Result<i32> {
    let mut handle = manager.start_installation_container(request).await?;

    let result = handle
        .exec(
            &cmd,
            ExecOptions {
                cwd: Some(cwd),
                env,
                verbose,
                ..Default::default()
            },
        )
        .await;

    if let Err(e) = handle.stop().await {
        tracing::warn!("Failed to stop install container: {}", e);
    }

    result?;
    tracing::info!("Executed: {}", shell_words::join(&cmd));
    Ok(0)
}

pub async fn sbox(manager: &ContainerManager, request: SboxRequest) -> Result<i32> {
    let exit = manager.start_sbox_container(request).await?;
    Ok(super::exit_code(exit.status_code))
}
