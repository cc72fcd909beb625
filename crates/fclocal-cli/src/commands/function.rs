//! Function commands: invoke, start

use anyhow::Result;
use fclocal_core::stream::{stderr_sink, stdout_sink};
use fclocal_core::{ContainerManager, InvokeRequest};

/// Invoke once; the exit code is the container's
pub async fn invoke(manager: &ContainerManager, request: InvokeRequest) -> Result<i32> {
    let exit = manager
        .invoke_function(request, stdout_sink(), stderr_sink())
        .await?;
    if let Some(error) = &exit.error {
        tracing::warn!("Container reported: {}", error);
    }
    Ok(super::exit_code(exit.status_code))
}

/// Run the local server until it exits or the user interrupts
pub async fn start(manager: &ContainerManager, request: InvokeRequest) -> Result<i32> {
    let name = format!(
        "{}/{}",
        request.definition.service.name, request.definition.function.name
    );
    let mut handle = manager
        .start_function(request, stdout_sink(), stderr_sink())
        .await?;
    tracing::info!(
        "Function {} running in container {}, press Ctrl-C to stop",
        name,
        handle.id().short()
    );
    let exit = handle.wait().await?;
    Ok(super::exit_code(exit.status_code))
}
