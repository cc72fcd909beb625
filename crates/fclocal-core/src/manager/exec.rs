//! Exec inside a started container

use super::{ContainerHandle, OUTPUT_DRAIN_GRACE};
use crate::spec::{with_runtime_paths, EnvVars};
use crate::stream::{self, null_sink, stderr_sink, stdout_sink, Sink};
use crate::{CoreError, Result};
use fclocal_provider::ExecConfig;
use std::time::Duration;

/// Interval between exec inspections while waiting for completion
pub const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Options for [`ContainerHandle::exec`]
#[derive(Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: EnvVars,
    /// Defaults to host stdout; only used when `verbose`
    pub out: Option<Sink>,
    /// Defaults to host stderr
    pub err: Option<Sink>,
    /// Show command stdout
    pub verbose: bool,
}

impl ContainerHandle {
    /// Run a command with stdin closed and wait for it to finish
    ///
    /// Completion is detected by polling the exec state; a non-zero exit is
    /// reported as [`CoreError::CommandExecution`].
    pub async fn exec(&self, cmd: &[String], opts: ExecOptions) -> Result<i64> {
        let config = ExecConfig {
            cmd: cmd.to_vec(),
            env: with_runtime_paths(opts.env, &[]).into_vec(),
            working_dir: opts.cwd,
            tty: false,
            attach_stdin: false,
        };
        tracing::debug!("docker exec in {}: {:?}", self.id.short(), config);

        let exec_id = self.engine.exec_create(&self.id, &config).await?;
        let output = self.engine.exec_start(&exec_id).await?;

        let out = if opts.verbose {
            opts.out.unwrap_or_else(stdout_sink)
        } else {
            null_sink()
        };
        let err = opts.err.unwrap_or_else(stderr_sink);
        let output_task = stream::spawn_demux(output, out, err);

        let state = loop {
            let state = self.engine.exec_inspect(&exec_id).await?;
            if !state.running {
                break state;
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        };
        stream::finish_demux(output_task, OUTPUT_DRAIN_GRACE).await;

        match state.exit_code {
            Some(0) => Ok(0),
            code => {
                let exit_code = code.unwrap_or(-1);
                tracing::debug!(
                    "exec {:?} ({:?}) exited with {}",
                    cmd,
                    state.entrypoint,
                    exit_code
                );
                Err(CoreError::CommandExecution {
                    command: shell_words::join(cmd),
                    exit_code,
                })
            }
        }
    }
}
