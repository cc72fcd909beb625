//! Container descriptors for each execution mode
//!
//! Builders here are pure: they take resolved images, mounts and environment
//! and return a [`ContainerSpec`] ready for the engine. Four modes exist:
//! dependency install, local invoke, local start (long running) and the
//! interactive sandbox.

pub mod debug;
pub mod env;
pub mod mounts;

pub use debug::{debug_env, debug_ports, vscode_launch_config, DebugConfig, DebugIde};
pub use env::{
    function_env, install_target_env, with_runtime_paths, EnvVars, FunctionEnvOptions,
    LocalCredentials,
};
pub use mounts::{
    absolute_path, code_mount, install_target_mounts, nas_mappings, nas_mounts, tmp_dir_mount,
    InstallTarget, NasMapping,
};

use crate::{CoreError, Result};
use base64::Engine as _;
use fclocal_config::{FunctionProps, NasConfig};
use fclocal_provider::{ContainerSpec, MountConfig};

/// Container uid and gid unless NAS settings override them
pub const DEFAULT_CONTAINER_ID: i64 = 10003;

const DEFAULT_SHELL: &str = "/bin/bash";

/// `uid:gid` for function containers
pub fn docker_user(nas: Option<&NasConfig>) -> String {
    let (mut uid, mut gid) = (DEFAULT_CONTAINER_ID, DEFAULT_CONTAINER_ID);
    if let Some(NasConfig::Explicit(settings)) = nas {
        if settings.user_id != -1 {
            uid = settings.user_id;
        }
        if settings.group_id != -1 {
            gid = settings.group_id;
        }
    }
    format!("{}:{}", uid, gid)
}

/// `fun_local_<millis>_<7 random chars>`
pub fn container_name() -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(7).collect();
    format!(
        "fun_local_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        suffix
    )
}

/// Entrypoint of the long-running local server
pub fn mock_script(runtime: &str) -> String {
    format!("/var/fc/runtime/{}/mock.sh", runtime)
}

/// How the event reaches the function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDelivery {
    /// Written to the attached stdin, then half-closed
    Stdin(Vec<u8>),
    /// Passed base64 encoded on the command line
    Inline(Vec<u8>),
}

/// Arguments for the runtime agent
///
/// `-h <handler>`, the event flags, then `--http`, `-i <initializer>` and
/// `--initializationTimeout <n>` when they apply.
pub fn invoke_command(
    props: &FunctionProps,
    event: Option<&EventDelivery>,
    http: bool,
    invoke_initializer: bool,
) -> Vec<String> {
    let mut cmd = vec!["-h".to_string(), props.handler.clone()];

    match event {
        Some(EventDelivery::Inline(payload)) => {
            cmd.push("--event".into());
            cmd.push(base64::engine::general_purpose::STANDARD.encode(payload));
            cmd.push("--event-decode".into());
        }
        _ => cmd.push("--stdin".into()),
    }

    if http {
        cmd.push("--http".into());
    }

    if let Some(initializer) = props.initializer.as_ref().filter(|_| invoke_initializer) {
        cmd.push("-i".into());
        cmd.push(initializer.clone());
    }

    if let Some(timeout) = props.initialization_timeout.filter(|t| *t > 0) {
        cmd.push("--initializationTimeout".into());
        cmd.push(timeout.to_string());
    }

    tracing::debug!("Invoke command: {:?}", cmd);
    cmd
}

/// Inputs shared by the invoke and start builders
#[derive(Debug, Clone, Default)]
pub struct LocalRunSpec {
    pub runtime: String,
    pub image: String,
    pub name: String,
    pub mounts: Vec<MountConfig>,
    pub cmd: Vec<String>,
    /// Complete environment, see [`function_env`]
    pub env: EnvVars,
    pub user: String,
    pub debug: Option<DebugConfig>,
}

fn local_base(run: LocalRunSpec) -> Result<ContainerSpec> {
    let ports = match &run.debug {
        Some(debug) => debug_ports(&run.runtime, debug)?,
        None => Vec::new(),
    };
    Ok(ContainerSpec {
        image: run.image,
        name: Some(run.name),
        cmd: run.cmd,
        env: run.env.into_vec(),
        user: Some(run.user),
        auto_remove: true,
        mounts: run.mounts,
        ports,
        ..Default::default()
    })
}

/// One-shot invocation fed through stdin
pub fn invoke_spec(run: LocalRunSpec) -> Result<ContainerSpec> {
    let spec = ContainerSpec {
        tty: false,
        open_stdin: true,
        stdin_once: true,
        attach_stdin: true,
        attach_stdout: true,
        attach_stderr: true,
        ..local_base(run)?
    };
    tracing::debug!("Invoke container spec: {:?}", spec);
    Ok(spec)
}

/// Long-running local server started through the mock script
pub fn start_spec(run: LocalRunSpec) -> Result<ContainerSpec> {
    let entrypoint = vec![mock_script(&run.runtime)];
    let spec = ContainerSpec {
        entrypoint: Some(entrypoint),
        ..local_base(run)?
    };
    tracing::debug!("Start container spec: {:?}", spec);
    Ok(spec)
}

/// Dependency installation container: a TTY running a shell
pub fn install_spec(image: &str, mounts: Vec<MountConfig>, env: EnvVars) -> ContainerSpec {
    ContainerSpec {
        image: image.to_string(),
        cmd: vec![DEFAULT_SHELL.to_string()],
        env: with_runtime_paths(env, &[]).into_vec(),
        tty: true,
        auto_remove: true,
        mounts,
        ..Default::default()
    }
}

/// Inputs for the sandbox builder
#[derive(Debug, Clone, Default)]
pub struct SboxOptions {
    pub runtime: String,
    pub image: String,
    pub mounts: Vec<MountConfig>,
    pub env: EnvVars,
    /// Shell command string, `/bin/bash` when empty
    pub cmd: Option<String>,
    pub tty: bool,
    pub interactive: bool,
}

/// Interactive sandbox shell
pub fn sbox_spec(opts: SboxOptions) -> Result<ContainerSpec> {
    let raw = opts.cmd.as_deref().unwrap_or("");
    let mut cmd = shell_words::split(raw)
        .map_err(|e| CoreError::InvalidCommand(format!("cannot parse '{}': {}", raw, e)))?;
    if cmd.is_empty() {
        cmd.push(DEFAULT_SHELL.to_string());
    }

    Ok(ContainerSpec {
        image: opts.image,
        hostname: Some(format!("fc-{}", opts.runtime)),
        cmd,
        env: with_runtime_paths(opts.env, &[]).into_vec(),
        tty: opts.tty,
        open_stdin: opts.interactive,
        stdin_once: true,
        attach_stdin: opts.interactive,
        attach_stdout: true,
        attach_stderr: true,
        auto_remove: true,
        mounts: opts.mounts,
        ..Default::default()
    })
}
