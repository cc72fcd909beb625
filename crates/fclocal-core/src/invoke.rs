//! Local invoke and start orchestration
//!
//! Turns a function definition into a container: resolves the runtime
//! image, mounts code, NAS and temp directories, assembles the environment
//! and hands the descriptor to the [`ContainerManager`].

use crate::spec::{
    self, absolute_path, code_mount, debug_env, function_env, nas_mappings, nas_mounts,
    tmp_dir_mount, vscode_launch_config, DebugConfig, DebugIde, EnvVars, EventDelivery,
    FunctionEnvOptions, LocalCredentials, LocalRunSpec,
};
use crate::stream::Sink;
use crate::{ContainerHandle, ContainerManager, Result};
use fclocal_config::FunctionDefinition;
use fclocal_provider::ExitResult;
use std::path::{Path, PathBuf};

/// Everything needed to run a function locally
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub definition: FunctionDefinition,
    /// Directory the definition was loaded from; code and NAS paths resolve against it
    pub base_dir: PathBuf,
    pub event: Option<EventDelivery>,
    pub debug: Option<DebugConfig>,
    /// Raw value for `FC_HTTP_PARAMS`
    pub http_params: Option<String>,
    /// Host directory mounted on `/tmp`
    pub tmp_dir: Option<PathBuf>,
    pub invoke_initializer: bool,
    /// Run the agent in HTTP mode
    pub http: bool,
    pub credentials: LocalCredentials,
}

impl InvokeRequest {
    pub fn new(definition: FunctionDefinition, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            definition,
            base_dir: base_dir.into(),
            event: None,
            debug: None,
            http_params: None,
            tmp_dir: None,
            invoke_initializer: true,
            http: false,
            credentials: LocalCredentials::default(),
        }
    }

    pub fn with_event(mut self, event: EventDelivery) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_debug(mut self, debug: DebugConfig) -> Self {
        self.debug = Some(debug);
        self
    }
}

/// Attach instructions for the configured IDE, `None` without a debug port
pub fn debug_tips(definition: &FunctionDefinition, code_dir: &Path, debug: Option<&DebugConfig>) -> Result<Option<String>> {
    let Some(debug) = debug else {
        return Ok(None);
    };

    let tips = match debug.ide {
        DebugIde::VsCode => {
            let config = vscode_launch_config(
                &definition.service.name,
                &definition.function.name,
                &definition.function.runtime,
                code_dir,
                debug.port,
            )?;
            format!(
                "you can paste these config to .vscode/launch.json, and then attach to your running function\n\
                 ///////////////// config begin /////////////////\n\
                 {}\n\
                 ///////////////// config end /////////////////",
                serde_json::to_string_pretty(&config)?
            )
        }
        DebugIde::PyCharm => {
            let mapped = if code_dir.is_dir() {
                code_dir
            } else {
                code_dir.parent().unwrap_or(code_dir)
            };
            let ip = spec::debug::local_ip();
            format!(
                "========= Tips for PyCharm remote debug =========\n\
                 Local host name: {ip}\n\
                 Port           : {port}\n\
                 Path mappings  : {path}=/code\n\n\
                 Debug Code needed to copy to your function code:\n\n\
                 import pydevd\n\
                 pydevd.settrace('{ip}', port={port}, stdoutToServer=True, stderrToServer=True)",
                ip = ip,
                port = debug.port,
                path = mapped.display()
            )
        }
    };
    Ok(Some(tips))
}

impl ContainerManager {
    async fn local_run_spec(&self, request: &InvokeRequest) -> Result<LocalRunSpec> {
        let definition = &request.definition;
        let props = &definition.function;
        let nas = definition.service.nas_config.as_ref();

        let image = self.resolver().resolve(&props.runtime, false).await?;
        self.pull_image_if_needed(&image, None).await?;

        let code_dir = absolute_path(&definition.code_uri(&request.base_dir))?;
        let mut mounts = vec![code_mount(&code_dir, true)?];
        mounts.extend(nas_mounts(&nas_mappings(
            &request.base_dir,
            nas,
            &definition.service.name,
        ))?);
        mounts.extend(tmp_dir_mount(request.tmp_dir.as_deref())?);

        let debug_vars = match &request.debug {
            Some(debug) => debug_env(&props.runtime, debug)?,
            None => EnvVars::new(),
        };
        let env = function_env(
            props,
            FunctionEnvOptions {
                code_dir: Some(code_dir.as_path()).filter(|p| p.is_dir()),
                nas,
                http_params: request.http_params.as_deref(),
                http_trigger: props.http_trigger,
                debug_env: debug_vars,
                credentials: request.credentials.clone(),
            },
        )?;

        if let Some(tips) = debug_tips(definition, &code_dir, request.debug.as_ref())? {
            tracing::info!("{}", tips);
        }

        Ok(LocalRunSpec {
            runtime: props.runtime.clone(),
            image,
            name: spec::container_name(),
            mounts,
            cmd: spec::invoke_command(
                props,
                request.event.as_ref(),
                request.http,
                request.invoke_initializer,
            ),
            env,
            user: spec::docker_user(nas),
            debug: request.debug,
        })
    }

    /// Invoke a function once and wait for it to exit
    ///
    /// A stdin-delivered event is written to the container and stdin is
    /// then closed.
    pub async fn invoke_function(&self, request: InvokeRequest, out: Sink, err: Sink) -> Result<ExitResult> {
        let run = self.local_run_spec(&request).await?;
        let container_spec = spec::invoke_spec(run)?;

        let payload = match request.event {
            Some(EventDelivery::Stdin(payload)) => Some(payload),
            _ => None,
        };
        tracing::info!(
            "Invoking function {}/{}",
            request.definition.service.name,
            request.definition.function.name
        );
        self.run(&container_spec, payload, out, err).await
    }

    /// Start the long-running local server for a function
    pub async fn start_function(&self, request: InvokeRequest, out: Sink, err: Sink) -> Result<ContainerHandle> {
        let run = self.local_run_spec(&request).await?;
        let container_spec = spec::start_spec(run)?;
        self.start_container(&container_spec, Some(out), Some(err)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{resolver_for_tests, CaptureWriter, MockEngine};
    use crate::{CoreError, HostOs, ShutdownCoordinator};
    use fclocal_config::{FunctionProps, NasConfig, NasMountPoint, NasSettings, ServiceProps};
    use fclocal_provider::{ContainerEngine, LogChunk};
    use std::sync::Arc;

    fn manager(engine: &Arc<MockEngine>) -> ContainerManager {
        let dyn_engine: Arc<dyn ContainerEngine> = engine.clone();
        let shutdown = ShutdownCoordinator::new(dyn_engine.clone());
        ContainerManager::new_for_testing(dyn_engine, shutdown, resolver_for_tests(), HostOs::Linux)
    }

    fn definition(runtime: &str) -> FunctionDefinition {
        FunctionDefinition {
            service: ServiceProps {
                name: "demo".into(),
                nas_config: None,
            },
            function: FunctionProps {
                name: "hello".into(),
                runtime: runtime.into(),
                handler: "index.handler".into(),
                environment_variables: [("GREETING".to_string(), "hi".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_invoke_function_runs_container() {
        let engine = Arc::new(MockEngine::new());
        engine.set_output(vec![LogChunk::StdOut(b"hello world\n".to_vec())]);
        let mgr = manager(&engine);
        let base = tempfile::tempdir().unwrap();

        let (out, out_buf) = CaptureWriter::new();
        let request = InvokeRequest::new(definition("nodejs8"), base.path())
            .with_event(EventDelivery::Stdin(b"{\"a\":1}".to_vec()));
        let exit = mgr
            .invoke_function(request, Box::pin(out), crate::stream::null_sink())
            .await
            .unwrap();

        assert!(exit.success());
        assert_eq!(out_buf.contents(), b"hello world\n");
        assert_eq!(engine.stdin.contents(), b"{\"a\":1}");
        assert_eq!(mgr.shutdown().active_count(), 0);

        let spec = &engine.created_specs()[0];
        assert_eq!(spec.image, "aliyunfc/runtime-nodejs8:1.6.0");
        assert_eq!(spec.cmd, vec!["-h", "index.handler", "--stdin"]);
        assert_eq!(spec.user.as_deref(), Some("10003:10003"));
        assert!(spec.name.as_deref().unwrap().starts_with("fun_local_"));
        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(spec.mounts[0].target, "/code");
        assert!(spec.mounts[0].read_only);
        assert_eq!(spec.env_var("GREETING"), Some("hi"));
        assert_eq!(spec.env_var("local"), Some("true"));
        assert!(spec.open_stdin && spec.stdin_once && !spec.tty);
    }

    #[tokio::test]
    async fn test_inline_event_skips_stdin_payload() {
        let engine = Arc::new(MockEngine::new());
        let mgr = manager(&engine);
        let base = tempfile::tempdir().unwrap();

        let request = InvokeRequest::new(definition("python3"), base.path())
            .with_event(EventDelivery::Inline(b"{}".to_vec()));
        mgr.invoke_function(request, crate::stream::null_sink(), crate::stream::null_sink())
            .await
            .unwrap();

        assert!(engine.stdin.contents().is_empty());
        assert!(engine.stdin.is_closed());
        let spec = &engine.created_specs()[0];
        assert_eq!(spec.cmd, vec!["-h", "index.handler", "--event", "e30=", "--event-decode"]);
    }

    #[tokio::test]
    async fn test_invoke_mounts_nas_and_tmp() {
        let engine = Arc::new(MockEngine::new());
        let mgr = manager(&engine);
        let base = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();

        let mut def = definition("nodejs8");
        def.service.nas_config = Some(NasConfig::Explicit(NasSettings {
            user_id: 1000,
            group_id: -1,
            mount_points: vec![NasMountPoint {
                server_addr: "nas.example.com:/share".into(),
                mount_dir: "/mnt/nas".into(),
            }],
        }));
        let mut request = InvokeRequest::new(def, base.path());
        request.tmp_dir = Some(tmp.path().to_path_buf());
        mgr.invoke_function(request, crate::stream::null_sink(), crate::stream::null_sink())
            .await
            .unwrap();

        let spec = &engine.created_specs()[0];
        let targets: Vec<&str> = spec.mounts.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(targets, vec!["/code", "/mnt/nas", "/tmp"]);
        assert!(base.path().join(".fun/nas/nas.example.com/share").is_dir());
        assert_eq!(spec.user.as_deref(), Some("1000:10003"));
        assert!(spec.env_var("PATH").unwrap().contains("/mnt/nas/python/bin"));
    }

    #[tokio::test]
    async fn test_invoke_with_debug_publishes_port() {
        let engine = Arc::new(MockEngine::new());
        let mgr = manager(&engine);
        let base = tempfile::tempdir().unwrap();

        let request = InvokeRequest::new(definition("nodejs8"), base.path()).with_debug(DebugConfig {
            port: 9229,
            ide: DebugIde::VsCode,
        });
        mgr.invoke_function(request, crate::stream::null_sink(), crate::stream::null_sink())
            .await
            .unwrap();

        let spec = &engine.created_specs()[0];
        assert_eq!(spec.ports.len(), 1);
        assert_eq!(spec.ports[0].host_port, 9229);
        assert_eq!(
            spec.env_var("DEBUG_OPTIONS"),
            Some("--inspect-brk=0.0.0.0:9229")
        );
    }

    #[tokio::test]
    async fn test_start_function_uses_mock_script() {
        let engine = Arc::new(MockEngine::new());
        let mgr = manager(&engine);
        let base = tempfile::tempdir().unwrap();

        let mut handle = mgr
            .start_function(
                InvokeRequest::new(definition("java8"), base.path()),
                crate::stream::null_sink(),
                crate::stream::null_sink(),
            )
            .await
            .unwrap();
        let spec = &engine.created_specs()[0];
        assert_eq!(
            spec.entrypoint,
            Some(vec!["/var/fc/runtime/java8/mock.sh".to_string()])
        );
        assert_eq!(mgr.shutdown().active_count(), 1);
        handle.stop().await.unwrap();
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_runtime_creates_nothing() {
        let engine = Arc::new(MockEngine::new());
        let mgr = manager(&engine);
        let base = tempfile::tempdir().unwrap();
        let err = mgr
            .invoke_function(
                InvokeRequest::new(definition("go1"), base.path()),
                crate::stream::null_sink(),
                crate::stream::null_sink(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedRuntime(_)));
        assert!(engine.created_specs().is_empty());
    }

    #[test]
    fn test_debug_tips() {
        let code = tempfile::tempdir().unwrap();
        let def = definition("python3");
        assert!(debug_tips(&def, code.path(), None).unwrap().is_none());

        let vscode = debug_tips(
            &def,
            code.path(),
            Some(&DebugConfig {
                port: 5678,
                ide: DebugIde::VsCode,
            }),
        )
        .unwrap()
        .unwrap();
        assert!(vscode.contains("\"port\": 5678"));
        assert!(vscode.contains("fc/demo/hello"));

        let pycharm = debug_tips(
            &def,
            code.path(),
            Some(&DebugConfig {
                port: 5678,
                ide: DebugIde::PyCharm,
            }),
        )
        .unwrap()
        .unwrap();
        assert!(pycharm.contains("port=5678"));
        assert!(pycharm.contains("=/code"));
    }
}
