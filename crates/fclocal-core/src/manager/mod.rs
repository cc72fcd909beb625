//! Container manager - owns container lifecycles against the engine

mod exec;
mod image;
mod session;

pub use exec::ExecOptions;
pub use image::PullProgress;
pub use session::{InstallRequest, SboxRequest};

use crate::stream::{self, null_sink, Sink};
use crate::{HostOs, HostPlatform, ImageResolver, Result, SharedPaths, ShutdownCoordinator};
use crate::{platform, CoreError};
use fclocal_config::GlobalConfig;
use fclocal_provider::{AttachConfig, ContainerEngine, ContainerId, ContainerSpec, ExitResult};
use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

/// How long to wait for an output stream to drain after its container exits
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Main container manager
pub struct ContainerManager {
    engine: Arc<dyn ContainerEngine>,
    shutdown: Arc<ShutdownCoordinator>,
    resolver: ImageResolver,
    host_os: HostOs,
    /// Detected on first use
    platform: OnceCell<HostPlatform>,
    docker_settings: Option<PathBuf>,
    shared_paths: OnceLock<SharedPaths>,
    force_pull: bool,
}

impl ContainerManager {
    /// Create a manager for the current host
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        shutdown: Arc<ShutdownCoordinator>,
        config: &GlobalConfig,
    ) -> Self {
        Self {
            engine,
            shutdown,
            resolver: ImageResolver::from_config(&config.registry),
            host_os: HostOs::current(),
            platform: OnceCell::new(),
            docker_settings: config.sharing.docker_settings_path(),
            shared_paths: OnceLock::new(),
            force_pull: config.registry.force_pull,
        }
    }

    /// Create a manager for testing with injectable dependencies
    #[cfg(any(test, feature = "test-support"))]
    pub fn new_for_testing(
        engine: Arc<dyn ContainerEngine>,
        shutdown: Arc<ShutdownCoordinator>,
        resolver: ImageResolver,
        host_os: HostOs,
    ) -> Self {
        Self {
            engine,
            shutdown,
            resolver,
            host_os,
            platform: OnceCell::new(),
            docker_settings: None,
            shared_paths: OnceLock::new(),
            force_pull: false,
        }
    }

    pub fn with_shared_paths(self, paths: SharedPaths) -> Self {
        let _ = self.shared_paths.set(paths);
        self
    }

    pub fn with_force_pull(mut self, force_pull: bool) -> Self {
        self.force_pull = force_pull;
        self
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn resolver(&self) -> &ImageResolver {
        &self.resolver
    }

    /// Host OS and engine backend, detected once
    pub async fn platform(&self) -> Result<HostPlatform> {
        let platform = self
            .platform
            .get_or_try_init(|| async {
                // Only Windows hosts can run the toolbox backend
                if self.host_os != HostOs::Windows {
                    return Ok::<_, CoreError>(HostPlatform::native(self.host_os));
                }
                let info = self.engine.info().await?;
                let platform = HostPlatform::detect(self.host_os, &info);
                tracing::debug!("Detected platform {:?}", platform);
                Ok(platform)
            })
            .await?;
        Ok(*platform)
    }

    fn shared_paths(&self) -> &SharedPaths {
        self.shared_paths
            .get_or_init(|| SharedPaths::load(self.docker_settings.as_deref()))
    }

    /// Create a container and register it for coordinated shutdown
    pub async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let platform = self.platform().await?;

        let spec: Cow<'_, ContainerSpec> = if platform.is_legacy_toolbox() && !spec.mounts.is_empty()
        {
            let mut rewritten = spec.clone();
            rewritten.mounts = platform::toolbox_mounts(&spec.mounts);
            Cow::Owned(rewritten)
        } else {
            Cow::Borrowed(spec)
        };

        if platform.checks_shared_paths() {
            let paths = self.shared_paths().outside(&spec.mounts);
            if !paths.is_empty() {
                return Err(CoreError::PathNotShared { paths });
            }
        }

        tracing::debug!("Creating container: {:?}", spec);
        let id = self
            .engine
            .create(&spec)
            .await
            .map_err(|e| platform.classify_create_error(e))?;

        if !self.shutdown.register_container(&id) {
            self.discard(&id, false).await;
            return Err(CoreError::Interrupted);
        }
        tracing::debug!("Created container {}", id.short());
        Ok(id)
    }

    /// Tear down a container whose run failed before a handle existed
    async fn discard(&self, id: &ContainerId, started: bool) {
        let result = if started {
            self.engine.stop(id).await
        } else {
            self.engine.remove(id, true).await
        };
        if let Err(e) = result {
            tracing::warn!("Failed to clean up container {}: {}", id.short(), e);
        }
    }

    /// Run a container to completion
    ///
    /// Output is wired before start; `payload` is written to stdin which is
    /// then half-closed. The container is deregistered whatever the outcome.
    pub async fn run(
        &self,
        spec: &ContainerSpec,
        payload: Option<Vec<u8>>,
        out: Sink,
        err: Sink,
    ) -> Result<ExitResult> {
        let platform = self.platform().await?;
        let id = self.create(spec).await?;
        let result = self.run_created(&id, platform, payload, out, err).await;
        self.shutdown.deregister_container(&id);
        result
    }

    async fn run_created(
        &self,
        id: &ContainerId,
        platform: HostPlatform,
        payload: Option<Vec<u8>>,
        out: Sink,
        err: Sink,
    ) -> Result<ExitResult> {
        let attached = self
            .engine
            .attach(
                id,
                &AttachConfig {
                    stdin: true,
                    stdout: true,
                    stderr: true,
                    logs: false,
                },
            )
            .await;
        let attach = match attached {
            Ok(attach) => attach,
            Err(e) => {
                self.discard(id, false).await;
                return Err(e.into());
            }
        };

        let output_task = if platform.attach_output_reliable() {
            let task = stream::spawn_demux(attach.output, out, err);
            if let Err(e) = self.engine.start(id).await {
                task.abort();
                self.discard(id, false).await;
                return Err(e.into());
            }
            task
        } else {
            // Attach output is unreliable here; follow the logs instead
            drop(attach.output);
            if let Err(e) = self.engine.start(id).await {
                self.discard(id, false).await;
                return Err(e.into());
            }
            match self.engine.logs(id, true).await {
                Ok(logs) => stream::spawn_demux(logs, out, err),
                Err(e) => {
                    self.discard(id, true).await;
                    return Err(e.into());
                }
            }
        };

        let mut input = attach.input;
        if let Some(payload) = payload {
            if let Err(e) = input.write_all(&payload).await {
                tracing::debug!("Writing payload to {} failed: {}", id.short(), e);
            }
        }
        if let Err(e) = input.shutdown().await {
            tracing::debug!("Closing stdin of {} failed: {}", id.short(), e);
        }

        let exit = self.engine.wait(id).await?;
        stream::finish_demux(output_task, OUTPUT_DRAIN_GRACE).await;

        tracing::debug!(
            "Container {} exited with status {}",
            id.short(),
            exit.status_code
        );
        Ok(exit)
    }

    /// Create, register and start a container, following its logs when a
    /// sink is given
    pub async fn start_container(
        &self,
        spec: &ContainerSpec,
        out: Option<Sink>,
        err: Option<Sink>,
    ) -> Result<ContainerHandle> {
        let id = self.create(spec).await?;

        if let Err(e) = self.engine.start(&id).await {
            self.discard(&id, false).await;
            self.shutdown.deregister_container(&id);
            return Err(e.into());
        }

        let log_task = if out.is_some() || err.is_some() {
            let logs = match self.engine.logs(&id, true).await {
                Ok(logs) => logs,
                Err(e) => {
                    self.discard(&id, true).await;
                    self.shutdown.deregister_container(&id);
                    return Err(e.into());
                }
            };
            Some(stream::spawn_demux(
                logs,
                out.unwrap_or_else(null_sink),
                err.unwrap_or_else(null_sink),
            ))
        } else {
            None
        };

        tracing::info!("Started container {}", id.short());
        Ok(ContainerHandle {
            id,
            engine: Arc::clone(&self.engine),
            shutdown: Arc::clone(&self.shutdown),
            log_task,
        })
    }
}

/// A started container owned by the caller
pub struct ContainerHandle {
    id: ContainerId,
    engine: Arc<dyn ContainerEngine>,
    shutdown: Arc<ShutdownCoordinator>,
    log_task: Option<JoinHandle<Result<()>>>,
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ContainerHandle {
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Stop the container and drop it from the shutdown registry
    pub async fn stop(&mut self) -> Result<()> {
        let result = self.engine.stop(&self.id).await;
        self.shutdown.deregister_container(&self.id);
        if let Some(task) = self.log_task.take() {
            stream::finish_demux(task, OUTPUT_DRAIN_GRACE).await;
        }
        result?;
        tracing::debug!("Stopped container {}", self.id.short());
        Ok(())
    }

    /// Wait for the container to exit on its own
    pub async fn wait(&mut self) -> Result<ExitResult> {
        let exit = self.engine.wait(&self.id).await;
        self.shutdown.deregister_container(&self.id);
        if let Some(task) = self.log_task.take() {
            stream::finish_demux(task, OUTPUT_DRAIN_GRACE).await;
        }
        Ok(exit?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{resolver_for_tests, CaptureWriter, MockCall, MockEngine};
    use crate::EngineBackend;
    use fclocal_provider::{EngineInfo, LogChunk, MountConfig};

    fn manager(engine: &Arc<MockEngine>, os: HostOs) -> ContainerManager {
        let engine: Arc<dyn ContainerEngine> = engine.clone();
        let shutdown = ShutdownCoordinator::new(engine.clone());
        ContainerManager::new_for_testing(engine, shutdown, resolver_for_tests(), os)
    }

    fn spec_with_mounts(mounts: Vec<MountConfig>) -> ContainerSpec {
        ContainerSpec {
            image: "aliyunfc/runtime-nodejs8:1.6.0".into(),
            mounts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_delivers_output_and_empties_registry() {
        let engine = Arc::new(MockEngine::new());
        engine.set_output(vec![LogChunk::StdOut(b"hello from fc\n".to_vec())]);
        let mgr = manager(&engine, HostOs::Linux);

        let (out, out_buf) = CaptureWriter::new();
        let (err, err_buf) = CaptureWriter::new();
        let exit = mgr
            .run(
                &spec_with_mounts(vec![]),
                Some(b"{\"key\":1}".to_vec()),
                Box::pin(out),
                Box::pin(err),
            )
            .await
            .unwrap();

        assert_eq!(exit.status_code, 0);
        assert!(exit.success());
        assert_eq!(out_buf.contents(), b"hello from fc\n");
        assert!(err_buf.contents().is_empty());
        assert_eq!(mgr.shutdown().active_count(), 0);
        assert_eq!(engine.stdin.contents(), b"{\"key\":1}");
        assert!(engine.stdin.is_closed());

        let calls = engine.get_calls();
        let attach = calls.iter().position(|c| matches!(c, MockCall::Attach { .. })).unwrap();
        let start = calls.iter().position(|c| matches!(c, MockCall::Start { .. })).unwrap();
        assert!(attach < start);
        assert!(!calls.iter().any(|c| matches!(c, MockCall::Logs { .. })));
    }

    #[tokio::test]
    async fn test_run_reports_nonzero_exit() {
        let engine = Arc::new(MockEngine::new());
        engine.set_exit(ExitResult {
            status_code: 2,
            error: None,
        });
        let mgr = manager(&engine, HostOs::Linux);
        let exit = mgr
            .run(&spec_with_mounts(vec![]), None, null_sink(), null_sink())
            .await
            .unwrap();
        assert_eq!(exit.status_code, 2);
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[tokio::test]
    async fn test_run_on_windows_follows_logs() {
        let engine = Arc::new(MockEngine::new());
        engine.set_output(vec![LogChunk::StdErr(b"oops\n".to_vec())]);
        let mgr = manager(&engine, HostOs::Windows);
        let (err, err_buf) = CaptureWriter::new();
        mgr.run(&spec_with_mounts(vec![]), None, null_sink(), Box::pin(err))
            .await
            .unwrap();

        assert_eq!(err_buf.contents(), b"oops\n");
        let calls = engine.get_calls();
        let start = calls.iter().position(|c| matches!(c, MockCall::Start { .. })).unwrap();
        let logs = calls
            .iter()
            .position(|c| matches!(c, MockCall::Logs { follow: true, .. }))
            .unwrap();
        assert!(start < logs);
    }

    #[tokio::test]
    async fn test_mac_rejects_unshared_paths() {
        let engine = Arc::new(MockEngine::new());
        let mgr = manager(&engine, HostOs::MacOs).with_shared_paths(SharedPaths::default());
        let err = mgr
            .create(&spec_with_mounts(vec![
                MountConfig::bind("/Users/dev/code", "/code", true),
                MountConfig::bind("/opt/data", "/mnt/data", false),
            ]))
            .await
            .unwrap_err();
        match err {
            CoreError::PathNotShared { paths } => assert_eq!(paths, vec!["/opt/data"]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!engine.get_calls().iter().any(|c| matches!(c, MockCall::Create { .. })));
    }

    #[tokio::test]
    async fn test_toolbox_rewrites_mount_sources() {
        let engine = Arc::new(MockEngine::new());
        engine.set_info(EngineInfo {
            labels: vec!["provider=virtualbox".into()],
            ..Default::default()
        });
        let mgr = manager(&engine, HostOs::Windows);
        assert_eq!(mgr.platform().await.unwrap().backend, EngineBackend::LegacyToolbox);

        mgr.create(&spec_with_mounts(vec![MountConfig::bind(
            "C:\\Users\\dev\\code",
            "/code",
            true,
        )]))
        .await
        .unwrap();
        assert_eq!(engine.created_specs()[0].mounts[0].source, "/c/Users/dev/code");
    }

    #[tokio::test]
    async fn test_create_error_classified_and_not_registered() {
        let engine = Arc::new(MockEngine::new());
        *engine.create_error.lock().unwrap() = Some("F: drive is not shared".into());
        let mgr = manager(&engine, HostOs::Windows);
        let err = mgr.create(&spec_with_mounts(vec![])).await.unwrap_err();
        assert!(matches!(err, CoreError::DriveNotShared(_)));
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[tokio::test]
    async fn test_platform_detected_once() {
        let engine = Arc::new(MockEngine::new());
        let mgr = manager(&engine, HostOs::Windows);
        mgr.platform().await.unwrap();
        mgr.platform().await.unwrap();
        assert_eq!(engine.count_calls(|c| matches!(c, MockCall::Info)), 1);

        let linux = manager(&engine, HostOs::Linux);
        linux.platform().await.unwrap();
        assert_eq!(engine.count_calls(|c| matches!(c, MockCall::Info)), 1);
    }

    #[tokio::test]
    async fn test_start_container_handle_stop() {
        let engine = Arc::new(MockEngine::new());
        engine.set_output(vec![LogChunk::StdOut(b"listening\n".to_vec())]);
        let mgr = manager(&engine, HostOs::Linux);

        let (out, out_buf) = CaptureWriter::new();
        let mut handle = mgr
            .start_container(&spec_with_mounts(vec![]), Some(Box::pin(out)), None)
            .await
            .unwrap();
        assert!(mgr.shutdown().is_registered(&handle.id().0));

        handle.stop().await.unwrap();
        assert!(!mgr.shutdown().is_registered(&handle.id().0));
        assert_eq!(out_buf.contents(), b"listening\n");
        assert!(engine.was_called(&MockCall::Stop {
            id: handle.id().0.clone()
        }));
    }

    #[tokio::test]
    async fn test_create_during_shutdown_removes_container() {
        let engine = Arc::new(MockEngine::new());
        let mgr = manager(&engine, HostOs::Linux);
        mgr.shutdown().shutdown().await;

        let err = mgr.create(&spec_with_mounts(vec![])).await.unwrap_err();
        assert!(matches!(err, CoreError::Interrupted));
        assert_eq!(mgr.shutdown().active_count(), 0);
        assert!(engine.was_called(&MockCall::Remove {
            id: "mock_container_0".into(),
            force: true
        }));
    }

    #[tokio::test]
    async fn test_start_container_log_failure_stops_container() {
        let engine = Arc::new(MockEngine::new());
        *engine.logs_error.lock().unwrap() = Some("log driver unavailable".into());
        let mgr = manager(&engine, HostOs::Linux);

        let (out, _) = CaptureWriter::new();
        let err = mgr
            .start_container(&spec_with_mounts(vec![]), Some(Box::pin(out)), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("log driver unavailable"));
        assert!(engine.was_called(&MockCall::Stop {
            id: "mock_container_0".into()
        }));
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[tokio::test]
    async fn test_start_container_start_failure_removes_container() {
        let engine = Arc::new(MockEngine::new());
        *engine.start_error.lock().unwrap() = Some("port is already allocated".into());
        let mgr = manager(&engine, HostOs::Linux);

        let err = mgr
            .start_container(&spec_with_mounts(vec![]), None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("port is already allocated"));
        assert!(engine.was_called(&MockCall::Remove {
            id: "mock_container_0".into(),
            force: true
        }));
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[tokio::test]
    async fn test_run_attach_failure_removes_container() {
        let engine = Arc::new(MockEngine::new());
        *engine.attach_error.lock().unwrap() = Some("attach refused".into());
        let mgr = manager(&engine, HostOs::Linux);

        let err = mgr
            .run(&spec_with_mounts(vec![]), None, null_sink(), null_sink())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("attach refused"));
        assert!(engine.was_called(&MockCall::Remove {
            id: "mock_container_0".into(),
            force: true
        }));
        assert!(!engine.get_calls().iter().any(|c| matches!(c, MockCall::Start { .. })));
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[tokio::test]
    async fn test_run_start_failure_removes_container() {
        let engine = Arc::new(MockEngine::new());
        *engine.start_error.lock().unwrap() = Some("no such image".into());
        let mgr = manager(&engine, HostOs::Linux);

        mgr.run(&spec_with_mounts(vec![]), None, null_sink(), null_sink())
            .await
            .unwrap_err();
        assert!(engine.was_called(&MockCall::Remove {
            id: "mock_container_0".into(),
            force: true
        }));
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[tokio::test]
    async fn test_run_log_failure_on_windows_stops_container() {
        let engine = Arc::new(MockEngine::new());
        *engine.logs_error.lock().unwrap() = Some("logs unavailable".into());
        let mgr = manager(&engine, HostOs::Windows);

        mgr.run(&spec_with_mounts(vec![]), None, null_sink(), null_sink())
            .await
            .unwrap_err();
        assert!(engine.was_called(&MockCall::Stop {
            id: "mock_container_0".into()
        }));
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[test]
    fn test_handle_debug_shows_id() {
        let engine: Arc<dyn ContainerEngine> = Arc::new(MockEngine::new());
        let handle = ContainerHandle {
            id: ContainerId::new("abc123"),
            engine: engine.clone(),
            shutdown: ShutdownCoordinator::new(engine),
            log_task: None,
        };
        assert!(format!("{:?}", handle).contains("abc123"));
    }

    #[tokio::test]
    async fn test_start_container_without_sinks_skips_logs() {
        let engine = Arc::new(MockEngine::new());
        let mgr = manager(&engine, HostOs::Linux);
        let _handle = mgr
            .start_container(&spec_with_mounts(vec![]), None, None)
            .await
            .unwrap();
        assert!(!engine.get_calls().iter().any(|c| matches!(c, MockCall::Logs { .. })));
        assert_eq!(mgr.shutdown().active_count(), 1);
    }
}
