//! Test support utilities for fclocal-core
//!
//! Provides MockEngine and helpers for unit testing the ContainerManager
//! without requiring a real container engine.

use crate::{ImageResolver, ReachabilityProbe, RegistryProbe};
use async_trait::async_trait;
use fclocal_config::{RegistryConfig, RegistryMode};
use fclocal_provider::*;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::watch;

/// Records which methods were called on the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Ping,
    Info,
    Create { image: String, name: Option<String> },
    Start { id: String },
    Stop { id: String },
    Remove { id: String, force: bool },
    Attach { id: String },
    Logs { id: String, follow: bool },
    Wait { id: String },
    Resize { id: String, rows: u16, cols: u16 },
    ExecCreate { id: String, cmd: Vec<String> },
    ExecStart { exec_id: String },
    ExecInspect { exec_id: String },
    ImageExists { reference: String },
    Pull { reference: String },
    Build { tag: String, dockerfile: String },
    Download { id: String, path: String },
}

/// Shared view of everything written to a [`CaptureWriter`]
#[derive(Debug, Clone, Default)]
pub struct CaptureHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl CaptureHandle {
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }

    /// Whether the writer was shut down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn writer(&self) -> CaptureWriter {
        CaptureWriter {
            handle: self.clone(),
        }
    }
}

/// In-memory async writer for asserting on output
pub struct CaptureWriter {
    handle: CaptureHandle,
}

impl CaptureWriter {
    pub fn new() -> (Self, CaptureHandle) {
        let handle = CaptureHandle::default();
        (handle.writer(), handle)
    }
}

impl AsyncWrite for CaptureWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.handle.buf.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.handle.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Configurable mock container engine for testing
pub struct MockEngine {
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    /// Returned by info calls
    pub info: Arc<Mutex<EngineInfo>>,
    /// When set, create fails with this engine message
    pub create_error: Arc<Mutex<Option<String>>>,
    /// Chunks served by attach and logs
    pub output: Arc<Mutex<Vec<LogChunk>>>,
    /// Returned by wait calls
    pub exit: Arc<Mutex<ExitResult>>,
    /// Number of exec inspections that report the exec as still running
    pub exec_polls: Arc<Mutex<usize>>,
    pub exec_exit_code: Arc<Mutex<i64>>,
    pub exec_output: Arc<Mutex<Vec<LogChunk>>>,
    /// Image references present locally
    pub images: Arc<Mutex<Vec<String>>>,
    pub pull_events: Arc<Mutex<Vec<PullEvent>>>,
    /// Raw build output lines
    pub build_lines: Arc<Mutex<Vec<String>>>,
    /// Tar archive served by download
    pub archive: Arc<Mutex<Vec<u8>>>,
    pub stop_delay: Arc<Mutex<Duration>>,
    /// When set, stop fails with this engine message
    pub stop_error: Arc<Mutex<Option<String>>>,
    /// When set, start fails with this engine message
    pub start_error: Arc<Mutex<Option<String>>>,
    pub attach_error: Arc<Mutex<Option<String>>>,
    pub logs_error: Arc<Mutex<Option<String>>>,
    pub created: Arc<Mutex<Vec<ContainerSpec>>>,
    pub exec_configs: Arc<Mutex<Vec<ExecConfig>>>,
    /// Everything written to attached stdin
    pub stdin: CaptureHandle,
    /// Block wait until a stop arrives
    wait_until_stopped: AtomicBool,
    stopped: watch::Sender<bool>,
    next_id: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Create a new mock engine with default success results
    pub fn new() -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            info: Arc::new(Mutex::new(EngineInfo {
                server_version: "24.0.0".into(),
                os_type: "linux".into(),
                labels: Vec::new(),
            })),
            create_error: Arc::new(Mutex::new(None)),
            output: Arc::new(Mutex::new(Vec::new())),
            exit: Arc::new(Mutex::new(ExitResult {
                status_code: 0,
                error: None,
            })),
            exec_polls: Arc::new(Mutex::new(0)),
            exec_exit_code: Arc::new(Mutex::new(0)),
            exec_output: Arc::new(Mutex::new(Vec::new())),
            images: Arc::new(Mutex::new(Vec::new())),
            pull_events: Arc::new(Mutex::new(Vec::new())),
            build_lines: Arc::new(Mutex::new(Vec::new())),
            archive: Arc::new(Mutex::new(Vec::new())),
            stop_delay: Arc::new(Mutex::new(Duration::ZERO)),
            stop_error: Arc::new(Mutex::new(None)),
            start_error: Arc::new(Mutex::new(None)),
            attach_error: Arc::new(Mutex::new(None)),
            logs_error: Arc::new(Mutex::new(None)),
            created: Arc::new(Mutex::new(Vec::new())),
            exec_configs: Arc::new(Mutex::new(Vec::new())),
            stdin: CaptureHandle::default(),
            wait_until_stopped: AtomicBool::new(false),
            stopped,
            next_id: AtomicUsize::new(0),
        }
    }

    /// Record a call
    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Get all recorded calls
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Check if a specific call was made
    pub fn was_called(&self, call: &MockCall) -> bool {
        self.calls.lock().unwrap().contains(call)
    }

    pub fn count_calls(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn set_output(&self, chunks: Vec<LogChunk>) {
        *self.output.lock().unwrap() = chunks;
    }

    pub fn set_exit(&self, exit: ExitResult) {
        *self.exit.lock().unwrap() = exit;
    }

    pub fn set_info(&self, info: EngineInfo) {
        *self.info.lock().unwrap() = info;
    }

    pub fn set_exec_output(&self, chunks: Vec<LogChunk>) {
        *self.exec_output.lock().unwrap() = chunks;
    }

    pub fn set_build_lines(&self, lines: &[&str]) {
        *self.build_lines.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn add_image(&self, reference: &str) {
        self.images.lock().unwrap().push(reference.to_string());
    }

    pub fn set_pull_events(&self, events: Vec<PullEvent>) {
        *self.pull_events.lock().unwrap() = events;
    }

    pub fn set_archive(&self, archive: Vec<u8>) {
        *self.archive.lock().unwrap() = archive;
    }

    /// Make wait block until the container is stopped
    pub fn set_wait_until_stopped(&self, enabled: bool) {
        self.wait_until_stopped.store(enabled, Ordering::SeqCst);
    }

    /// Specs passed to create, in order
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn last_exec_config(&self) -> Option<ExecConfig> {
        self.exec_configs.lock().unwrap().last().cloned()
    }

    fn output_stream(chunks: Vec<LogChunk>) -> OutputStream {
        Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> Result<()> {
        self.record(MockCall::Ping);
        Ok(())
    }

    async fn info(&self) -> Result<EngineInfo> {
        self.record(MockCall::Info);
        Ok(self.info.lock().unwrap().clone())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        self.record(MockCall::Create {
            image: spec.image.clone(),
            name: spec.name.clone(),
        });
        if let Some(message) = self.create_error.lock().unwrap().clone() {
            return Err(ProviderError::Api(message));
        }
        self.created.lock().unwrap().push(spec.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(ContainerId::new(format!("mock_container_{}", n)))
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.record(MockCall::Start { id: id.0.clone() });
        match self.start_error.lock().unwrap().clone() {
            Some(message) => Err(ProviderError::Api(message)),
            None => Ok(()),
        }
    }

    async fn stop(&self, id: &ContainerId) -> Result<()> {
        self.record(MockCall::Stop { id: id.0.clone() });
        let delay = *self.stop_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.stopped.send_replace(true);
        match self.stop_error.lock().unwrap().clone() {
            Some(message) => Err(ProviderError::Api(message)),
            None => Ok(()),
        }
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<()> {
        self.record(MockCall::Remove {
            id: id.0.clone(),
            force,
        });
        Ok(())
    }

    async fn attach(&self, id: &ContainerId, _config: &AttachConfig) -> Result<AttachStream> {
        self.record(MockCall::Attach { id: id.0.clone() });
        if let Some(message) = self.attach_error.lock().unwrap().clone() {
            return Err(ProviderError::Api(message));
        }
        let chunks = self.output.lock().unwrap().clone();
        Ok(AttachStream {
            output: Self::output_stream(chunks),
            input: Box::pin(self.stdin.writer()),
        })
    }

    async fn logs(&self, id: &ContainerId, follow: bool) -> Result<OutputStream> {
        self.record(MockCall::Logs {
            id: id.0.clone(),
            follow,
        });
        if let Some(message) = self.logs_error.lock().unwrap().clone() {
            return Err(ProviderError::Api(message));
        }
        let chunks = self.output.lock().unwrap().clone();
        Ok(Self::output_stream(chunks))
    }

    async fn wait(&self, id: &ContainerId) -> Result<ExitResult> {
        self.record(MockCall::Wait { id: id.0.clone() });
        if self.wait_until_stopped.load(Ordering::SeqCst) {
            let mut rx = self.stopped.subscribe();
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
        Ok(self.exit.lock().unwrap().clone())
    }

    async fn resize(&self, id: &ContainerId, rows: u16, cols: u16) -> Result<()> {
        self.record(MockCall::Resize {
            id: id.0.clone(),
            rows,
            cols,
        });
        Ok(())
    }

    async fn exec_create(&self, id: &ContainerId, config: &ExecConfig) -> Result<String> {
        self.record(MockCall::ExecCreate {
            id: id.0.clone(),
            cmd: config.cmd.clone(),
        });
        self.exec_configs.lock().unwrap().push(config.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mock_exec_{}", n))
    }

    async fn exec_start(&self, exec_id: &str) -> Result<OutputStream> {
        self.record(MockCall::ExecStart {
            exec_id: exec_id.to_string(),
        });
        let chunks = self.exec_output.lock().unwrap().clone();
        Ok(Self::output_stream(chunks))
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInspect> {
        self.record(MockCall::ExecInspect {
            exec_id: exec_id.to_string(),
        });
        let mut polls = self.exec_polls.lock().unwrap();
        if *polls > 0 {
            *polls -= 1;
            return Ok(ExecInspect {
                running: true,
                exit_code: None,
                entrypoint: None,
            });
        }
        Ok(ExecInspect {
            running: false,
            exit_code: Some(*self.exec_exit_code.lock().unwrap()),
            entrypoint: None,
        })
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        self.record(MockCall::ImageExists {
            reference: reference.to_string(),
        });
        Ok(self.images.lock().unwrap().iter().any(|i| i == reference))
    }

    async fn pull(&self, reference: &str) -> Result<PullStream> {
        self.record(MockCall::Pull {
            reference: reference.to_string(),
        });
        let events = self.pull_events.lock().unwrap().clone();
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }

    async fn build(&self, config: &BuildConfig) -> Result<BuildStream> {
        self.record(MockCall::Build {
            tag: config.tag.clone(),
            dockerfile: config.dockerfile.clone(),
        });
        let lines = self.build_lines.lock().unwrap().clone();
        Ok(Box::pin(futures::stream::iter(
            lines.into_iter().map(|l| Ok(BuildEvent::parse_line(&l))),
        )))
    }

    async fn download(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>> {
        self.record(MockCall::Download {
            id: id.0.clone(),
            path: path.to_string(),
        });
        Ok(self.archive.lock().unwrap().clone())
    }
}

/// Probe with a fixed answer
pub struct FixedProbe(pub bool);

#[async_trait]
impl ReachabilityProbe for FixedProbe {
    async fn reachable(&self) -> bool {
        self.0
    }
}

/// Resolver on the default registry that never touches the network
pub fn resolver_for_tests() -> ImageResolver {
    let config = RegistryConfig {
        mode: RegistryMode::Default,
        ..Default::default()
    };
    ImageResolver::new(config, Arc::new(RegistryProbe::new(FixedProbe(true))))
}
