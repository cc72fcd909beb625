//! Stream and terminal bridging
//!
//! Demultiplexes engine output into stdout/stderr sinks and provides the
//! pieces of an interactive session: a stdin pump with detach detection,
//! raw-mode handling and terminal resize forwarding.

use crate::{CoreError, Result};
use fclocal_provider::{ContainerEngine, ContainerId, LogChunk, OutputStream};
use futures::StreamExt;
use std::io::Read;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Destination of demultiplexed output
pub type Sink = Pin<Box<dyn AsyncWrite + Send>>;

pub fn null_sink() -> Sink {
    Box::pin(tokio::io::sink())
}

pub fn stdout_sink() -> Sink {
    Box::pin(tokio::io::stdout())
}

pub fn stderr_sink() -> Sink {
    Box::pin(tokio::io::stderr())
}

/// Ctrl-P
pub const DETACH_PREFIX: u8 = 0x10;
/// Ctrl-Q
pub const DETACH_KEY: u8 = 0x11;

/// Copy engine output into the sinks until the stream ends
///
/// Raw TTY output goes to `out`. Each write is awaited, so a slow sink
/// slows the reader down.
pub async fn demux(mut output: OutputStream, mut out: Sink, mut err: Sink) -> Result<()> {
    while let Some(chunk) = output.next().await {
        match chunk? {
            LogChunk::StdOut(bytes) | LogChunk::Console(bytes) => {
                out.write_all(&bytes).await?;
                out.flush().await?;
            }
            LogChunk::StdErr(bytes) => {
                err.write_all(&bytes).await?;
                err.flush().await?;
            }
        }
    }
    out.flush().await?;
    err.flush().await?;
    Ok(())
}

pub fn spawn_demux(output: OutputStream, out: Sink, err: Sink) -> JoinHandle<Result<()>> {
    tokio::spawn(demux(output, out, err))
}

/// Wait for a demux task, giving up after `grace`
pub async fn finish_demux(task: JoinHandle<Result<()>>, grace: std::time::Duration) {
    let abort = task.abort_handle();
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::debug!("Output stream ended with error: {}", e),
        Ok(Err(e)) => tracing::debug!("Output task failed: {}", e),
        Err(_) => {
            tracing::debug!("Output stream still open after {:?}, dropping it", grace);
            abort.abort();
        }
    }
}

/// Detects Ctrl-P followed by Ctrl-Q in a byte stream
///
/// State carries across chunks and is never reset.
#[derive(Debug, Default, Clone)]
pub struct DetachDetector {
    previous: Option<u8>,
}

impl DetachDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed input bytes; true once the sequence completes
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        let mut detached = false;
        for &b in bytes {
            if self.previous == Some(DETACH_PREFIX) && b == DETACH_KEY {
                detached = true;
            }
            self.previous = Some(b);
        }
        detached
    }
}

/// Why an input pump returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Host input reached end of file
    InputClosed,
    Detached,
    Cancelled,
}

/// Forward host input chunks into the container until EOF, detach or cancel
pub async fn pump_input(
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    mut input: Sink,
    cancel: CancellationToken,
) -> Result<PumpOutcome> {
    let mut detector = DetachDetector::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(PumpOutcome::Cancelled),
            chunk = input_rx.recv() => match chunk {
                Some(bytes) => {
                    input.write_all(&bytes).await?;
                    input.flush().await?;
                    if detector.feed(&bytes) {
                        return Ok(PumpOutcome::Detached);
                    }
                }
                None => {
                    input.shutdown().await?;
                    return Ok(PumpOutcome::InputClosed);
                }
            }
        }
    }
}

/// Read host stdin on a dedicated thread
///
/// The thread blocks in `read` and lives until stdin closes or the process
/// exits; the channel closes on EOF.
pub fn stdin_channel() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(32);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Holds the host terminal in raw mode, restoring it on drop
pub struct RawModeGuard {
    restore: bool,
}

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        let already = crossterm::terminal::is_raw_mode_enabled().unwrap_or(false);
        if !already {
            crossterm::terminal::enable_raw_mode()
                .map_err(|e| CoreError::InvalidState(format!("cannot enter raw mode: {}", e)))?;
        }
        Ok(Self { restore: !already })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.restore {
            if let Err(e) = crossterm::terminal::disable_raw_mode() {
                tracing::warn!("Failed to restore terminal mode: {}", e);
            }
        }
    }
}

/// Host terminal size as `(rows, cols)`, `None` when unknown or zero
pub fn terminal_size() -> Option<(u16, u16)> {
    match crossterm::terminal::size() {
        Ok((cols, rows)) if rows > 0 && cols > 0 => Some((rows, cols)),
        _ => None,
    }
}

/// Propagate the host terminal size to a container TTY
pub async fn forward_resize(engine: &dyn ContainerEngine, id: &ContainerId) {
    if let Some((rows, cols)) = terminal_size() {
        if let Err(e) = engine.resize(id, rows, cols).await {
            tracing::debug!("Resize of {} failed: {}", id.short(), e);
        }
    }
}

/// Resize once, then again on every window change until cancelled
pub fn spawn_resize_forwarder(
    engine: Arc<dyn ContainerEngine>,
    id: ContainerId,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        forward_resize(engine.as_ref(), &id).await;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut winch = match signal(SignalKind::window_change()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!("Cannot watch window size: {}", e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = winch.recv() => {
                        if received.is_none() {
                            break;
                        }
                        forward_resize(engine.as_ref(), &id).await;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        cancel.cancelled().await;
    })
}
