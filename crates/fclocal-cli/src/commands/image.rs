//! Image commands: build, pull, copy

use anyhow::Result;
use crossterm::{cursor, queue, terminal};
use fclocal_core::stream::stdout_sink;
use fclocal_core::ContainerManager;
use std::io::{IsTerminal, Write};
use std::path::Path;
use tokio::sync::mpsc;

pub async fn build(manager: &ContainerManager, context: &Path, dockerfile: &Path, tag: &str) -> Result<i32> {
    let tag = manager
        .build_image(context, dockerfile, tag, stdout_sink())
        .await?;
    println!("Successfully built {}", tag);
    Ok(0)
}

pub async fn pull(
    manager: &ContainerManager,
    image: Option<String>,
    runtime: Option<String>,
    build: bool,
) -> Result<i32> {
    let reference = match (image, runtime) {
        (Some(image), _) => image,
        (None, Some(runtime)) => manager.resolver().resolve(&runtime, build).await?,
        (None, None) => anyhow::bail!("Either an image or --runtime is required"),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let renderer = tokio::spawn(async move {
        let stderr = std::io::stderr();
        let enabled = stderr.is_terminal();
        let mut display = ProgressDisplay::new(stderr, enabled);
        while let Some(text) = rx.recv().await {
            if let Err(e) = display.render(&text) {
                tracing::debug!("Progress redraw failed: {}", e);
            }
        }
    });

    let result = manager.pull_image(&reference, Some(tx)).await;
    let _ = renderer.await;
    result?;

    println!("Pulled {}", reference);
    Ok(0)
}

pub async fn copy(manager: &ContainerManager, image: &str, from: &str, to: &Path) -> Result<i32> {
    manager.copy_from_image(image, from, to).await?;
    println!("Copied {}:{} to {}", image, from, to.display());
    Ok(0)
}

/// Redraws a multi-line progress block in place
pub struct ProgressDisplay<W: Write> {
    out: W,
    /// Redraw in place; otherwise only the last line of each update is printed
    in_place: bool,
    lines: u16,
}

impl<W: Write> ProgressDisplay<W> {
    pub fn new(out: W, in_place: bool) -> Self {
        Self {
            out,
            in_place,
            lines: 0,
        }
    }

    pub fn render(&mut self, text: &str) -> std::io::Result<()> {
        if !self.in_place {
            if let Some(last) = text.lines().last() {
                writeln!(self.out, "{}", last)?;
            }
            return self.out.flush();
        }

        if self.lines > 0 {
            queue!(
                self.out,
                cursor::MoveUp(self.lines),
                cursor::MoveToColumn(0),
                terminal::Clear(terminal::ClearType::FromCursorDown)
            )?;
        }
        self.out.write_all(text.as_bytes())?;
        self.lines = u16::try_from(text.lines().count()).unwrap_or(u16::MAX);
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fclocal_core::test_support::{resolver_for_tests, MockCall, MockEngine};
    use fclocal_core::{HostOs, ShutdownCoordinator};
    use fclocal_provider::ContainerEngine;
    use std::sync::Arc;

    #[test]
    fn test_plain_display_prints_last_line() {
        let mut buf = Vec::new();
        {
            let mut display = ProgressDisplay::new(&mut buf, false);
            display.render("a1: Downloading\n").unwrap();
            display.render("a1: Pull complete\nDigest: sha256:1\n").unwrap();
        }
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "a1: Downloading\nDigest: sha256:1\n"
        );
    }

    #[test]
    fn test_in_place_display_moves_up() {
        let mut buf = Vec::new();
        {
            let mut display = ProgressDisplay::new(&mut buf, true);
            display.render("a1: Waiting\nb2: Waiting\n").unwrap();
            display.render("a1: Done\nb2: Waiting\n").unwrap();
        }
        let out = String::from_utf8(buf).unwrap();
        assert!(out.starts_with("a1: Waiting\nb2: Waiting\n"));
        // CSI 2 A moves the cursor up over the previous block
        assert!(out.contains("\u{1b}[2A"));
        assert!(out.ends_with("a1: Done\nb2: Waiting\n"));
    }

    #[tokio::test]
    async fn test_pull_by_runtime_resolves_build_image() {
        let engine = Arc::new(MockEngine::new());
        let dyn_engine: Arc<dyn ContainerEngine> = engine.clone();
        let shutdown = ShutdownCoordinator::new(dyn_engine.clone());
        let manager =
            ContainerManager::new_for_testing(dyn_engine, shutdown, resolver_for_tests(), HostOs::Linux);

        let code = pull(&manager, None, Some("nodejs10".into()), true).await.unwrap();
        assert_eq!(code, 0);
        assert!(engine.was_called(&MockCall::Pull {
            reference: "aliyunfc/runtime-nodejs10:build-1.6.0".into()
        }));
    }
}
