//! Image pull, build and copy operations for ContainerManager

use super::ContainerManager;
use crate::stream::Sink;
use crate::{CoreError, Result};
use fclocal_provider::{unpack_archive, BuildConfig, BuildEvent, ContainerSpec, ProviderError, PullEvent};
use futures::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

// Send a progress message to the channel, or log via tracing if no channel.
fn emit(progress: &Option<mpsc::UnboundedSender<String>>, msg: String) {
    if let Some(tx) = progress {
        let _ = tx.send(msg);
    } else {
        tracing::debug!("{}", msg);
    }
}

/// Per-layer pull status, rendered as one line per layer
#[derive(Debug, Default, Clone)]
pub struct PullProgress {
    layers: Vec<(String, String)>,
}

impl PullProgress {
    /// Fold an event in and render the full display
    ///
    /// Events without a layer id are appended below the layer lines.
    pub fn apply(&mut self, event: &PullEvent) -> String {
        let status = event.status.clone().unwrap_or_default();
        let status = match &event.progress {
            Some(progress) => format!("{} {}", status, progress),
            None => status,
        };

        if let Some(id) = &event.id {
            match self.layers.iter_mut().find(|(layer, _)| layer == id) {
                Some(entry) => entry.1 = status.clone(),
                None => self.layers.push((id.clone(), status.clone())),
            }
        }

        let mut rendered = String::new();
        for (layer, layer_status) in &self.layers {
            rendered.push_str(layer);
            rendered.push_str(": ");
            rendered.push_str(layer_status);
            rendered.push('\n');
        }
        if event.id.is_none() {
            rendered.push_str(event.status.as_deref().unwrap_or_default());
            rendered.push('\n');
        }
        rendered
    }
}

/// Text for one build record; an error record aborts the build
pub fn build_chunk(event: BuildEvent) -> Result<String> {
    match event {
        BuildEvent::Stream(text) => Ok(text),
        BuildEvent::ImageId(id) => Ok(format!("{}\n", id)),
        BuildEvent::Line(line) => Ok(line),
        BuildEvent::Error(message) => Err(CoreError::StreamBuild(message)),
    }
}

impl ContainerManager {
    pub async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self.engine.image_exists(reference).await?)
    }

    /// Pull an image, sending the rendered progress display to `progress`
    pub async fn pull_image(
        &self,
        reference: &str,
        progress: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<String> {
        tracing::info!(
            "Begin pulling image {}, you can also use 'docker pull {}' to pull image by yourself.",
            reference,
            reference
        );

        let key = format!("pull:{}", reference);
        let cancel = self.shutdown.register_stream(&key);
        let result: Result<()> = async {
            let mut stream = self.engine.pull(reference).await?;
            let mut display = PullProgress::default();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CoreError::Interrupted),
                    next = stream.next() => match next {
                        Some(event) => {
                            let event = event?;
                            if let Some(error) = &event.error {
                                return Err(ProviderError::PullError(error.clone()).into());
                            }
                            emit(&progress, display.apply(&event));
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
        .await;
        self.shutdown.deregister_stream(&key);
        result?;

        tracing::debug!("Pulled image {}", reference);
        Ok(reference.to_string())
    }

    /// Pull only when the image is absent locally or force pull is set
    pub async fn pull_image_if_needed(
        &self,
        reference: &str,
        progress: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<String> {
        if self.force_pull || !self.image_exists(reference).await? {
            self.pull_image(reference, progress).await
        } else {
            tracing::debug!("Skip pulling image {}...", reference);
            Ok(reference.to_string())
        }
    }

    /// Build `tag` from a context directory, writing the build log to `out`
    ///
    /// `dockerfile` must live inside `context`.
    pub async fn build_image(
        &self,
        context: &Path,
        dockerfile: &Path,
        tag: &str,
        mut out: Sink,
    ) -> Result<String> {
        let relative = dockerfile.strip_prefix(context).map_err(|_| {
            CoreError::InvalidCommand(format!(
                "dockerfile {} is outside the build context {}",
                dockerfile.display(),
                context.display()
            ))
        })?;
        let dockerfile = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let config = BuildConfig {
            context: context.to_path_buf(),
            dockerfile,
            tag: tag.to_string(),
        };
        tracing::debug!("Building image: {:?}", config);

        let key = format!("build:{}", tag);
        let cancel = self.shutdown.register_stream(&key);
        let result: Result<()> = async {
            let mut stream = self.engine.build(&config).await?;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CoreError::Interrupted),
                    next = stream.next() => match next {
                        Some(event) => {
                            let text = build_chunk(event?)?;
                            out.write_all(text.as_bytes()).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
        .await;
        self.shutdown.deregister_stream(&key);
        out.flush().await?;
        result?;

        tracing::info!("Built image {}", tag);
        Ok(tag.to_string())
    }

    /// Copy `from` out of an image into the host directory `to`
    pub async fn copy_from_image(&self, image: &str, from: &str, to: &Path) -> Result<()> {
        let spec = ContainerSpec {
            image: image.to_string(),
            ..Default::default()
        };
        let id = self.engine.create(&spec).await?;

        let copied = async {
            let archive = self.engine.download(&id, from).await?;
            unpack_archive(&archive, to)?;
            Ok::<_, CoreError>(())
        }
        .await;

        if let Err(e) = self.engine.remove(&id, true).await {
            tracing::warn!("Failed to remove container {}: {}", id.short(), e);
        }
        copied?;

        tracing::debug!("Copied {}:{} to {}", image, from, to.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{resolver_for_tests, CaptureWriter, MockCall, MockEngine};
    use crate::{HostOs, ShutdownCoordinator};
    use fclocal_provider::ContainerEngine;
    use std::sync::Arc;

    fn manager(engine: &Arc<MockEngine>) -> ContainerManager {
        let dyn_engine: Arc<dyn ContainerEngine> = engine.clone();
        let shutdown = ShutdownCoordinator::new(dyn_engine.clone());
        ContainerManager::new_for_testing(dyn_engine, shutdown, resolver_for_tests(), HostOs::Linux)
    }

    fn event(id: Option<&str>, status: &str, progress: Option<&str>) -> PullEvent {
        PullEvent {
            id: id.map(str::to_string),
            status: Some(status.to_string()),
            progress: progress.map(str::to_string),
            error: None,
        }
    }

    #[test]
    fn test_build_chunks() {
        assert_eq!(
            build_chunk(BuildEvent::parse_line(r#"{"stream":"step 1\n"}"#)).unwrap(),
            "step 1\n"
        );
        assert_eq!(
            build_chunk(BuildEvent::parse_line(r#"{"aux":{"ID":"sha256:abc"}}"#)).unwrap(),
            "sha256:abc\n"
        );
        let err = build_chunk(BuildEvent::parse_line(r#"{"error":"boom"}"#)).unwrap_err();
        assert!(matches!(err, CoreError::StreamBuild(ref m) if m == "boom"));
        assert_eq!(
            build_chunk(BuildEvent::parse_line("plain text")).unwrap(),
            "plain text"
        );
    }

    #[test]
    fn test_pull_progress_render() {
        let mut p = PullProgress::default();
        assert_eq!(
            p.apply(&event(None, "Pulling from aliyunfc/runtime-nodejs8", None)),
            "Pulling from aliyunfc/runtime-nodejs8\n"
        );
        assert_eq!(
            p.apply(&event(Some("a1"), "Downloading", Some("[=>   ] 1MB/10MB"))),
            "a1: Downloading [=>   ] 1MB/10MB\n"
        );
        p.apply(&event(Some("b2"), "Waiting", None));
        assert_eq!(
            p.apply(&event(Some("a1"), "Pull complete", None)),
            "a1: Pull complete\nb2: Waiting\n"
        );
        assert_eq!(
            p.apply(&event(None, "Digest: sha256:1", None)),
            "a1: Pull complete\nb2: Waiting\nDigest: sha256:1\n"
        );
    }

    #[tokio::test]
    async fn test_build_image_streams_log() {
        let engine = Arc::new(MockEngine::new());
        engine.set_build_lines(&[
            r#"{"stream":"step 1\n"}"#,
            r#"{"aux":{"ID":"sha256:abc"}}"#,
        ]);
        let mgr = manager(&engine);
        let ctx = tempfile::tempdir().unwrap();
        let dockerfile = ctx.path().join("build").join("Dockerfile");

        let (out, buf) = CaptureWriter::new();
        let tag = mgr
            .build_image(ctx.path(), &dockerfile, "fun-cache-demo", Box::pin(out))
            .await
            .unwrap();
        assert_eq!(tag, "fun-cache-demo");
        assert_eq!(buf.contents(), b"step 1\nsha256:abc\n");
        assert!(engine.was_called(&MockCall::Build {
            tag: "fun-cache-demo".into(),
            dockerfile: "build/Dockerfile".into()
        }));
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[tokio::test]
    async fn test_build_image_error_record_aborts() {
        let engine = Arc::new(MockEngine::new());
        engine.set_build_lines(&[
            r#"{"stream":"step 1\n"}"#,
            r#"{"error":"boom"}"#,
            r#"{"stream":"never\n"}"#,
        ]);
        let mgr = manager(&engine);
        let ctx = tempfile::tempdir().unwrap();

        let (out, buf) = CaptureWriter::new();
        let err = mgr
            .build_image(ctx.path(), &ctx.path().join("Dockerfile"), "t", Box::pin(out))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(buf.contents(), b"step 1\n");
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[tokio::test]
    async fn test_build_rejects_dockerfile_outside_context() {
        let engine = Arc::new(MockEngine::new());
        let mgr = manager(&engine);
        let ctx = tempfile::tempdir().unwrap();
        let err = mgr
            .build_image(ctx.path(), Path::new("/elsewhere/Dockerfile"), "t", crate::stream::null_sink())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_pull_if_needed_skips_present_image() {
        let engine = Arc::new(MockEngine::new());
        engine.add_image("aliyunfc/runtime-nodejs8:1.6.0");
        let mgr = manager(&engine);
        mgr.pull_image_if_needed("aliyunfc/runtime-nodejs8:1.6.0", None)
            .await
            .unwrap();
        assert!(!engine.get_calls().iter().any(|c| matches!(c, MockCall::Pull { .. })));

        let mgr = manager(&engine).with_force_pull(true);
        mgr.pull_image_if_needed("aliyunfc/runtime-nodejs8:1.6.0", None)
            .await
            .unwrap();
        assert!(engine.was_called(&MockCall::Pull {
            reference: "aliyunfc/runtime-nodejs8:1.6.0".into()
        }));
    }

    #[tokio::test]
    async fn test_pull_sends_progress() {
        let engine = Arc::new(MockEngine::new());
        engine.set_pull_events(vec![
            event(Some("l1"), "Downloading", Some("[==>]")),
            event(Some("l1"), "Pull complete", None),
        ]);
        let mgr = manager(&engine);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let image = mgr.pull_image_if_needed("img:1", Some(tx)).await.unwrap();
        assert_eq!(image, "img:1");
        assert_eq!(rx.recv().await.unwrap(), "l1: Downloading [==>]\n");
        assert_eq!(rx.recv().await.unwrap(), "l1: Pull complete\n");
    }

    #[tokio::test]
    async fn test_pull_error_event() {
        let engine = Arc::new(MockEngine::new());
        engine.set_pull_events(vec![PullEvent {
            error: Some("manifest unknown".into()),
            ..Default::default()
        }]);
        let mgr = manager(&engine);
        let err = mgr.pull_image("img:missing", None).await.unwrap_err();
        assert!(err.to_string().contains("manifest unknown"));
        assert_eq!(mgr.shutdown().active_count(), 0);
    }

    #[tokio::test]
    async fn test_copy_from_image_extracts_and_removes() {
        let engine = Arc::new(MockEngine::new());
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("lib.so"), b"elf").unwrap();
        engine.set_archive(fclocal_provider::pack_context(src.path()).unwrap());
        let mgr = manager(&engine);

        let dest = tempfile::tempdir().unwrap();
        let to = dest.path().join("out");
        mgr.copy_from_image("img:1", "/usr/lib", &to).await.unwrap();

        assert_eq!(std::fs::read(to.join("lib.so")).unwrap(), b"elf");
        assert!(engine
            .get_calls()
            .iter()
            .any(|c| matches!(c, MockCall::Remove { force: true, .. })));
        assert_eq!(mgr.shutdown().active_count(), 0);
    }
}
