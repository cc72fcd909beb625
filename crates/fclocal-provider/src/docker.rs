//! Docker engine implementation using bollard

use crate::types::env_strings;
use crate::{
    pack_context, AttachConfig, AttachStream, BuildConfig, BuildEvent,
    BuildStream, ContainerEngine, ContainerId, ContainerSpec, EngineInfo, ExecConfig,
    ExecInspect, ExitResult, LogChunk, OutputStream, ProviderError, PullEvent, PullStream, Result,
};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    DownloadFromContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    ResizeContainerTtyOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, ListImagesOptions};
use bollard::models::BuildInfo;
use bollard::service::{HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::Docker;
use futures::{Stream, StreamExt};
use std::collections::HashMap;

/// Docker engine using bollard crate
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to a Docker socket, named pipe or http endpoint
    pub async fn new(socket_path: &str, timeout_secs: u64) -> Result<Self> {
        let client = if socket_path.starts_with("http://") || socket_path.starts_with("https://") {
            Docker::connect_with_http(socket_path, timeout_secs, bollard::API_DEFAULT_VERSION)
        } else {
            connect_local(socket_path, timeout_secs)
        }
        .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        client
            .ping()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self { client })
    }
}

#[cfg(windows)]
fn connect_local(path: &str, timeout_secs: u64) -> std::result::Result<Docker, bollard::errors::Error> {
    Docker::connect_with_named_pipe(path, timeout_secs, bollard::API_DEFAULT_VERSION)
}

#[cfg(not(windows))]
fn connect_local(path: &str, timeout_secs: u64) -> std::result::Result<Docker, bollard::errors::Error> {
    let path = path.trim_start_matches("unix://");
    Docker::connect_with_socket(path, timeout_secs, bollard::API_DEFAULT_VERSION)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    async fn info(&self) -> Result<EngineInfo> {
        let info = self.client.info().await?;
        Ok(EngineInfo {
            server_version: info.server_version.unwrap_or_default(),
            os_type: info.os_type.unwrap_or_default(),
            labels: info.labels.unwrap_or_default(),
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        });

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();

        for port in &spec.ports {
            let container_port = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(container_port.clone(), HashMap::new());
            port_bindings.insert(
                container_port,
                Some(vec![PortBinding {
                    host_ip: Some(String::new()),
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            auto_remove: Some(spec.auto_remove),
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };

        let env = spec.env_strings();

        let container_config = Config {
            image: Some(spec.image.clone()),
            hostname: spec.hostname.clone(),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            entrypoint: spec.entrypoint.clone(),
            env: if env.is_empty() { None } else { Some(env) },
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            stdin_once: Some(spec.stdin_once),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(spec.attach_stdout),
            attach_stderr: Some(spec.attach_stderr),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        tracing::debug!("docker create: {:?}", container_config);

        let response = self
            .client
            .create_container(options, container_config)
            .await?;

        for warning in &response.warnings {
            tracing::warn!("{}", warning);
        }

        Ok(ContainerId::new(response.id))
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.client
            .start_container(&id.0, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &ContainerId) -> Result<()> {
        self.client
            .stop_container(&id.0, None::<StopContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client.remove_container(&id.0, Some(options)).await?;
        Ok(())
    }

    async fn attach(&self, id: &ContainerId, config: &AttachConfig) -> Result<AttachStream> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(config.stdin),
            stdout: Some(config.stdout),
            stderr: Some(config.stderr),
            stream: Some(true),
            logs: Some(config.logs),
            detach_keys: None,
        };

        let AttachContainerResults { output, input } =
            self.client.attach_container(&id.0, Some(options)).await?;

        Ok(AttachStream {
            output: map_log_output(output),
            input,
        })
    }

    async fn logs(&self, id: &ContainerId, follow: bool) -> Result<OutputStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        Ok(map_log_output(self.client.logs(&id.0, Some(options))))
    }

    async fn wait(&self, id: &ContainerId) -> Result<ExitResult> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.client.wait_container(&id.0, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(ExitResult {
                status_code: response.status_code,
                error: response.error.and_then(|e| e.message),
            }),
            // bollard reports non-zero exits as an error
            Some(Err(bollard::errors::Error::DockerContainerWaitError { error, code })) => {
                Ok(ExitResult {
                    status_code: code,
                    error: if error.is_empty() { None } else { Some(error) },
                })
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(ProviderError::Api(format!(
                "wait on container {} ended without a result",
                id.short()
            ))),
        }
    }

    async fn resize(&self, id: &ContainerId, rows: u16, cols: u16) -> Result<()> {
        let options = ResizeContainerTtyOptions {
            height: rows,
            width: cols,
        };
        self.client.resize_container_tty(&id.0, options).await?;
        Ok(())
    }

    async fn exec_create(&self, id: &ContainerId, config: &ExecConfig) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(config.cmd.clone()),
            env: Some(env_strings(&config.env)),
            working_dir: config.working_dir.clone(),
            tty: Some(config.tty),
            attach_stdin: Some(config.attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        tracing::debug!("docker exec opts: {:?}", options);

        let exec = self.client.create_exec(&id.0, options).await?;
        Ok(exec.id)
    }

    async fn exec_start(&self, exec_id: &str) -> Result<OutputStream> {
        let start_options = StartExecOptions {
            detach: false,
            tty: false,
            ..Default::default()
        };

        match self.client.start_exec(exec_id, Some(start_options)).await? {
            StartExecResults::Attached { output, .. } => Ok(map_log_output(output)),
            StartExecResults::Detached => Err(ProviderError::ExecError(
                "Exec started in detached mode".to_string(),
            )),
        }
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInspect> {
        let inspect = self.client.inspect_exec(exec_id).await?;
        let entrypoint = inspect.process_config.map(|pc| {
            let mut parts: Vec<String> = pc.entrypoint.into_iter().collect();
            parts.extend(pc.arguments.unwrap_or_default());
            parts.join(" ")
        });

        Ok(ExecInspect {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
            entrypoint,
        })
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let options = ListImagesOptions::<String> {
            filters: HashMap::from([("reference".to_string(), vec![reference.to_string()])]),
            ..Default::default()
        };

        let images = self.client.list_images(Some(options)).await?;
        Ok(!images.is_empty())
    }

    async fn pull(&self, reference: &str) -> Result<PullStream> {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };

        let stream = self
            .client
            .create_image(Some(options), None, None)
            .map(|item| match item {
                Ok(info) => Ok(PullEvent {
                    id: info.id,
                    status: info.status,
                    progress: info.progress,
                    error: info.error,
                }),
                Err(e) => Err(ProviderError::PullError(e.to_string())),
            });

        Ok(Box::pin(stream))
    }

    async fn build(&self, config: &BuildConfig) -> Result<BuildStream> {
        let tar_data = pack_context(&config.context)?;

        let options = BuildImageOptions {
            dockerfile: config.dockerfile.clone(),
            t: config.tag.clone(),
            rm: true,
            ..Default::default()
        };

        // The bollard stream borrows the client, so drive it on a task that owns a clone
        let client = self.client.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = Box::pin(client.build_image(options, None, Some(tar_data.into())));
            while let Some(item) = stream.next().await {
                let event = item
                    .map(build_event)
                    .map_err(|e| ProviderError::BuildError(e.to_string()));
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn download(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions { path };
        let mut stream = self.client.download_from_container(&id.0, Some(options));

        let mut tar_data = Vec::new();
        while let Some(chunk) = stream.next().await {
            tar_data.extend_from_slice(&chunk?);
        }
        Ok(tar_data)
    }
}

fn build_event(info: BuildInfo) -> BuildEvent {
    let record = build_record(&info);
    BuildEvent::from_record(&record).unwrap_or_else(|| BuildEvent::Line(record.to_string()))
}

/// Rebuild the wire record from the decoded fields that were present
fn build_record(info: &BuildInfo) -> serde_json::Value {
    let mut record = serde_json::Map::new();
    let mut put = |key: &str, value: Option<serde_json::Value>| {
        if let Some(value) = value {
            record.insert(key.to_string(), value);
        }
    };
    put("id", info.id.clone().map(Into::into));
    put("stream", info.stream.clone().map(Into::into));
    put("error", info.error.clone().map(Into::into));
    put("status", info.status.clone().map(Into::into));
    put("progress", info.progress.clone().map(Into::into));
    put(
        "progressDetail",
        info.progress_detail
            .as_ref()
            .and_then(|detail| serde_json::to_value(detail).ok()),
    );
    put(
        "aux",
        info.aux.as_ref().and_then(|aux| serde_json::to_value(aux).ok()),
    );
    serde_json::Value::Object(record)
}

fn map_log_output<S>(stream: S) -> OutputStream
where
    S: Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send + 'static,
{
    Box::pin(stream.map(|item| {
        item.map(|output| match output {
            LogOutput::StdOut { message } => LogChunk::StdOut(message.to_vec()),
            LogOutput::StdErr { message } => LogChunk::StdErr(message.to_vec()),
            LogOutput::Console { message } => LogChunk::Console(message.to_vec()),
            LogOutput::StdIn { message } => LogChunk::Console(message.to_vec()),
        })
        .map_err(ProviderError::from)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ImageId, ProgressDetail};

    #[test]
    fn test_build_event_recognized_fields() {
        let log = BuildInfo {
            stream: Some("Step 1/2 : FROM scratch\n".into()),
            ..Default::default()
        };
        assert_eq!(
            build_event(log),
            BuildEvent::Stream("Step 1/2 : FROM scratch\n".into())
        );

        let failed = BuildInfo {
            error: Some("no such file".into()),
            stream: Some("ignored".into()),
            ..Default::default()
        };
        assert_eq!(build_event(failed), BuildEvent::Error("no such file".into()));

        let built = BuildInfo {
            aux: Some(ImageId {
                id: Some("sha256:abc".into()),
            }),
            ..Default::default()
        };
        assert_eq!(build_event(built), BuildEvent::ImageId("sha256:abc".into()));
    }

    #[test]
    fn test_build_event_passes_unknown_record_through() {
        let progress = BuildInfo {
            id: Some("abc".into()),
            progress_detail: Some(ProgressDetail {
                current: Some(1),
                total: None,
            }),
            ..Default::default()
        };
        let line = match build_event(progress) {
            BuildEvent::Line(line) => line,
            other => panic!("expected a raw line, got {:?}", other),
        };
        assert!(!line.is_empty());

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], "abc");
        assert_eq!(value["progressDetail"]["current"], 1);
        assert_eq!(BuildEvent::parse_line(&line), BuildEvent::Line(line.clone()));
    }

    #[test]
    fn test_build_event_status_only_record() {
        let status = BuildInfo {
            status: Some("Downloading".into()),
            ..Default::default()
        };
        assert_eq!(
            build_event(status),
            BuildEvent::Line(r#"{"status":"Downloading"}"#.into())
        );
    }
}
