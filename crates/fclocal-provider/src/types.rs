//! Common types for container engines

use crate::Result;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncWrite;

/// Container ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        if self.0.len() > 12 {
            &self.0[..12]
        } else {
            &self.0
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Container creation descriptor
///
/// Built fresh for every invocation and never mutated once handed to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Image reference
    pub image: String,
    /// Container name
    pub name: Option<String>,
    /// Hostname inside the container
    pub hostname: Option<String>,
    /// Command (arguments to the entrypoint)
    pub cmd: Vec<String>,
    /// Entrypoint override
    pub entrypoint: Option<Vec<String>>,
    /// Environment, in insertion order
    pub env: Vec<(String, String)>,
    /// `uid:gid`
    pub user: Option<String>,
    pub working_dir: Option<String>,
    /// Allocate a pseudo-TTY
    pub tty: bool,
    /// Keep stdin open
    pub open_stdin: bool,
    /// Close stdin after the first attached client detaches
    pub stdin_once: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    /// Remove the container once it exits
    pub auto_remove: bool,
    pub mounts: Vec<MountConfig>,
    /// Exposed ports, each bound to a host port
    pub ports: Vec<PortConfig>,
}

impl ContainerSpec {
    /// Environment in engine `KEY=value` form
    pub fn env_strings(&self) -> Vec<String> {
        env_strings(&self.env)
    }

    /// Value of an environment variable, if set
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) fn env_strings(env: &[(String, String)]) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

/// Bind mount configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    /// Absolute host path
    pub source: String,
    /// Absolute container path
    pub target: String,
    pub read_only: bool,
}

impl MountConfig {
    pub fn bind(source: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only,
        }
    }
}

/// Port exposure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub container_port: u16,
    pub host_port: u16,
    /// Protocol (tcp/udp)
    pub protocol: String,
}

/// One chunk of container output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    StdOut(Vec<u8>),
    StdErr(Vec<u8>),
    /// Raw TTY output, not multiplexed
    Console(Vec<u8>),
}

/// Stream of container output chunks
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<LogChunk>> + Send>>;

/// Which streams to attach
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachConfig {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    /// Replay output produced before the attach
    pub logs: bool,
}

/// Hijacked duplex connection to a container
pub struct AttachStream {
    pub output: OutputStream,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Result of waiting on a container, `{Error, StatusCode}` on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitResult {
    pub status_code: i64,
    pub error: Option<String>,
}

impl ExitResult {
    pub fn success(&self) -> bool {
        self.status_code == 0 && self.error.is_none()
    }
}

/// Exec configuration
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    pub tty: bool,
    pub attach_stdin: bool,
}

/// Exec state as reported by inspection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecInspect {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Command the exec was created with
    pub entrypoint: Option<String>,
}

/// Engine-wide information used for platform detection
#[derive(Debug, Clone, Default)]
pub struct EngineInfo {
    pub server_version: String,
    pub os_type: String,
    /// `key=value` daemon labels
    pub labels: Vec<String>,
}

impl EngineInfo {
    /// Value of a daemon label
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .filter_map(|l| l.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// Image build configuration
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    /// Build context directory
    pub context: PathBuf,
    /// Dockerfile path relative to the context root
    pub dockerfile: String,
    /// Target tag
    pub tag: String,
}

/// One record of the engine's build output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    /// Anything that is not a recognized record, passed through verbatim
    Line(String),
    /// `stream` field: log text
    Stream(String),
    /// `aux.ID` field: the built image id
    ImageId(String),
    /// `error` field: the build failed
    Error(String),
}

impl BuildEvent {
    /// Parse one newline-delimited JSON record
    pub fn parse_line(line: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(record) => Self::from_record(&record).unwrap_or_else(|| Self::Line(line.to_string())),
            Err(_) => Self::Line(line.to_string()),
        }
    }

    /// Classify a decoded record; `None` when no known field is present
    pub fn from_record(record: &serde_json::Value) -> Option<Self> {
        if let Some(err) = record.get("error").filter(|e| !e.is_null()) {
            let msg = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
            return Some(Self::Error(msg));
        }
        if let Some(stream) = record.get("stream").and_then(|s| s.as_str()) {
            return Some(Self::Stream(stream.to_string()));
        }
        record
            .get("aux")
            .and_then(|aux| aux.get("ID"))
            .and_then(|id| id.as_str())
            .map(|id| Self::ImageId(id.to_string()))
    }
}

/// Stream of build records
pub type BuildStream = Pin<Box<dyn Stream<Item = Result<BuildEvent>> + Send>>;

/// One progress record of an image pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullEvent {
    /// Layer id
    pub id: Option<String>,
    pub status: Option<String>,
    /// Progress bar text
    pub progress: Option<String>,
    pub error: Option<String>,
}

/// Stream of pull progress records
pub type PullStream = Pin<Box<dyn Stream<Item = Result<PullEvent>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_short() {
        let id = ContainerId::new("0123456789abcdef");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(ContainerId::new("abc").short(), "abc");
    }

    #[test]
    fn test_build_event_records() {
        assert_eq!(
            BuildEvent::parse_line(r#"{"stream":"step 1\n"}"#),
            BuildEvent::Stream("step 1\n".into())
        );
        assert_eq!(
            BuildEvent::parse_line(r#"{"aux":{"ID":"sha256:abc"}}"#),
            BuildEvent::ImageId("sha256:abc".into())
        );
        assert_eq!(
            BuildEvent::parse_line(r#"{"error":"boom","errorDetail":{"message":"boom"}}"#),
            BuildEvent::Error("boom".into())
        );
    }

    #[test]
    fn test_build_event_passthrough() {
        assert_eq!(
            BuildEvent::parse_line(r#"{"status":"Downloading"}"#),
            BuildEvent::Line(r#"{"status":"Downloading"}"#.into())
        );
        assert_eq!(
            BuildEvent::parse_line("not json at all"),
            BuildEvent::Line("not json at all".into())
        );
    }

    #[test]
    fn test_engine_info_label() {
        let info = EngineInfo {
            labels: vec!["provider=virtualbox".into(), "broken".into()],
            ..Default::default()
        };
        assert_eq!(info.label("provider"), Some("virtualbox"));
        assert_eq!(info.label("broken"), None);
    }

    #[test]
    fn test_spec_env_helpers() {
        let spec = ContainerSpec {
            env: vec![("A".into(), "1".into()), ("local".into(), "true".into())],
            ..Default::default()
        };
        assert_eq!(spec.env_strings(), vec!["A=1", "local=true"]);
        assert_eq!(spec.env_var("local"), Some("true"));
        assert_eq!(spec.env_var("missing"), None);
    }
}
