//! Error types for fclocal-core

use fclocal_provider::ProviderError;
use thiserror::Error;

const TOOLBOX_UPGRADE_HINT: &str = "We detected that you are using docker toolbox. For a better experience, please upgrade 'docker for windows'.\nYou can refer to https://github.com/alibaba/funcraft/blob/master/docs/usage/installation.md.";

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] fclocal_config::ConfigError),

    #[error("Engine error: {0}")]
    Provider(#[from] ProviderError),

    #[error("invalid runtime name {0}")]
    UnsupportedRuntime(String),

    #[error("Please add directory '{}' to Docker File sharing list, more information please refer to https://github.com/alibaba/funcraft/blob/master/docs/usage/faq.md", .paths.join(", "))]
    PathNotShared { paths: Vec<String> },

    #[error("{}", TOOLBOX_UPGRADE_HINT)]
    LegacyBackendUnsupported,

    #[error("The default host machine path for docker toolbox is under 'C:\\Users', Please make sure your project is in this directory. If you want to mount other disk paths, please refer to https://github.com/alibaba/funcraft/blob/master/docs/usage/faq.md ({0})")]
    MountConfig(String),

    #[error("{0} More information please refer to https://docs.docker.com/docker-for-windows/#shared-drives")]
    DriveNotShared(String),

    #[error("{command} exited with code {exit_code}")]
    CommandExecution { command: String, exit_code: i64 },

    #[error("{0}")]
    StreamBuild(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Exit code carried by a failed command, if any
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            CoreError::CommandExecution { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_execution_message() {
        let err = CoreError::CommandExecution {
            command: "pip install -t /code/.fun/python flask".into(),
            exit_code: 3,
        };
        assert_eq!(
            err.to_string(),
            "pip install -t /code/.fun/python flask exited with code 3"
        );
        assert_eq!(err.exit_code(), Some(3));
    }

    #[test]
    fn test_path_not_shared_lists_paths() {
        let err = CoreError::PathNotShared {
            paths: vec!["/opt/code".into(), "/srv/nas".into()],
        };
        assert!(err.to_string().contains("'/opt/code, /srv/nas'"));
        assert_eq!(err.exit_code(), None);
    }
}
