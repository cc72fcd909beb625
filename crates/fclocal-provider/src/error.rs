//! Error types for container engines

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to connect to container engine: {0}")]
    ConnectionError(String),

    /// Engine answered 404 for a container, image or exec
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Build failed: {0}")]
    BuildError(String),

    #[error("Pull failed: {0}")]
    PullError(String),

    #[error("Exec failed: {0}")]
    ExecError(String),

    /// Error reported by the engine API, message kept verbatim
    #[error("{0}")]
    Api(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for ProviderError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => ProviderError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError { message, .. } => {
                ProviderError::Api(message)
            }
            other => ProviderError::Api(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
