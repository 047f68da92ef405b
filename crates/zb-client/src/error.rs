//! Error types for the broker client

use std::path::PathBuf;
use std::time::Duration;
use zb_proto::CodecError;

/// Coarse classification of client failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    ResourceNotFound,
    InvalidFormat,
    Transport,
    Timeout,
    Broker,
}

/// Errors that can occur when talking to the broker
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource at the given path not found: {}", .0.display())]
    ResourceNotFound(PathBuf),

    #[error("Invalid document format: {0}")]
    InvalidFormat(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Broker rejected the command (code {code}): {message}")]
    Broker { code: u32, message: String },
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ClientError::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            ClientError::InvalidFormat(_) => ErrorKind::InvalidFormat,
            ClientError::Transport(_) => ErrorKind::Transport,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::Broker { .. } => ErrorKind::Broker,
        }
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<serde_yaml::Error> for ClientError {
    fn from(err: serde_yaml::Error) -> Self {
        ClientError::InvalidFormat(err.to_string())
    }
}

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;
