use serde::{Deserialize, Serialize};
use thiserror::Error;
use super::types::UploadId;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Upload initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Chunk transfer failed: {0}")]
    TransferFailed(String),

    #[error("Finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("HTTP Request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Server error: status code {status_code}, message: {message}")]
    ServerError {
        status_code: u16,
        message: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Upload not found: {0}")]
    NotFound(UploadId),

    #[error("Cannot {action} upload {upload_id} in state {state}")]
    InvalidState {
        upload_id: UploadId,
        action: &'static str,
        state: String,
    },

    #[error("Engine shut down")]
    Shutdown,
}

impl UploadError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status_code,
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn invalid_state(upload_id: &UploadId, action: &'static str, state: impl ToString) -> Self {
        Self::InvalidState {
            upload_id: upload_id.clone(),
            action,
            state: state.to_string(),
        }
    }

    /// Classification used by events and by the worker's error handler.
    ///
    /// Anything that is not one of the named protocol failures is a
    /// recoverable transfer failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationRequired => ErrorKind::AuthenticationRequired,
            Self::InitializationFailed(_) => ErrorKind::InitializationFailed,
            Self::FinalizationFailed(_) => ErrorKind::FinalizationFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::TransferFailed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Human readable detail without the kind prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::InitializationFailed(detail)
            | Self::TransferFailed(detail)
            | Self::FinalizationFailed(detail) => detail.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AuthenticationRequired,
    InitializationFailed,
    TransferFailed,
    FinalizationFailed,
    Cancelled,
}

impl ErrorKind {
    /// Whether the user can get the file uploaded without re-authenticating.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::TransferFailed | ErrorKind::FinalizationFailed)
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(UploadError::AuthenticationRequired.kind(), ErrorKind::AuthenticationRequired);
        assert_eq!(UploadError::FinalizationFailed("x".into()).kind(), ErrorKind::FinalizationFailed);
        assert_eq!(UploadError::server_error(502, "bad gateway").kind(), ErrorKind::TransferFailed);
        assert_eq!(UploadError::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(UploadError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(ErrorKind::TransferFailed.is_recoverable());
        assert!(ErrorKind::FinalizationFailed.is_recoverable());
        assert!(!ErrorKind::AuthenticationRequired.is_recoverable());
        assert!(!ErrorKind::InitializationFailed.is_recoverable());
    }

    #[test]
    fn test_detail_strips_prefix() {
        let err = UploadError::TransferFailed("connection reset".into());
        assert_eq!(err.detail(), "connection reset");
        assert_eq!(err.to_string(), "Chunk transfer failed: connection reset");
    }
}
