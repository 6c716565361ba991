use std::fmt;
use std::time::Duration;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use super::errors::ErrorKind;

/// Server issued identifier of one file's upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UploadId(String);

impl UploadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UploadId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UploadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Transfer contract negotiated with the remote service. Never mutated after
/// the init call returns.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: UploadId,
    pub chunk_size: u64,
    pub total_chunks: u64,
    #[serde(default)]
    pub target_path: String,
}

impl UploadSession {
    /// Byte range `[start, end)` of chunk `index` for a file of `file_size` bytes.
    pub fn chunk_range(&self, index: u64, file_size: u64) -> (u64, u64) {
        let start = index.saturating_mul(self.chunk_size).min(file_size);
        let end = start.saturating_add(self.chunk_size).min(file_size);
        (start, end)
    }

    /// Bytes covered by the first `chunks` chunks.
    pub fn bytes_before(&self, chunks: u64, file_size: u64) -> u64 {
        chunks.saturating_mul(self.chunk_size).min(file_size)
    }
}

/// Lifecycle state of an upload record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Session created, waiting for a slot
    Initialized,
    Uploading,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Cancelled)
    }

    pub fn is_valid_transition(from: UploadStatus, to: UploadStatus) -> bool {
        use UploadStatus::*;

        match (from, to) {
            (_, Cancelled) => !from.is_terminal(),
            (Initialized, Uploading | Paused | Error) => true,
            (Uploading, Paused | Completed | Error) => true,
            (Paused, Uploading | Initialized | Error) => true,
            (Error, Initialized) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStatus::Initialized => "initialized",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Progress snapshot published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub upload_id: UploadId,
    pub file_name: String,
    /// Percentage in `[0, 100]`
    pub progress: f64,
    pub uploaded_chunks: u64,
    pub total_chunks: u64,
    pub uploaded_size: u64,
    pub total_size: u64,
    pub remaining_size: u64,
    /// Rendered ETA, `"0s"` when unknown
    pub estimated_time_remaining: String,
    pub status: UploadStatus,
    /// Bytes per second over the last sample interval
    pub speed: Option<f64>,
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// `upload-progress`
    Progress {
        upload_id: UploadId,
        progress: UploadProgress,
    },

    /// `upload-status-change`
    StatusChanged {
        upload_id: UploadId,
        status: UploadStatus,
        progress: UploadProgress,
    },

    /// `upload-auth-error`
    AuthError {
        upload_id: Option<UploadId>,
        message: String,
    },

    /// `upload-error`
    Error {
        upload_id: UploadId,
        kind: ErrorKind,
        message: String,
        progress: UploadProgress,
    },
}

impl UploadEvent {
    pub fn upload_id(&self) -> Option<&UploadId> {
        match self {
            UploadEvent::Progress { upload_id, .. }
            | UploadEvent::StatusChanged { upload_id, .. }
            | UploadEvent::Error { upload_id, .. } => Some(upload_id),
            UploadEvent::AuthError { upload_id, .. } => upload_id.as_ref(),
        }
    }

    /// Wire name used by UI bridges
    pub fn name(&self) -> &'static str {
        match self {
            UploadEvent::Progress { .. } => "upload-progress",
            UploadEvent::StatusChanged { .. } => "upload-status-change",
            UploadEvent::AuthError { .. } => "upload-auth-error",
            UploadEvent::Error { .. } => "upload-error",
        }
    }
}

/// Read-only view of one record for UI queries
#[derive(Debug, Clone)]
pub struct UploadSnapshot {
    pub upload_id: UploadId,
    pub relative_path: String,
    pub status: UploadStatus,
    pub progress: UploadProgress,
    pub error: Option<(ErrorKind, String)>,
}

/// Body of `POST /upload/chunked/init`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub file_name: String,
    pub file_size: u64,
    pub relative_path: String,
    pub chunk_size: u64,
}

/// Server acknowledgement of one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkAck {
    /// The server assembled the file after this chunk
    pub completed: bool,
}

/// Upload as reported by the status / list-active endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteUpload {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub uploaded_chunks: u64,
    pub total_chunks: u64,
    pub progress: f64,
    pub status: String,
}

/// Durable counterpart of an upload record.
///
/// `file_bytes` is kept out of the JSON metadata; stores decide where the
/// content lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUploadRecord {
    pub upload_id: UploadId,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub relative_path: String,
    #[serde(skip)]
    pub file_bytes: Bytes,
    pub session: UploadSession,
    pub current_chunk: u64,
    pub uploaded_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl PersistedUploadRecord {
    pub fn is_complete(&self) -> bool {
        self.current_chunk >= self.session.total_chunks
    }
}

// Event payloads cross task boundaries.
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<UploadEvent>();
    assert_send_sync::<UploadProgress>();
    assert_send_sync::<UploadSession>();
};

#[cfg(test)]
mod tests {
    use super::*;

    fn session(chunk_size: u64, total_chunks: u64) -> UploadSession {
        UploadSession {
            upload_id: "u1".into(),
            chunk_size,
            total_chunks,
            target_path: String::new(),
        }
    }

    #[test]
    fn test_chunk_range_last_chunk_is_short() {
        let s = session(4, 3);
        assert_eq!(s.chunk_range(0, 10), (0, 4));
        assert_eq!(s.chunk_range(2, 10), (8, 10));
        assert_eq!(s.chunk_range(3, 10), (10, 10));
        assert_eq!(s.bytes_before(2, 10), 8);
        assert_eq!(s.bytes_before(3, 10), 10);
    }

    #[test]
    fn test_status_transitions() {
        use UploadStatus::*;

        assert!(UploadStatus::is_valid_transition(Initialized, Uploading));
        assert!(UploadStatus::is_valid_transition(Uploading, Paused));
        assert!(UploadStatus::is_valid_transition(Paused, Uploading));
        assert!(UploadStatus::is_valid_transition(Uploading, Completed));
        assert!(UploadStatus::is_valid_transition(Error, Cancelled));

        assert!(!UploadStatus::is_valid_transition(Completed, Uploading));
        assert!(!UploadStatus::is_valid_transition(Cancelled, Cancelled));
        assert!(!UploadStatus::is_valid_transition(Completed, Cancelled));
    }

    #[test]
    fn test_session_wire_shape() {
        let json = r#"{"uploadId":"abc","chunkSize":2097152,"totalChunks":5,"targetPath":"/docs/a.bin"}"#;
        let s: UploadSession = serde_json::from_str(json).unwrap();
        assert_eq!(s.upload_id.as_str(), "abc");
        assert_eq!(s.total_chunks, 5);
        assert_eq!(serde_json::to_string(&UploadStatus::Paused).unwrap(), "\"paused\"");
    }
}
