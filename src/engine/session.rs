use std::sync::Arc;
use tracing::{debug, warn};
use crate::core::{FileHandle, InitRequest, Result, UploadError, UploadService, UploadSession};

/// Negotiates upload sessions with the remote service.
#[derive(Clone)]
pub struct SessionInitiator {
    service: Arc<dyn UploadService>,
    chunk_size: u64,
}

impl SessionInitiator {
    pub fn new(service: Arc<dyn UploadService>, chunk_size: u64) -> Self {
        Self { service, chunk_size }
    }

    pub fn request_for(&self, file: &FileHandle, relative_path: &str) -> InitRequest {
        InitRequest {
            file_name: file.name().to_string(),
            file_size: file.size(),
            relative_path: relative_path.to_string(),
            chunk_size: self.chunk_size,
        }
    }

    /// Calls the init endpoint and checks the returned contract.
    ///
    /// Authentication failures are returned as is; anything else the
    /// service reports is an initialization failure.
    pub async fn initialize(&self, file: &FileHandle, relative_path: &str) -> Result<UploadSession> {
        let request = self.request_for(file, relative_path);
        let session = self.service.init(&request).await.map_err(|err| match err {
            UploadError::AuthenticationRequired | UploadError::InitializationFailed(_) => err,
            other => UploadError::InitializationFailed(other.detail()),
        })?;

        validate(&session, file.size()).inspect_err(|err| {
            warn!(file = %file.name(), error = %err, "Rejected upload session");
        })?;

        debug!(
            upload_id = %session.upload_id,
            chunk_size = session.chunk_size,
            total_chunks = session.total_chunks,
            "Upload session created"
        );
        Ok(session)
    }
}

fn validate(session: &UploadSession, file_size: u64) -> Result<()> {
    if session.upload_id.as_str().is_empty() {
        return Err(UploadError::InitializationFailed("empty upload id".to_string()));
    }
    if session.chunk_size == 0 {
        return Err(UploadError::InitializationFailed("chunk size is zero".to_string()));
    }

    let needed = file_size.div_ceil(session.chunk_size);
    if session.total_chunks < needed {
        return Err(UploadError::InitializationFailed(format!(
            "{} chunks of {} bytes cannot hold {} bytes",
            session.total_chunks, session.chunk_size, file_size
        )));
    }
    Ok(())
}

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
    fn test_validate_session() {
        assert!(validate(&session(4, 3), 10).is_ok());
        assert!(validate(&session(4, 2), 10).is_err());
        assert!(validate(&session(0, 3), 10).is_err());
        assert!(validate(&session(4, 0), 0).is_ok());
    }
}
