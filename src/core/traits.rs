use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use super::errors::Result;
use super::file::FileHandle;
use super::types::{
    ChunkAck,
    InitRequest,
    PersistedUploadRecord,
    RemoteUpload,
    UploadId,
    UploadSession,
};

/// Called with the number of bytes of the current chunk handed to the
/// transport so far.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Remote chunked-upload service.
///
/// Implementations map transport failures onto the error taxonomy:
/// unauthorized responses become `AuthenticationRequired`, a rejected init
/// becomes `InitializationFailed`, a finalization failure reported by the
/// chunk endpoint becomes `FinalizationFailed`.
#[async_trait]
pub trait UploadService: Send + Sync {
    async fn init(&self, request: &InitRequest) -> Result<UploadSession>;

    async fn upload_chunk(
        &self,
        upload_id: &UploadId,
        chunk_index: u64,
        data: Bytes,
        progress: ProgressCallback,
    ) -> Result<ChunkAck>;

    async fn pause(&self, upload_id: &UploadId) -> Result<()>;

    /// Returns the chunk indices the server has not received yet.
    async fn resume(&self, upload_id: &UploadId) -> Result<Vec<u64>>;

    async fn cancel(&self, upload_id: &UploadId) -> Result<()>;

    async fn cancel_all(&self) -> Result<()>;

    async fn status(&self, upload_id: &UploadId) -> Result<RemoteUpload>;

    async fn list_active(&self) -> Result<Vec<RemoteUpload>>;
}

/// Durable key-value store of upload records, keyed by upload id.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Prepares the backing storage and loads its indexes.
    async fn init(&self) -> Result<()>;

    /// Inserts or replaces a record together with its file bytes.
    async fn put(&self, record: &PersistedUploadRecord) -> Result<()>;

    /// Like [`UploadStore::put`], with the content taken from `content`
    /// unless the record already carries it. Stores that keep content on
    /// disk should stream it rather than buffer the whole file.
    async fn put_with_content(&self, record: &PersistedUploadRecord, content: &FileHandle) -> Result<()> {
        if !record.file_bytes.is_empty() || content.size() == 0 {
            return self.put(record).await;
        }
        let mut record = record.clone();
        record.file_bytes = content.read_all().await?;
        self.put(&record).await
    }

    /// Moves the checkpoint of an existing record forward. Returns `false`
    /// when the record does not exist. Checkpoints older than the stored one
    /// are ignored.
    async fn checkpoint(&self, upload_id: &UploadId, current_chunk: u64, uploaded_bytes: u64) -> Result<bool>;

    async fn get(&self, upload_id: &UploadId) -> Result<Option<PersistedUploadRecord>>;

    async fn delete(&self, upload_id: &UploadId) -> Result<()>;

    /// Ids of every stored record, oldest first.
    async fn list_ids(&self) -> Result<Vec<UploadId>>;

    /// Deletes records created before `cutoff`, returning their ids.
    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadId>>;
}
