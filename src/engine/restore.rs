use std::sync::Arc;
use chrono::Utc;
use tracing::{debug, info, warn};
use crate::core::{CancelContext, FileHandle, PersistedUploadRecord, Result, UploadError, UploadId};
use super::EngineInner;
use super::state::{QueuedUpload, UploadRecord};

impl EngineInner {
    /// Startup housekeeping: expired, finished and unreadable records are
    /// removed before anything is restored.
    pub(crate) async fn prepare_store(&self) -> Result<()> {
        self.store.init().await?;

        let cutoff = Utc::now() - self.config.retention();
        let expired = self.store.delete_created_before(cutoff).await?;
        if !expired.is_empty() {
            info!(count = expired.len(), "Removed expired upload records");
        }

        for upload_id in self.store.list_ids().await? {
            match self.store.get(&upload_id).await {
                Ok(Some(record)) if record.is_complete() => {
                    debug!(upload_id = %upload_id, "Removing finished upload record");
                    self.store.delete(&upload_id).await?;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(upload_id = %upload_id, error = %err, "Removing unreadable upload record");
                    self.store.delete(&upload_id).await?;
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn restore_upload_from_storage(self: &Arc<Self>, upload_id: &UploadId) -> Result<bool> {
        if self.shutdown.is_cancelled() {
            return Err(UploadError::Shutdown);
        }
        if self.state.lock().contains(upload_id) {
            debug!(upload_id = %upload_id, "Upload already tracked, not restoring");
            return Ok(false);
        }

        let Some(record) = self.store.get(upload_id).await? else {
            return Ok(false);
        };
        if !is_restorable(&record) {
            warn!(upload_id = %upload_id, chunk = record.current_chunk, "Dropping upload record that cannot be resumed");
            self.persister.delete(upload_id.clone());
            return Ok(false);
        }

        let queued = restored_upload(record);
        let progress = {
            let mut state = self.state.lock();
            if state.contains(upload_id) {
                return Ok(false);
            }
            let progress = queued.progress();
            state.push_back(queued);
            progress
        };

        info!(
            upload_id = %upload_id,
            chunk = progress.uploaded_chunks,
            total_chunks = progress.total_chunks,
            "Upload restored"
        );
        self.events.status(progress);
        Ok(true)
    }

    /// Restores every stored upload, then releases them to the scheduler in
    /// store order. They start as slots allow.
    pub(crate) async fn restore_and_start_all_uploads(self: &Arc<Self>) -> Result<Vec<UploadId>> {
        let mut restored = Vec::new();
        for upload_id in self.store.list_ids().await? {
            match self.restore_upload_from_storage(&upload_id).await {
                Ok(true) => restored.push(upload_id),
                Ok(false) => {}
                Err(UploadError::Shutdown) => return Err(UploadError::Shutdown),
                Err(err) => warn!(upload_id = %upload_id, error = %err, "Failed to restore upload"),
            }
        }

        let released: Vec<_> = {
            let mut state = self.state.lock();
            restored
                .iter()
                .filter_map(|upload_id| {
                    let queued = state.pending.get_mut(upload_id)?;
                    queued.paused = false;
                    Some(queued.progress())
                })
                .collect()
        };
        for progress in released {
            self.events.status(progress);
        }

        if !restored.is_empty() {
            info!(count = restored.len(), "Restored uploads released to the scheduler");
        }
        self.trigger_pass();
        Ok(restored)
    }
}

/// A record can be resumed when its content survived and chunks remain.
fn is_restorable(record: &PersistedUploadRecord) -> bool {
    !record.is_complete()
        && record.session.chunk_size > 0
        && record.file_bytes.len() as u64 == record.file_size
}

/// Rebuilds a held queue entry from a stored record, with an in-memory file.
fn restored_upload(record: PersistedUploadRecord) -> QueuedUpload {
    let current_chunk = record.current_chunk.min(record.session.total_chunks);
    let uploaded_bytes = record.uploaded_bytes.min(record.file_size);
    let file = FileHandle::from_bytes(record.file_name, Some(record.file_type), record.file_bytes);

    let mut queued = QueuedUpload::new(UploadRecord {
        session: record.session,
        file,
        relative_path: record.relative_path,
        cancel: CancelContext::new(),
        persisted: true,
    });
    queued.restored_chunk = Some(current_chunk);
    queued.restored_bytes = Some(uploaded_bytes);
    queued.paused = true;
    queued
}
