use std::collections::HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use crate::core::{PersistedUploadRecord, Result, UploadId, UploadStore};
use super::index::CreatedIndex;

/// Process-local store. Survives engine restarts within one process only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<UploadId, PersistedUploadRecord>>,
    index: CreatedIndex,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, record: &PersistedUploadRecord) -> Result<()> {
        self.records.lock().insert(record.upload_id.clone(), record.clone());
        self.index.insert(&record.upload_id, record.created_at);
        Ok(())
    }

    async fn checkpoint(&self, upload_id: &UploadId, current_chunk: u64, uploaded_bytes: u64) -> Result<bool> {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(upload_id) else {
            return Ok(false);
        };

        if current_chunk >= record.current_chunk {
            record.current_chunk = current_chunk;
            record.uploaded_bytes = uploaded_bytes;
        }
        Ok(true)
    }

    async fn get(&self, upload_id: &UploadId) -> Result<Option<PersistedUploadRecord>> {
        Ok(self.records.lock().get(upload_id).cloned())
    }

    async fn delete(&self, upload_id: &UploadId) -> Result<()> {
        self.records.lock().remove(upload_id);
        self.index.remove(upload_id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<UploadId>> {
        Ok(self.index.ids())
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadId>> {
        let expired = self.index.before(cutoff);
        let mut records = self.records.lock();
        for upload_id in &expired {
            records.remove(upload_id);
            self.index.remove(upload_id);
        }
        Ok(expired)
    }
}
